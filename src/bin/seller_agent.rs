use agent_market::{
    config::AppConfig,
    database::SqliteListingStore,
    discovery::{DiscoveryGateway, HttpDiscovery, RegisterRequest},
    http::seller_router,
    llm::advisor_from_config,
    logging::init_tracing,
    model::NewListing,
    settlement::HttpSettlementGateway,
    SellerAgent,
};
use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "seller-agent")]
#[command(about = "Seller agent: lists a catalog and answers buyer offers")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// YAML catalog of listings to publish on startup
    #[arg(long, env = "SELLER_CATALOG")]
    catalog: Option<PathBuf>,

    #[arg(short, long, default_value = "seller-1", env = "SELLER_IDENTITY")]
    identity: String,

    #[arg(short, long)]
    database_url: Option<String>,

    #[arg(long)]
    discovery_endpoint: Option<String>,

    #[arg(long)]
    settlement_endpoint: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    #[serde(flatten)]
    listing: NewListing,
}

fn load_catalog(path: &PathBuf) -> anyhow::Result<Vec<CatalogEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog {}", path.display()))?;
    let entries: Vec<CatalogEntry> =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing catalog {}", path.display()))?;
    Ok(entries)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(endpoint) = args.discovery_endpoint {
        config.discovery.endpoint = endpoint;
    }
    if let Some(endpoint) = args.settlement_endpoint {
        config.settlement.endpoint = endpoint;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    init_tracing(&config.logging)?;

    let store = SqliteListingStore::with_options(
        &config.database.url,
        config.database.max_connections,
        Duration::from_millis(config.database.busy_timeout_ms),
    )
    .await?;
    let gateway = HttpSettlementGateway::new(
        &config.settlement.endpoint,
        Duration::from_secs(config.settlement.timeout_seconds),
    )?;

    let seller = Arc::new(
        SellerAgent::new(
            args.identity.clone(),
            Arc::new(store),
            advisor_from_config(&config)?,
            Arc::new(gateway),
        )
        .with_max_rounds(config.negotiation.max_rounds)
        .with_call_policy(config.negotiation.message_timeout(), config.retry.policy())
        .with_settlement_ttl(config.negotiation.settlement_ttl()),
    );

    if let Some(path) = &args.catalog {
        for entry in load_catalog(path)? {
            let listing = seller.list(&entry.id, entry.listing).await?;
            info!(listing_id = %listing.id, price = %listing.price, "listing published");
        }
    }

    let discovery = HttpDiscovery::new(
        &config.discovery.endpoint,
        Duration::from_secs(config.discovery.timeout_seconds),
    )?;
    let registration = RegisterRequest {
        agent_identity: args.identity.clone(),
        endpoint: config.public_endpoint(),
        capabilities: vec![config.discovery.capability.clone()],
    };
    let retry = config.retry.policy();
    match retry
        .run("discovery.register", || discovery.register(registration.clone()))
        .await
    {
        Ok(entry) => info!(endpoint = %entry.endpoint, "registered with discovery"),
        Err(e) => warn!("could not register with discovery at {}: {}", discovery.endpoint(), e),
    }

    let ttl = config.negotiation.reservation_ttl();
    let sweeper = seller.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval((ttl / 4).max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            match sweeper.release_expired_reservations(ttl).await {
                Ok(released) if !released.is_empty() => info!(?released, "expired reservations released"),
                Ok(_) => {}
                Err(e) => warn!("reservation sweep failed: {}", e),
            }
        }
    });

    let app = seller_router(seller);
    let address = config.get_server_address();
    let listener = TcpListener::bind(&address).await?;
    info!(identity = %args.identity, "Seller agent listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Err(e) = discovery.deregister(&args.identity).await {
        warn!("deregistration failed: {}", e);
    }
    Ok(())
}
