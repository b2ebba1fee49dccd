use agent_market::{
    config::AppConfig,
    discovery::HttpDiscovery,
    llm::advisor_from_config,
    logging::init_tracing,
    orchestration::{PaymentLedger, SettlementOrchestrator},
    settlement::HttpSettlementGateway,
    transport::{HttpTransport, MessageTransport},
    BuyerAgent, PurchaseIntent,
};
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "buyer-agent")]
#[command(about = "Buyer agent: discovers sellers, negotiates and pays")]
struct Args {
    /// What to buy, in free text
    description: String,

    #[arg(short, long)]
    budget: Decimal,

    #[arg(long, default_value = "USD")]
    currency: String,

    #[arg(long)]
    category: Option<String>,

    /// Price the opening offer is derived from (defaults to the asking price)
    #[arg(long)]
    anchor: Option<Decimal>,

    #[arg(short, long, default_value = "buyer-1", env = "BUYER_IDENTITY")]
    identity: String,

    /// Credit the buyer's settlement account before purchasing
    #[arg(long)]
    fund: Option<Decimal>,

    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(long)]
    discovery_endpoint: Option<String>,

    #[arg(long)]
    settlement_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(endpoint) = args.discovery_endpoint {
        config.discovery.endpoint = endpoint;
    }
    if let Some(endpoint) = args.settlement_endpoint {
        config.settlement.endpoint = endpoint;
    }
    init_tracing(&config.logging)?;

    let discovery = HttpDiscovery::new(
        &config.discovery.endpoint,
        Duration::from_secs(config.discovery.timeout_seconds),
    )?;
    let gateway = Arc::new(HttpSettlementGateway::new(
        &config.settlement.endpoint,
        Duration::from_secs(config.settlement.timeout_seconds),
    )?);
    if let Some(amount) = args.fund {
        let balance = gateway.fund(&args.identity, &args.currency, amount).await?;
        info!(account = %args.identity, %balance, "account funded");
    }

    let transport: Arc<dyn MessageTransport> =
        Arc::new(HttpTransport::new(config.negotiation.message_timeout())?);
    let orchestrator = Arc::new(
        SettlementOrchestrator::new(
            transport.clone(),
            gateway,
            Arc::new(PaymentLedger::with_retention(config.settlement.record_retention())),
        )
            .with_call_policy(
                Duration::from_secs(config.settlement.timeout_seconds),
                config.retry.policy(),
            ),
    );

    let buyer = BuyerAgent::new(
        args.identity,
        Arc::new(discovery),
        transport,
        advisor_from_config(&config)?,
        orchestrator,
    )
    .with_capability(config.discovery.capability.clone())
    .with_negotiation(&config.negotiation)
    .with_call_policy(config.negotiation.message_timeout(), config.retry.policy());

    let state = buyer
        .run(PurchaseIntent {
            description: args.description,
            category: args.category,
            budget: args.budget,
            currency: args.currency,
            anchor_price: args.anchor,
        })
        .await;

    let trail: Vec<String> = state.trail.iter().map(|s| s.to_string()).collect();
    info!(trail = %trail.join(" -> "), "purchase finished");
    if let Some(failure) = &state.failure {
        anyhow::bail!("purchase failed during {}: {}", failure.step, failure.error);
    }
    let receipt = state.into_result()?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}
