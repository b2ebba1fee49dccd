use agent_market::{config::AppConfig, http::settlement_router, logging::init_tracing, LedgerGateway};
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "settlement")]
#[command(about = "Settlement service: in-memory ledger with idempotent transfers")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, default_value = "8002")]
    port: u16,

    /// Balance every account starts with; overrides settlement.opening_balance
    #[arg(long, env = "OPENING_BALANCE")]
    opening_balance: Option<Decimal>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    init_tracing(&config.logging)?;

    let opening_balance = args.opening_balance.unwrap_or(config.settlement.opening_balance);
    let ledger = Arc::new(LedgerGateway::with_opening_balance(opening_balance));
    let app = settlement_router(ledger);

    let address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&address).await?;
    info!(%opening_balance, "Settlement service listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
