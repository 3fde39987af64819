//! Syrah Agent Binary Entry Point

use clap::Parser;
use syrah_agent::{logging::init_logging, run_agent, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.logging_config())?;

    tokio::select! {
        result = run_agent(args) => {
            if let Err(e) = &result {
                tracing::error!("Syrah agent failed: {:#}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping Syrah agent...");
        }
    }

    Ok(())
}
