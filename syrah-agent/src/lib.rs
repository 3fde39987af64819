//! Syrah Agent
//!
//! Standalone executable that runs the intercepting proxy with the Syrah
//! control bridge attached.

use anyhow::Context;
use clap::Parser;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use syrah_core::{Bridge, BridgeConfig, CertificateAuthority, ProxyServer, ProxyStartupConfig};

pub mod logging;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on for HTTP/HTTPS traffic
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_addr: IpAddr,

    /// Port to listen on for HTTP/HTTPS traffic
    #[arg(long, default_value_t = 8080)]
    pub listen_port: u16,

    /// Port of the Syrah WebSocket bridge. Overrides the config file.
    #[arg(long)]
    pub syrah_port: Option<u16>,

    /// JSON file with bridge settings (listen address, queue sizes, timeouts)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory holding the CA certificate and key, created if missing
    #[arg(long, default_value = "./certs")]
    pub cert_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

impl Args {
    pub fn proxy_config(&self) -> ProxyStartupConfig {
        ProxyStartupConfig {
            listen_address: self.listen_addr,
            listen_port: self.listen_port,
            cert_dir: self.cert_dir.clone(),
        }
    }

    pub fn logging_config(&self) -> logging::LoggingConfig {
        logging::LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.json_logs,
            ..Default::default()
        }
    }
}

/// Bridge settings: file (if any), then the `--syrah-port` override.
pub fn load_bridge_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => read_bridge_config(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(port) = args.syrah_port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

fn read_bridge_config(path: &Path) -> anyhow::Result<BridgeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Start the bridge, then the proxy. Returns when the proxy stops.
pub async fn run_agent(args: Args) -> anyhow::Result<()> {
    let bridge = Bridge::new(load_bridge_config(&args)?);
    let proxy_config = args.proxy_config();

    tracing::info!("Starting Syrah Agent...");
    tracing::info!("  Proxy:  {}", proxy_config.socket_addr());
    tracing::info!("  Bridge: {}", bridge.config().socket_addr());

    // bind failure is fatal
    let handle = bridge.start().await.context("Failed to start Syrah bridge")?;

    let ca = CertificateAuthority::load_or_create(&proxy_config.cert_dir)
        .context("Failed to initialise CA")?;
    tracing::info!("CA certificate: {}", ca.cert_path().display());

    let result = ProxyServer::new(proxy_config, ca, bridge.interceptor())
        .run()
        .await
        .context("Proxy server failed");
    handle.stop().await;
    result
}
