use crate::{
    ca::CertificateAuthority, config::ProxyStartupConfig, error::BridgeError, handlers::FlowHandler,
    interceptor::Interceptor, Result,
};
use hudsucker::{certificate_authority::RcgenAuthority, rustls, ProxyBuilder};
use std::future::Future;
use tracing::info;

/// Cache size for generated per-host certificates
const CERT_CACHE_SIZE: u64 = 1000;

/// The interception engine: a MITM proxy whose traffic runs through the
/// bridge's hooks.
pub struct ProxyServer {
    config: ProxyStartupConfig,
    ca: CertificateAuthority,
    interceptor: Interceptor,
}

impl ProxyServer {
    pub fn new(config: ProxyStartupConfig, ca: CertificateAuthority, interceptor: Interceptor) -> Self {
        Self {
            config,
            ca,
            interceptor,
        }
    }

    /// Serve until the process exits.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.socket_addr();

        // hudsucker's rustls wants DER, not PEM
        let private_key = rustls::PrivateKey(self.ca.key_der());
        let ca_cert = rustls::Certificate(self.ca.cert_der()?);
        let authority = RcgenAuthority::new(private_key, ca_cert, CERT_CACHE_SIZE)
            .map_err(|e| BridgeError::Certificate(format!("Failed to create CA authority: {}", e)))?;

        let proxy = ProxyBuilder::new()
            .with_addr(addr)
            .with_rustls_client()
            .with_ca(authority)
            .with_http_handler(FlowHandler::new(self.interceptor))
            .build();

        info!("Starting proxy server on {}", addr);
        proxy
            .start(shutdown)
            .await
            .map_err(|e| BridgeError::Proxy(format!("Proxy failed: {}", e)))?;
        info!("Proxy server stopped");
        Ok(())
    }
}
