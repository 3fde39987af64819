//! Configuration types and utilities

use crate::error::BridgeError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default port of the control bridge.
pub const DEFAULT_BRIDGE_PORT: u16 = 9999;

/// Control bridge configuration.
///
/// Read once by [`crate::Bridge::start`]; changing it only affects the next start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the bridge listens on. All interfaces by default so that
    /// clients on other devices can attach.
    pub listen_address: IpAddr,
    /// Port the bridge listens on
    pub port: u16,
    /// Capacity of the engine -> bridge event queue. Events are dropped when full.
    pub event_queue_capacity: usize,
    /// Capacity of each peer's outbound queue. A peer whose queue fills up is disconnected.
    pub peer_queue_capacity: usize,
    /// Upper bound on a single map-local file read
    pub map_local_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_BRIDGE_PORT,
            event_queue_capacity: 1024,
            peer_queue_capacity: 256,
            map_local_timeout_ms: 5000,
        }
    }
}

impl BridgeConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.port)
    }

    pub fn map_local_timeout(&self) -> Duration {
        Duration::from_millis(self.map_local_timeout_ms)
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.event_queue_capacity == 0 {
            return Err(BridgeError::Configuration(
                "event_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.peer_queue_capacity == 0 {
            return Err(BridgeError::Configuration(
                "peer_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Static proxy startup configuration.
/// These settings are set at startup and do not change during runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStartupConfig {
    /// Address to listen on
    pub listen_address: IpAddr,
    /// Port to listen on
    pub listen_port: u16,
    /// Directory holding the root CA (`ca.pem` / `ca.key`)
    pub cert_dir: PathBuf,
}

impl Default for ProxyStartupConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 8080,
            cert_dir: PathBuf::from("./certs"),
        }
    }
}

impl ProxyStartupConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }
}
