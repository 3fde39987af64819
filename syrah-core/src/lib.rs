//! Syrah Core Library
//!
//! Rule engine, held-flow registry and WebSocket control bridge for the
//! Syrah intercepting proxy. The interception engine calls the hooks in
//! [`Interceptor`]; remote clients attach to the [`Bridge`] to watch traffic,
//! resume or kill paused flows and push new rules.

pub mod bridge;
pub mod broadcaster;
pub mod ca;
pub mod codec;
pub mod dispatcher;
pub mod flow;
pub mod handlers;
pub mod interceptor;
pub mod matcher;
pub mod proxy;
pub mod registry;
pub mod rules;

/// Configuration types and utilities
pub mod config;

/// Error types for bridge and proxy operations
pub mod error;

pub use bridge::{Bridge, BridgeHandle, ConnectionState};
pub use broadcaster::{EventBroadcaster, PeerRegistry};
pub use ca::CertificateAuthority;
pub use codec::{Command, EventPhase, FlowModifications, Reply};
pub use config::{BridgeConfig, ProxyStartupConfig, DEFAULT_BRIDGE_PORT};
pub use dispatcher::CommandDispatcher;
pub use error::{BridgeError, DecodeError, MapLocalError, RegistryError};
pub use flow::{Flow, FlowRequest, FlowResponse, Headers};
pub use handlers::FlowHandler;
pub use interceptor::{HookOutcome, Interceptor};
pub use matcher::UrlGlob;
pub use proxy::ProxyServer;
pub use registry::{InterceptionRegistry, PendingFlow, Verdict};
pub use rules::{Phase, Rule, RuleSet, RuleStore, RuleType};

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
