use anyhow::Context;
use std::collections::BTreeMap;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration for the agent
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to emit JSON formatted logs
    pub json_format: bool,

    /// Module-specific log levels
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = BTreeMap::new();

        // hudsucker and its http stack are chatty at info
        module_levels.insert("hudsucker".to_string(), "warn".to_string());
        module_levels.insert("hyper".to_string(), "warn".to_string());
        module_levels.insert("rustls".to_string(), "warn".to_string());
        module_levels.insert("tungstenite".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            module_levels,
        }
    }
}

impl LoggingConfig {
    pub fn build_filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)
            .with_context(|| format!("Invalid log level: {}", self.level))?;
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level);
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Invalid log directive: {}", directive))?,
            );
        }
        Ok(filter)
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = config.build_filter()?;
    let layer = if config.json_format {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    match tracing_subscriber::registry().with(filter).with(layer).try_init() {
        Ok(()) => tracing::info!("Logging initialized with level: {}", config.level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }
    Ok(())
}
