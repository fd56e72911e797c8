//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries and test harnesses
//! call [`init_tracing`] once to route them somewhere.

use rowkeep_core::ConfigError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "rowkeep_storage=debug,info";

/// Log output settings from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: std::env::var("ROWKEEP_LOG_FORMAT")
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            service_name: std::env::var("ROWKEEP_SERVICE_NAME")
                .unwrap_or_else(|_| "rowkeep".to_string()),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), ConfigError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    installed.map_err(|e| ConfigError::InvalidValue {
        field: "telemetry".to_string(),
        value: config.service_name.clone(),
        reason: format!("Failed to init subscriber: {}", e),
    })?;

    tracing::info!(
        service_name = %config.service_name,
        json = config.json,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig {
            json: true,
            service_name: "rowkeep-test".to_string(),
        };
        // Another test in this binary may have installed one first.
        let _ = init_tracing(&config);
        let err = init_tracing(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "telemetry"));
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
