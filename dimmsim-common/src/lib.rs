//! dimmsim Common Library
//!
//! Shared plumbing for the dimmsim field device simulator:
//!
//! - [`config`] - Settings loading (JSON5 format) and the logging section
//! - [`error`] - Error types
//!
//! A binary typically loads its settings with [`load_config`], applies any
//! command line overrides to the [`LoggingConfig`] it contains and then calls
//! [`init_tracing`] once, before spawning any service.

pub mod config;
pub mod error;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use error::{Error, Result};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when it is set, otherwise from
/// `config.level`, which accepts full `EnvFilter` directives such as
/// `"info,mqtt_bridge_modbus::bridge=debug"`. Output is plain text or one
/// JSON object per event, depending on `config.format`.
///
/// Fails if the level cannot be parsed or a global subscriber is already
/// installed.
///
/// # Example
///
/// ```ignore
/// use dimmsim_common::{LogFormat, LoggingConfig, init_tracing};
///
/// let logging = LoggingConfig {
///     level: "debug".to_string(),
///     format: LogFormat::Json,
/// }
/// .with_level_override(Some("trace"));
/// init_tracing(&logging)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*};

    let filter = env_filter(config)?;
    let json = config.format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with((!json).then(|| fmt::layer()))
        .with(json.then(|| fmt::layer().json()))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(&config.level)
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", config.level, e)))
}
