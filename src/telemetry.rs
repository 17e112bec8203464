//! Logging initialisation
//!
//! Level priority:
//! 1. `RUST_LOG` environment variable, if set
//! 2. the `[log]` section of the configuration file
//! 3. `info`
//!
//! Output formats are `pretty` (default), `compact` and `json`.

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// `[log]` section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// Output format: pretty, compact, json
    pub format: String,
}

impl LogConfig {
    /// Info level, pretty output
    pub fn new() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }

    /// Same format at debug level, for `-v`
    pub fn verbose(&self) -> Self {
        Self {
            level: "debug".to_string(),
            format: self.format.clone(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global subscriber
///
/// Calling it more than once keeps the first subscriber.
pub fn init_logging(config: Option<&LogConfig>) {
    let defaults = LogConfig::new();
    let config = config.unwrap_or(&defaults);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::default().add_directive(parse_level(&config.level).into()),
    };

    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.format.as_str() {
        "json" => fmt::layer().json().boxed(),
        "compact" => fmt::layer().compact().boxed(),
        _ => fmt::layer().boxed(),
    };

    let _ = tracing_subscriber::registry().with(output).with(filter).try_init();
}

/// Parse a level name in any case, falling back to info
fn parse_level(level: &str) -> Level {
    level.parse().unwrap_or(Level::INFO)
}
