//! Log output setup.
//!
//! The server's own level applies to every spillway crate. The transport
//! layer follows it only at `debug`, `warn` and `error`; at other levels
//! it keeps its quieter default of `warn`.

use tracing_subscriber::EnvFilter;

use crate::config::{LogLevel, LoggingConfig};

const TRANSPORT_TARGET: &str = "spillway_transport";
const TRANSPORT_DEFAULT: LogLevel = LogLevel::Warn;

impl LoggingConfig {
    /// Level the transport layer logs at under this configuration.
    pub fn transport_level(&self) -> LogLevel {
        match self.level {
            LogLevel::Debug | LogLevel::Warn | LogLevel::Error => self.level,
            LogLevel::Info | LogLevel::Trace => TRANSPORT_DEFAULT,
        }
    }

    /// `EnvFilter` directives for this configuration.
    pub fn filter_directives(&self) -> String {
        format!(
            "{},{}={}",
            self.level.as_str(),
            TRANSPORT_TARGET,
            self.transport_level().as_str()
        )
    }
}

/// Install a global `fmt` subscriber.
///
/// Returns `false` if a subscriber was already installed, which is not an
/// error: tests and embedding programs may call this repeatedly.
pub fn init(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.filter_directives()))
        .with_target(true)
        .try_init()
        .is_ok()
}
