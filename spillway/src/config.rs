//! Configuration for the RPC substrate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use spillway_core::{Protocol, RpcError};
use spillway_transport::{InitOptions, ProgressMode};
use thiserror::Error;

use crate::peers::ConnectPolicy;

/// Errors loading or validating an [`RpcConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be parsed.
    #[error("invalid rpc configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value the substrate cannot run with.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl From<ConfigError> for RpcError {
    fn from(err: ConfigError) -> Self {
        RpcError::InvalidConfig(err.to_string())
    }
}

/// Tunables of the server RPC substrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Prefer `ofi+tcp` over `ofi+verbs` for the remote domain.
    pub use_tcp: bool,

    /// Connect to peer servers on first use instead of at startup.
    pub lazy_connect: bool,

    /// Handler pool size for the local (client-facing) endpoint.
    pub client_server_pool_size: usize,

    /// Handler pool size for the remote (server-facing) endpoint.
    pub server_server_pool_size: usize,

    /// Deadline for timed calls to clients, in milliseconds.
    pub client_server_timeout_ms: u64,

    /// Deadline for calls to peer servers, in milliseconds.
    pub server_server_timeout_ms: u64,

    /// Drive transport progress from a dedicated background thread.
    pub use_progress_thread: bool,

    /// Log output settings.
    pub logging: LoggingConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            use_tcp: true,
            lazy_connect: false,
            client_server_pool_size: 4,
            server_server_pool_size: 4,
            client_server_timeout_ms: 5_000,
            server_server_timeout_ms: 15_000,
            use_progress_thread: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl RpcConfig {
    /// Short deadlines and caller-driven progress, for tests.
    pub fn testing() -> Self {
        Self {
            client_server_pool_size: 1,
            server_server_pool_size: 1,
            client_server_timeout_ms: 200,
            server_server_timeout_ms: 500,
            use_progress_thread: false,
            logging: LoggingConfig {
                level: LogLevel::Debug,
            },
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RpcConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the substrate cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_server_pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "client_server_pool_size",
                reason: "must be at least 1",
            });
        }
        if self.server_server_pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "server_server_pool_size",
                reason: "must be at least 1",
            });
        }
        if self.client_server_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "client_server_timeout_ms",
                reason: "must be positive",
            });
        }
        if self.server_server_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "server_server_timeout_ms",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// Select the primary remote protocol.
    pub fn with_tcp(mut self, use_tcp: bool) -> Self {
        self.use_tcp = use_tcp;
        self
    }

    /// Select lazy or eager peer connection.
    pub fn with_lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = lazy;
        self
    }

    /// Set handler pool sizes for the local and remote endpoints.
    pub fn with_pool_sizes(mut self, client_server: usize, server_server: usize) -> Self {
        self.client_server_pool_size = client_server;
        self.server_server_pool_size = server_server;
        self
    }

    /// Set the client-facing and peer-facing call deadlines.
    pub fn with_timeouts(mut self, client_server: Duration, server_server: Duration) -> Self {
        self.client_server_timeout_ms = client_server.as_millis() as u64;
        self.server_server_timeout_ms = server_server.as_millis() as u64;
        self
    }

    /// Choose between a dedicated progress thread and caller-driven progress.
    pub fn with_progress_thread(mut self, enabled: bool) -> Self {
        self.use_progress_thread = enabled;
        self
    }

    /// Set the log level.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.logging.level = level;
        self
    }

    /// Peer connection policy.
    pub fn connect_policy(&self) -> ConnectPolicy {
        if self.lazy_connect {
            ConnectPolicy::Lazy
        } else {
            ConnectPolicy::Eager
        }
    }

    /// Transport progress model.
    pub fn progress_mode(&self) -> ProgressMode {
        if self.use_progress_thread {
            ProgressMode::Dedicated
        } else {
            ProgressMode::Caller
        }
    }

    /// Protocols tried, in order, for the local endpoint.
    pub fn local_protocol_candidates(&self) -> Vec<Protocol> {
        vec![Protocol::SharedMemory]
    }

    /// Protocols tried, in order, for the remote endpoint.
    pub fn remote_protocol_candidates(&self) -> Vec<Protocol> {
        let primary = if self.use_tcp {
            Protocol::OfiTcp
        } else {
            Protocol::OfiVerbs
        };
        vec![primary, Protocol::OfiSockets, Protocol::BmiTcp]
    }

    /// Deadline for timed client notifications.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_server_timeout_ms)
    }

    /// Deadline for peer calls.
    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_server_timeout_ms)
    }

    /// Longest shutdown waits for in-flight calls before abandoning them.
    pub fn drain_timeout(&self) -> Duration {
        self.client_timeout().max(self.server_timeout())
    }

    /// Transport options for the local endpoint.
    pub fn local_init_options(&self) -> InitOptions {
        InitOptions {
            progress: self.progress_mode(),
            pool_size: self.client_server_pool_size,
        }
    }

    /// Transport options for the remote endpoint.
    pub fn remote_init_options(&self) -> InitOptions {
        InitOptions {
            progress: self.progress_mode(),
            pool_size: self.server_server_pool_size,
        }
    }
}

/// Severity threshold for log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages and above.
    #[default]
    Info,
    /// Debug output and above.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    /// Directive name understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Equivalent `tracing` level.
    pub const fn to_tracing(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level emitted by the server.
    pub level: LogLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_tunables() {
        let config = RpcConfig::default();
        assert!(config.use_tcp);
        assert!(!config.lazy_connect);
        assert_eq!(config.client_server_pool_size, 4);
        assert_eq!(config.server_server_pool_size, 4);
        assert_eq!(config.client_timeout(), Duration::from_secs(5));
        assert_eq!(config.server_timeout(), Duration::from_secs(15));
        assert_eq!(config.drain_timeout(), Duration::from_secs(15));
        assert_eq!(config.progress_mode(), ProgressMode::Dedicated);
        assert_eq!(config.connect_policy(), ConnectPolicy::Eager);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_remote_candidates_follow_primary_protocol() {
        assert_eq!(
            RpcConfig::default().remote_protocol_candidates(),
            vec![Protocol::OfiTcp, Protocol::OfiSockets, Protocol::BmiTcp]
        );
        assert_eq!(
            RpcConfig::default()
                .with_tcp(false)
                .remote_protocol_candidates(),
            vec![Protocol::OfiVerbs, Protocol::OfiSockets, Protocol::BmiTcp]
        );
        assert_eq!(
            RpcConfig::default().local_protocol_candidates(),
            vec![Protocol::SharedMemory]
        );
    }

    #[test]
    fn test_builders() {
        let config = RpcConfig::default()
            .with_lazy_connect(true)
            .with_pool_sizes(2, 8)
            .with_timeouts(Duration::from_millis(50), Duration::from_millis(75))
            .with_progress_thread(false)
            .with_log_level(LogLevel::Warn);
        assert_eq!(config.connect_policy(), ConnectPolicy::Lazy);
        assert_eq!(config.local_init_options().pool_size, 2);
        assert_eq!(config.remote_init_options().pool_size, 8);
        assert_eq!(config.remote_init_options().progress, ProgressMode::Caller);
        assert_eq!(config.client_timeout(), Duration::from_millis(50));
        assert_eq!(config.server_timeout(), Duration::from_millis(75));
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            RpcConfig::from_json(r#"{"lazy_connect": true, "logging": {"level": "debug"}}"#)
                .expect("parse");
        assert!(config.lazy_connect);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.client_server_timeout_ms, 5_000);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(matches!(
            RpcConfig::from_json(r#"{"server_server_pool_size": 0}"#),
            Err(ConfigError::Invalid {
                field: "server_server_pool_size",
                ..
            })
        ));
        assert!(matches!(
            RpcConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_testing_preset_is_valid() {
        let config = RpcConfig::testing();
        config.validate().expect("valid");
        assert_eq!(config.progress_mode(), ProgressMode::Caller);
        assert!(config.client_timeout() < RpcConfig::default().client_timeout());
    }

    #[test]
    fn test_invalid_config_converts_to_rpc_error() {
        let err = RpcConfig::default()
            .with_timeouts(Duration::ZERO, Duration::from_secs(1))
            .validate()
            .expect_err("zero timeout");
        let err = RpcError::from(err);
        assert!(matches!(err, RpcError::InvalidConfig(ref reason) if reason.contains("client_server_timeout_ms")));
        assert!(!err.is_recoverable());
    }
}
