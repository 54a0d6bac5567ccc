use std::time::Duration;

use serde::Deserialize;

use crate::handler::HandlerOptions;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3306
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
        }
    }
}

/// Query handler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
    /// Maximum idle time between result rows in milliseconds; 0 disables
    /// the per-row timeout
    #[serde(default)]
    pub read_timeout_ms: u64,
    /// Reject semicolon-separated multi-statement queries from clients
    #[serde(default)]
    pub disable_multi_statements: bool,
    /// Truncate logged queries to this many bytes; negative disables query
    /// logging, 0 means unlimited
    #[serde(default = "default_max_logged_query_len")]
    pub max_logged_query_len: i64,
    /// Base64-encode logged queries instead of whitespace-normalizing them
    #[serde(default)]
    pub encode_logged_query: bool,
}

fn default_max_logged_query_len() -> i64 {
    1024
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 0,
            disable_multi_statements: false,
            max_logged_query_len: default_max_logged_query_len(),
            encode_logged_query: false,
        }
    }
}

impl HandlerConfig {
    pub fn to_options(&self) -> HandlerOptions {
        HandlerOptions {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            disable_multi_stmts: self.disable_multi_statements,
            max_logged_query_len: self.max_logged_query_len,
            encode_logged_query: self.encode_logged_query,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub listen_port: u16,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9306
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_port: default_metrics_port(),
        }
    }
}
