mod schema;

pub use schema::*;

use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

/// Load the first config file that parses, falling back to defaults.
pub fn load_or_default(paths: &[&str]) -> Config {
    for path in paths {
        match load_config(path) {
            Ok(config) => {
                info!(path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path, error = %e, "Failed to load config");
            }
        }
    }
    info!("Using default configuration");
    Config::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.listen_port, 3306);
        assert_eq!(config.handler.read_timeout_ms, 0);
        assert_eq!(config.handler.max_logged_query_len, 1024);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn handler_section_converts_to_options() {
        let config: Config = toml::from_str(
            r#"
            [handler]
            read_timeout_ms = 1500
            disable_multi_statements = true
            max_logged_query_len = -1
            encode_logged_query = true
            "#,
        )
        .unwrap();
        let opts = config.handler.to_options();
        assert_eq!(opts.read_timeout, Duration::from_millis(1500));
        assert!(opts.disable_multi_stmts);
        assert_eq!(opts.max_logged_query_len, -1);
        assert!(opts.encode_logged_query);
    }
}
