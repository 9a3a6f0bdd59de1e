use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::services::request_handler::{HandlerOptions, ServiceMode};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub muster: MusterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MusterConfig {
    /// JSON file listing the databases
    pub config_path: String,
    pub mode: ServiceMode,
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("muster.config_path", "./muster.conf.json")?
            .set_default("muster.mode", "hardened")?
            .set_default("muster.statement_timeout_secs", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?;

        if let Ok(host) = env::var("HOST") {
            builder = builder.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", parse_env::<u16>("PORT", &port)?)?;
        }

        if let Ok(path) = env::var("MUSTER_CONFIG") {
            builder = builder.set_override("muster.config_path", path)?;
        }

        if let Ok(mode) = env::var("MUSTER_MODE") {
            builder = builder.set_override("muster.mode", mode.trim().to_ascii_lowercase())?;
        }

        if let Ok(secs) = env::var("MUSTER_STATEMENT_TIMEOUT_SECS") {
            builder = builder.set_override(
                "muster.statement_timeout_secs",
                parse_env::<u64>("MUSTER_STATEMENT_TIMEOUT_SECS", &secs)?,
            )?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn handler_options(&self) -> HandlerOptions {
        HandlerOptions {
            mode: self.muster.mode,
            statement_timeout: Duration::from_secs(self.muster.statement_timeout_secs.max(1)),
        }
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, config::ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| config::ConfigError::Message(format!("{}=`{}`: {}", name, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        // Clear environment variables for this test
        env::remove_var("HOST");
        env::remove_var("PORT");
        env::remove_var("MUSTER_CONFIG");
        env::remove_var("MUSTER_MODE");
        env::remove_var("MUSTER_STATEMENT_TIMEOUT_SECS");

        let config = Config::from_env();
        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.muster.config_path, "./muster.conf.json");
        assert_eq!(config.muster.mode, ServiceMode::Hardened);

        let options = config.handler_options();
        assert_eq!(options.statement_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_numeric_overrides_are_checked() {
        assert_eq!(parse_env::<u64>("MUSTER_STATEMENT_TIMEOUT_SECS", " 45 ").unwrap(), 45);
        let err = parse_env::<u64>("MUSTER_STATEMENT_TIMEOUT_SECS", "half a minute").unwrap_err();
        assert!(err.to_string().contains("MUSTER_STATEMENT_TIMEOUT_SECS"));
        assert!(parse_env::<u16>("PORT", "70000").is_err());
    }
}
