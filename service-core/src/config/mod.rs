use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Settings shared by every job binary.
///
/// Sources, lowest precedence first: an optional `configuration.{toml,yaml,json}`
/// file in the working directory, then `APP__*` environment variables
/// (`APP__LOG_LEVEL=debug`). A `.env` file is loaded before either.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            otlp_endpoint: None,
            environment: default_environment(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_defaults() {
        let config = Config::load().expect("config should load without sources");
        assert!(!config.log_level.is_empty());
    }

    #[test]
    #[serial]
    fn test_load_from_environment() {
        unsafe {
            std::env::set_var("APP__LOG_LEVEL", "debug");
            std::env::set_var("APP__ENVIRONMENT", "production");
        }

        let config = Config::load().expect("config should load");

        unsafe {
            std::env::remove_var("APP__LOG_LEVEL");
            std::env::remove_var("APP__ENVIRONMENT");
        }

        assert_eq!(config.log_level, "debug");
        assert!(config.is_production());
    }
}
