use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use secrecy::Secret;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::DEFAULT_FAILURE_THRESHOLD;
use service_core::config::Config as CoreConfig;

const DEFAULT_STRIPE_API_BASE_URL: &str = "https://api.stripe.com/v1";
const MAX_REMINDER_DAYS_BEFORE: i64 = 366;
/// One year.
const MAX_PENDING_STALE_AFTER_MINUTES: i64 = 525_600;

#[derive(Clone, Debug)]
pub struct BillingJobsConfig {
    pub common: CoreConfig,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub stripe: StripeConfig,
    pub notifications: NotificationServiceConfig,
    pub jobs: JobSettings,
    pub metrics_textfile_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Clone, Debug)]
pub struct StripeConfig {
    pub secret_key: Secret<String>,
    pub api_base_url: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct NotificationServiceConfig {
    pub url: String,
    pub internal_token: Option<Secret<String>>,
    pub timeout: Duration,
    /// Claim dedupe keys in the billing store before delivering.
    pub dedupe_locally: bool,
}

/// Knobs shared by the three jobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSettings {
    pub reminder_days_before: i64,
    pub failure_threshold: i32,
    /// PENDING attempts older than this no longer block a charge. `None` leaves
    /// them blocking until an operator resolves them.
    pub pending_stale_after: Option<chrono::Duration>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            reminder_days_before: 3,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            pending_stale_after: None,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        _ => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl BillingJobsConfig {
    /// Read job configuration from the environment. `.env` is honoured.
    ///
    /// Observability defaults come from `service_core::config::Config`; the
    /// plain `LOG_LEVEL` and `OTLP_ENDPOINT` variables override them.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let common = CoreConfig::load()
            .map_err(|e| anyhow!("failed to load shared configuration: {}", e))?;

        let service_name =
            env::var("SERVICE_NAME").unwrap_or_else(|_| "recurring-billing".to_string());
        let log_level = optional_var("LOG_LEVEL").unwrap_or_else(|| common.log_level.clone());
        let otlp_endpoint = optional_var("OTLP_ENDPOINT").or_else(|| common.otlp_endpoint.clone());

        let db_url = env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL must be set"))?;
        let max_connections = parse_var("DATABASE_MAX_CONNECTIONS", 5u32)?;
        let min_connections = parse_var("DATABASE_MIN_CONNECTIONS", 1u32)?;

        let processor_timeout = Duration::from_secs(parse_var("PROCESSOR_TIMEOUT_SECS", 30u64)?);
        let stripe_secret = env::var("STRIPE_SECRET_KEY").unwrap_or_default();
        let stripe_base_url = env::var("STRIPE_API_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_STRIPE_API_BASE_URL.to_string());

        let notification_url = env::var("NOTIFICATION_SERVICE_URL")
            .unwrap_or_else(|_| "http://localhost:3010".to_string());
        let internal_token = optional_var("INTERNAL_API_TOKEN").map(Secret::new);
        let dedupe_locally = parse_var("NOTIFICATION_DEDUPE_LOCAL", false)?;

        let reminder_days_before = parse_var("REMINDER_DAYS_BEFORE", 3i64)?;
        if !(0..=MAX_REMINDER_DAYS_BEFORE).contains(&reminder_days_before) {
            return Err(anyhow!(
                "REMINDER_DAYS_BEFORE must be between 0 and {}, got {}",
                MAX_REMINDER_DAYS_BEFORE,
                reminder_days_before
            ));
        }
        let failure_threshold = parse_var("DEFAULT_FAILURE_THRESHOLD", DEFAULT_FAILURE_THRESHOLD)?;
        if failure_threshold < 1 {
            return Err(anyhow!("DEFAULT_FAILURE_THRESHOLD must be at least 1"));
        }
        let pending_stale_after = match optional_var("PENDING_STALE_AFTER_MINUTES") {
            Some(raw) => {
                let minutes: i64 = raw.trim().parse().with_context(|| {
                    format!("PENDING_STALE_AFTER_MINUTES has an invalid value '{}'", raw)
                })?;
                if !(1..=MAX_PENDING_STALE_AFTER_MINUTES).contains(&minutes) {
                    return Err(anyhow!(
                        "PENDING_STALE_AFTER_MINUTES must be between 1 and {}, got {}",
                        MAX_PENDING_STALE_AFTER_MINUTES,
                        minutes
                    ));
                }
                Some(chrono::Duration::minutes(minutes))
            }
            None => None,
        };

        Ok(Self {
            common,
            service_name,
            log_level,
            otlp_endpoint,
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections,
                min_connections,
            },
            stripe: StripeConfig {
                secret_key: Secret::new(stripe_secret),
                api_base_url: stripe_base_url,
                timeout: processor_timeout,
            },
            notifications: NotificationServiceConfig {
                url: notification_url,
                internal_token,
                timeout: processor_timeout,
                dedupe_locally,
            },
            jobs: JobSettings {
                reminder_days_before,
                failure_threshold,
                pending_stale_after,
            },
            metrics_textfile_path: optional_var("METRICS_TEXTFILE_PATH").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
        "STRIPE_SECRET_KEY",
        "NOTIFICATION_DEDUPE_LOCAL",
        "REMINDER_DAYS_BEFORE",
        "DEFAULT_FAILURE_THRESHOLD",
        "PENDING_STALE_AFTER_MINUTES",
        "METRICS_TEXTFILE_PATH",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/billing");

        let config = BillingJobsConfig::from_env().unwrap();

        assert_eq!(config.database.url.expose_secret(), "postgres://localhost/billing");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.jobs, JobSettings::default());
        assert_eq!(config.stripe.api_base_url, DEFAULT_STRIPE_API_BASE_URL);
        assert!(!config.notifications.dedupe_locally);
        assert!(config.metrics_textfile_path.is_none());
        clear();
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/billing");
        env::set_var("REMINDER_DAYS_BEFORE", "7");
        env::set_var("DEFAULT_FAILURE_THRESHOLD", "5");
        env::set_var("PENDING_STALE_AFTER_MINUTES", "90");
        env::set_var("NOTIFICATION_DEDUPE_LOCAL", "true");
        env::set_var("METRICS_TEXTFILE_PATH", "/var/lib/node_exporter/billing.prom");

        let config = BillingJobsConfig::from_env().unwrap();

        assert_eq!(config.jobs.reminder_days_before, 7);
        assert_eq!(config.jobs.failure_threshold, 5);
        assert_eq!(
            config.jobs.pending_stale_after,
            Some(chrono::Duration::minutes(90))
        );
        assert!(config.notifications.dedupe_locally);
        assert_eq!(
            config.metrics_textfile_path,
            Some(PathBuf::from("/var/lib/node_exporter/billing.prom"))
        );
        clear();
    }

    #[test]
    #[serial]
    fn test_missing_database_url_is_an_error() {
        clear();
        let err = BillingJobsConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    #[serial]
    fn test_invalid_number_is_an_error() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/billing");
        env::set_var("REMINDER_DAYS_BEFORE", "three");
        let err = BillingJobsConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("REMINDER_DAYS_BEFORE"));
        clear();
    }

    #[test]
    #[serial]
    fn test_out_of_range_reminder_lead_time_is_an_error() {
        for value in ["-1", "1000000000"] {
            clear();
            env::set_var("DATABASE_URL", "postgres://localhost/billing");
            env::set_var("REMINDER_DAYS_BEFORE", value);
            let err = BillingJobsConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("REMINDER_DAYS_BEFORE"), "{}", err);
        }
        clear();
    }

    #[test]
    #[serial]
    fn test_out_of_range_pending_cutoff_is_an_error() {
        for value in ["0", "-5", "9223372036854775807"] {
            clear();
            env::set_var("DATABASE_URL", "postgres://localhost/billing");
            env::set_var("PENDING_STALE_AFTER_MINUTES", value);
            let err = BillingJobsConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("PENDING_STALE_AFTER_MINUTES"), "{}", err);
        }
        clear();
    }
}
