//! Service configuration, read from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `HOST` / `PORT` | `127.0.0.1` / `3000` |
//! | `DATA_DIR` | `./data` |
//! | `DATABASE_PATH` | `$DATA_DIR/research.db` |
//! | `SUBJECTS_PATH` | `$DATA_DIR/subjects.json` |
//! | `API_TOKEN` | unset (no auth) |
//! | `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `PROVIDER_A_MODEL` | provider A |
//! | `OPENROUTER_API_KEY`, `PROVIDER_B_MODEL`, `PROVIDER_C_MODEL` | providers B and C |
//! | `PROVIDER_TIMEOUT_SECS`, `PROVIDER_MAX_RETRIES`, `PROVIDER_RETRY_BASE_MS` | `600`, `4`, `2000` |
//! | `PUBLISH_URL`, `PUBLISH_SECRET` | unset (publishing disabled) |
//! | `PUBLISH_TIMEOUT_SECS`, `PUBLISH_MAX_ATTEMPTS`, `PUBLISH_RETRY_BASE_MS` | `30`, `3`, `500` |
//! | `STALE_LOCK_SECS` | `120` (heartbeat age that marks a lock abandoned) |
//! | `TRACKING_SOURCE`, `TRACKING_MEDIUM` | `deep-research`, `email` |

use anyhow::{bail, Context};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::llm::RetryConfig;
use crate::publish::{PublishConfig, TrackingParams};
use crate::research::DEFAULT_STALE_LOCK_AFTER;

pub const DEFAULT_PROVIDER_A_MODEL: &str = "gpt-4.1";
pub const DEFAULT_PROVIDER_B_MODEL: &str = "anthropic/claude-sonnet-4";
pub const DEFAULT_PROVIDER_C_MODEL: &str = "perplexity/sonar-pro";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub subjects_path: PathBuf,
    /// Bearer token required on the research API. `None` disables auth.
    pub api_token: Option<String>,

    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub provider_a_model: String,
    pub openrouter_api_key: Option<String>,
    pub provider_b_model: String,
    pub provider_c_model: String,
    pub provider_retry: RetryConfig,

    /// `None` when no publish endpoint is configured.
    pub publish: Option<PublishConfig>,
    pub stale_lock_after: Duration,
    pub tracking: TrackingParams,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".to_string()));
        let database_path = get("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("research.db"));
        let subjects_path = get("SUBJECTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("subjects.json"));

        let provider_defaults = RetryConfig::default();
        let provider_retry = RetryConfig {
            max_rate_limit_retries: parse_or(
                &get,
                "PROVIDER_MAX_RETRIES",
                provider_defaults.max_rate_limit_retries,
            )?,
            base_delay: Duration::from_millis(parse_or(
                &get,
                "PROVIDER_RETRY_BASE_MS",
                millis(provider_defaults.base_delay),
            )?),
            call_timeout: Duration::from_secs(parse_or(
                &get,
                "PROVIDER_TIMEOUT_SECS",
                provider_defaults.call_timeout.as_secs(),
            )?),
            ..provider_defaults
        };

        let publish = match (get("PUBLISH_URL"), get("PUBLISH_SECRET")) {
            (Some(url), Some(secret)) => {
                url::Url::parse(&url).with_context(|| format!("invalid PUBLISH_URL {:?}", url))?;
                let defaults = PublishConfig::new(url, secret);
                Some(PublishConfig {
                    timeout: Duration::from_secs(parse_or(
                        &get,
                        "PUBLISH_TIMEOUT_SECS",
                        defaults.timeout.as_secs(),
                    )?),
                    max_attempts: parse_or(&get, "PUBLISH_MAX_ATTEMPTS", defaults.max_attempts)?,
                    base_delay: Duration::from_millis(parse_or(
                        &get,
                        "PUBLISH_RETRY_BASE_MS",
                        millis(defaults.base_delay),
                    )?),
                    ..defaults
                })
            }
            (None, None) => None,
            (Some(_), None) => bail!("PUBLISH_URL is set but PUBLISH_SECRET is missing"),
            (None, Some(_)) => bail!("PUBLISH_SECRET is set but PUBLISH_URL is missing"),
        };

        let tracking_defaults = TrackingParams::default();
        let tracking = TrackingParams {
            source: get("TRACKING_SOURCE").unwrap_or(tracking_defaults.source),
            medium: get("TRACKING_MEDIUM").unwrap_or(tracking_defaults.medium),
            ..tracking_defaults
        };

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&get, "PORT", 3000)?,
            data_dir,
            database_path,
            subjects_path,
            api_token: get("API_TOKEN"),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL"),
            provider_a_model: get("PROVIDER_A_MODEL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_A_MODEL.to_string()),
            openrouter_api_key: get("OPENROUTER_API_KEY"),
            provider_b_model: get("PROVIDER_B_MODEL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_B_MODEL.to_string()),
            provider_c_model: get("PROVIDER_C_MODEL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_C_MODEL.to_string()),
            provider_retry,
            publish,
            stale_lock_after: Duration::from_secs(parse_or(
                &get,
                "STALE_LOCK_SECS",
                DEFAULT_STALE_LOCK_AFTER.as_secs(),
            )?),
            tracking,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
