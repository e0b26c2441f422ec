use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::browser::BrowserConfig;
use crate::discovery::{DiscoveryMode, DiscoverySettings};
use crate::escalation::EscalationSettings;
use crate::extractor::ExtractorSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Harvest targets
    pub accounts: Vec<String>,
    pub batch_size: usize,
    pub harvest_mode: DiscoveryMode,
    pub poll_interval: Duration,

    // Database
    pub database_path: PathBuf,

    // Platform
    pub platform_base_url: String,

    // Browser
    pub chrome_path: Option<String>,
    pub page_timeout: Duration,
    pub detail_concurrency: usize,
    pub metrics_concurrency: usize,

    // Discovery
    pub max_scroll_rounds: u32,
    pub empty_round_limit: u32,
    pub scroll_base_wait: Duration,
    pub scroll_max_wait: Duration,

    // Extraction
    pub intercept_window: Duration,
    pub settle_delay: Duration,
    pub min_image_px: u32,

    // Escalation tiers
    pub escalation_concurrency: usize,
    pub local_reader_url: String,
    pub remote_reader_url: String,
    pub remote_reader_api_key: Option<String>,
    pub remote_cooldown: Duration,

    // Vision fallback
    pub vision_enabled: bool,
    pub vision_api_url: String,
    pub vision_api_key: Option<String>,
    pub vision_model: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Harvest targets
            accounts: parse_accounts(&required_env("HARVEST_ACCOUNTS")?),
            batch_size: parse_env_usize("HARVEST_BATCH_SIZE", 10)?,
            harvest_mode: parse_harvest_mode(&env_or_default("HARVEST_MODE", "new"))?,
            poll_interval: Duration::from_secs(parse_env_u64("POLL_INTERVAL_SECS", 900)?),

            // Database
            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/harvest.sqlite")),

            // Platform
            platform_base_url: env_or_default("PLATFORM_BASE_URL", "https://www.threads.net"),

            // Browser
            chrome_path: optional_env("CHROME_PATH"),
            page_timeout: Duration::from_secs(parse_env_u64("PAGE_TIMEOUT_SECS", 30)?),
            detail_concurrency: parse_env_usize("DETAIL_CONCURRENCY", 1)?,
            metrics_concurrency: parse_env_usize("METRICS_CONCURRENCY", 2)?,

            // Discovery
            max_scroll_rounds: parse_env_u32("MAX_SCROLL_ROUNDS", 60)?,
            empty_round_limit: parse_env_u32("EMPTY_ROUND_LIMIT", 4)?,
            scroll_base_wait: Duration::from_millis(parse_env_u64("SCROLL_BASE_WAIT_MS", 1200)?),
            scroll_max_wait: Duration::from_millis(parse_env_u64("SCROLL_MAX_WAIT_MS", 6000)?),

            // Extraction
            intercept_window: Duration::from_millis(parse_env_u64("INTERCEPT_WINDOW_MS", 6000)?),
            settle_delay: Duration::from_millis(parse_env_u64("SETTLE_DELAY_MS", 1500)?),
            min_image_px: parse_env_u32("MIN_IMAGE_PX", 150)?,

            // Escalation tiers
            escalation_concurrency: parse_env_usize("ESCALATION_CONCURRENCY", 6)?,
            local_reader_url: env_or_default("LOCAL_READER_URL", "http://127.0.0.1:3000"),
            remote_reader_url: env_or_default("REMOTE_READER_URL", "https://r.jina.ai"),
            remote_reader_api_key: optional_env("REMOTE_READER_API_KEY"),
            remote_cooldown: Duration::from_secs(parse_env_u64("REMOTE_COOLDOWN_SECS", 20)?),

            // Vision fallback
            vision_enabled: parse_env_bool("VISION_ENABLED", false)?,
            vision_api_url: env_or_default(
                "VISION_API_URL",
                "https://api.openai.com/v1/chat/completions",
            ),
            vision_api_key: optional_env("VISION_API_KEY"),
            vision_model: env_or_default("VISION_MODEL", "gpt-4o-mini"),
        })
    }

    /// Configuration with defaults suitable for tests: no waits, local endpoints.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            accounts: vec!["acme".to_string()],
            batch_size: 5,
            harvest_mode: DiscoveryMode::New,
            poll_interval: Duration::from_secs(60),
            database_path: PathBuf::from(":memory:"),
            platform_base_url: "https://www.threads.net".to_string(),
            chrome_path: None,
            page_timeout: Duration::from_secs(5),
            detail_concurrency: 1,
            metrics_concurrency: 2,
            max_scroll_rounds: 20,
            empty_round_limit: 2,
            scroll_base_wait: Duration::ZERO,
            scroll_max_wait: Duration::ZERO,
            intercept_window: Duration::from_millis(50),
            settle_delay: Duration::ZERO,
            min_image_px: 150,
            escalation_concurrency: 4,
            local_reader_url: "http://127.0.0.1:9".to_string(),
            remote_reader_url: "http://127.0.0.1:9".to_string(),
            remote_reader_api_key: None,
            remote_cooldown: Duration::ZERO,
            vision_enabled: false,
            vision_api_url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            vision_api_key: None,
            vision_model: "test-model".to_string(),
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "HARVEST_ACCOUNTS".to_string(),
                message: "must name at least one account".to_string(),
            });
        }
        for (name, value) in [
            ("DETAIL_CONCURRENCY", self.detail_concurrency),
            ("METRICS_CONCURRENCY", self.metrics_concurrency),
            ("ESCALATION_CONCURRENCY", self.escalation_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if self.max_scroll_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_SCROLL_ROUNDS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.scroll_base_wait > self.scroll_max_wait {
            return Err(ConfigError::InvalidValue {
                name: "SCROLL_BASE_WAIT_MS".to_string(),
                message: "cannot exceed SCROLL_MAX_WAIT_MS".to_string(),
            });
        }
        if self.vision_enabled && self.vision_api_key.is_none() {
            return Err(ConfigError::InvalidValue {
                name: "VISION_API_KEY".to_string(),
                message: "required when VISION_ENABLED is set".to_string(),
            });
        }
        Ok(())
    }

    /// Browser launch settings.
    #[must_use]
    pub fn browser_config(&self) -> BrowserConfig {
        BrowserConfig {
            chrome_path: self.chrome_path.clone(),
            page_timeout: self.page_timeout,
            ..BrowserConfig::default()
        }
    }

    /// Scroll/discovery tuning.
    #[must_use]
    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            max_rounds: self.max_scroll_rounds,
            empty_round_limit: self.empty_round_limit,
            base_wait: self.scroll_base_wait,
            max_wait: self.scroll_max_wait,
            ..DiscoverySettings::default()
        }
    }

    /// Per-post extraction tuning.
    #[must_use]
    pub fn extractor_settings(&self) -> ExtractorSettings {
        ExtractorSettings {
            intercept_window: self.intercept_window,
            navigation_timeout: self.page_timeout,
            min_image_px: self.min_image_px,
            settle_delay: self.settle_delay,
        }
    }

    /// Tier escalation tuning.
    #[must_use]
    pub fn escalation_settings(&self) -> EscalationSettings {
        EscalationSettings {
            tier1_concurrency: self.escalation_concurrency,
            remote_cooldown: self.remote_cooldown,
        }
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

fn parse_accounts(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().trim_start_matches('@').to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_harvest_mode(value: &str) -> Result<DiscoveryMode, ConfigError> {
    match value.to_lowercase().as_str() {
        "new" => Ok(DiscoveryMode::New),
        "backfill" | "history" => Ok(DiscoveryMode::HistoricalBackfill),
        _ => Err(ConfigError::InvalidValue {
            name: "HARVEST_MODE".to_string(),
            message: format!("must be 'new' or 'backfill', got '{value}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_harvest_mode() {
        assert_eq!(parse_harvest_mode("new").unwrap(), DiscoveryMode::New);
        assert_eq!(parse_harvest_mode("NEW").unwrap(), DiscoveryMode::New);
        assert_eq!(
            parse_harvest_mode("backfill").unwrap(),
            DiscoveryMode::HistoricalBackfill
        );
        assert!(parse_harvest_mode("sideways").is_err());
    }

    #[test]
    fn test_parse_accounts() {
        assert_eq!(
            parse_accounts(" @Acme, zuck ,,"),
            vec!["acme".to_string(), "zuck".to_string()]
        );
        assert!(parse_accounts("").is_empty());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_env_bool("NONEXISTENT_VAR", true).unwrap());
        assert!(!parse_env_bool("NONEXISTENT_VAR", false).unwrap());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = Config {
            metrics_concurrency: 0,
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());
        assert!(Config::for_testing().validate().is_ok());
    }

    #[test]
    fn test_vision_requires_key() {
        let config = Config {
            vision_enabled: true,
            vision_api_key: None,
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());
    }
}
