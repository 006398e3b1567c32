use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub detection: DetectionConfig,
    pub pattern: PatternConfig,
    pub hub: HubConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConfig {
    pub api_url: String,
    pub api_key: String,
    pub token_contract: String,
    pub event_name: String,
    pub only_confirmed: bool,
    pub page_limit: usize,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub multiplier: f64,
    pub jitter: bool,
    pub circuit_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Graph,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub graph_url: String,
    pub sqlite_path: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    pub interval_secs: u64,
    pub window_limit: usize,
    pub on_demand_window_secs: u64,
    pub outlier_capacity: usize,
    pub zscore_threshold: f64,
    pub iqr_multiplier: f64,
    pub min_data_points: usize,
    pub pattern_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PatternConfig {
    pub velocity_window_secs: u64,
    pub velocity_threshold: usize,
    pub dormancy_days: u64,
    pub fan_out_threshold: usize,
    pub fan_in_threshold: usize,
    pub max_activity_lookups: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HubConfig {
    pub listen_addr: String,
    pub command_capacity: usize,
    pub subscriber_queue: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub stats_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.trongrid.io".into(),
            api_key: String::new(),
            token_contract: String::new(),
            event_name: "Transfer".into(),
            only_confirmed: true,
            page_limit: 200,
            poll_interval_secs: 10,
            request_timeout_secs: 10,
            channel_capacity: 100,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 10,
            multiplier: 2.0,
            jitter: true,
            circuit_timeout_secs: 300,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Graph,
            graph_url: "http://localhost:8000".into(),
            sqlite_path: "data/transactions.db".into(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            window_limit: 10_000,
            on_demand_window_secs: 24 * 3600,
            outlier_capacity: 100,
            zscore_threshold: 3.0,
            iqr_multiplier: 1.5,
            min_data_points: 30,
            pattern_enabled: true,
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            velocity_window_secs: 3600,
            velocity_threshold: 50,
            dormancy_days: 30,
            fan_out_threshold: 20,
            fan_in_threshold: 20,
            max_activity_lookups: 200,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8081".into(),
            command_capacity: 256,
            subscriber_queue: 256,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "tetherwatch=info".into(),
        }
    }
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_timeout_secs)
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DetectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist,
    /// then applies environment overrides for secrets.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Self::default()
        } else {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            tracing::info!("Config loaded from {}", path.display());
            config
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Overrides that should not live in a checked-in file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("TETHERWATCH_API_KEY").filter(|v| !v.is_empty()) {
            self.feed.api_key = key;
        }
        if let Some(contract) = lookup("TETHERWATCH_TOKEN_CONTRACT").filter(|v| !v.is_empty()) {
            self.feed.token_contract = contract;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.token_contract.trim().is_empty() {
            return Err(ConfigError::Missing("feed.token_contract"));
        }
        if self.feed.api_url.trim().is_empty() {
            return Err(ConfigError::Missing("feed.api_url"));
        }
        match self.store.backend {
            StoreBackend::Graph if self.store.graph_url.trim().is_empty() => {
                return Err(ConfigError::Missing("store.graph_url"));
            }
            StoreBackend::Sqlite if self.store.sqlite_path.trim().is_empty() => {
                return Err(ConfigError::Missing("store.sqlite_path"));
            }
            _ => {}
        }

        let positive: [(&'static str, f64); 18] = [
            ("detection.zscore_threshold", self.detection.zscore_threshold),
            ("detection.iqr_multiplier", self.detection.iqr_multiplier),
            ("detection.interval_secs", self.detection.interval_secs as f64),
            ("detection.min_data_points", self.detection.min_data_points as f64),
            ("detection.outlier_capacity", self.detection.outlier_capacity as f64),
            ("retry.multiplier", self.retry.multiplier),
            ("retry.initial_delay_ms", self.retry.initial_delay_ms as f64),
            ("feed.poll_interval_secs", self.feed.poll_interval_secs as f64),
            ("feed.channel_capacity", self.feed.channel_capacity as f64),
            ("feed.page_limit", self.feed.page_limit as f64),
            ("feed.request_timeout_secs", self.feed.request_timeout_secs as f64),
            ("store.request_timeout_secs", self.store.request_timeout_secs as f64),
            ("pattern.velocity_threshold", self.pattern.velocity_threshold as f64),
            ("pattern.velocity_window_secs", self.pattern.velocity_window_secs as f64),
            ("pattern.dormancy_days", self.pattern.dormancy_days as f64),
            ("hub.command_capacity", self.hub.command_capacity as f64),
            ("hub.subscriber_queue", self.hub.subscriber_queue as f64),
            ("pipeline.stats_interval_secs", self.pipeline.stats_interval_secs as f64),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(ConfigError::NotPositive { name, value });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.feed.token_contract = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".into();
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.feed.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.feed.channel_capacity, 100);
        assert_eq!(config.retry.max_retries, 10);
        assert_eq!(config.retry.circuit_timeout(), Duration::from_secs(300));
        assert_eq!(config.detection.min_data_points, 30);
        assert!((config.detection.zscore_threshold - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.hub.subscriber_queue, 256);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [feed]
            token_contract = "TXYZ"
            poll_interval_secs = 3

            [store]
            backend = "sqlite"
            "#,
        )
        .unwrap();
        assert_eq!(config.feed.token_contract, "TXYZ");
        assert_eq!(config.feed.poll_interval_secs, 3);
        assert_eq!(config.feed.page_limit, 200);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.detection.interval_secs, 60);
    }

    #[test]
    fn missing_contract_is_fatal() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("feed.token_contract")));
    }

    #[test]
    fn non_positive_threshold_is_fatal() {
        let mut config = valid_config();
        config.detection.iqr_multiplier = 0.0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NotPositive { name: "detection.iqr_multiplier", .. }
        ));

        let mut config = valid_config();
        config.hub.subscriber_queue = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_intervals_and_timeouts_are_fatal() {
        let mut config = valid_config();
        config.pipeline.stats_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { name: "pipeline.stats_interval_secs", .. })
        ));

        let mut config = valid_config();
        config.store.request_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { name: "store.request_timeout_secs", .. })
        ));

        let mut config = valid_config();
        config.feed.request_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { name: "feed.request_timeout_secs", .. })
        ));
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn env_overrides_secrets() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "TETHERWATCH_API_KEY" => Some("secret".into()),
            "TETHERWATCH_TOKEN_CONTRACT" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.feed.api_key, "secret");
        assert!(config.feed.token_contract.is_empty());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load("/nonexistent/tetherwatch.toml").unwrap();
        assert_eq!(config.feed.page_limit, 200);
    }
}
