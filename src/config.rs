use std::env;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::processor::Backend;

/// Application configuration, deserialized from a YAML file and then
/// overridden by a small set of environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub environment: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub finnhub: FinnhubConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend selector: "kafka" or "clickhouse".
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "kafka".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Max trades per second per symbol admitted by the throttle.
    pub max_rps: u32,
    /// Retry buffer capacity.
    pub buffer_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_rps: 20,
            buffer_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub producer: ProducerTuning,
    pub consumer: ConsumerTuning,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerTuning {
    /// -1 means acks=all.
    pub required_acks: i32,
    /// One of gzip, snappy, lz4, zstd.
    pub compression: String,
    pub max_attempts: u32,
    pub batch_size: usize,
    pub batch_bytes: usize,
    pub batch_timeout_ms: u64,
    pub write_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Fire-and-forget writes; errors only reported on flush/close.
    pub r#async: bool,
    /// Partition by symbol hash. Required for per-symbol ordering.
    pub hash_by_key: bool,
}

impl Default for ProducerTuning {
    fn default() -> Self {
        Self {
            required_acks: -1,
            compression: "gzip".to_string(),
            max_attempts: 3,
            batch_size: 100,
            batch_bytes: 1_048_576,
            batch_timeout_ms: 1000,
            write_timeout_secs: 10,
            read_timeout_secs: 10,
            r#async: false,
            hash_by_key: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerTuning {
    pub enabled: bool,
    pub group_id: String,
    pub auto_offset_reset: String,
    pub workers: usize,
    pub buffer_size: usize,
    pub retry_max: u32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub dlq_topic: String,
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl Default for ConsumerTuning {
    fn default() -> Self {
        Self {
            enabled: false,
            group_id: "finpull".to_string(),
            auto_offset_reset: "earliest".to_string(),
            workers: 1,
            buffer_size: 10,
            retry_max: 3,
            backoff_min_ms: 50,
            backoff_max_ms: 2000,
            dlq_topic: String::new(),
            min_bytes: 10_000,
            max_bytes: 10_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub table: String,
    /// Server-side batching via async inserts.
    pub async_insert: bool,
    pub wait_for_async_insert: bool,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8123,
            database: "finpull".to_string(),
            user: "default".to_string(),
            password: String::new(),
            table: "rt_ticks_raw".to_string(),
            async_insert: false,
            wait_for_async_insert: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FinnhubConfig {
    pub api_key: String,
    pub websocket_url: String,
    pub symbols: Vec<String>,
    pub reconnect_delay_secs: u64,
    pub ping_interval_secs: u64,
}

impl Default for FinnhubConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            websocket_url: "wss://ws.finnhub.io".to_string(),
            symbols: Vec::new(),
            reconnect_delay_secs: 5,
            ping_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Base URL of the external inference services.
    pub base_url: String,
    pub timeout_secs: u64,
    pub cache_ttl: CacheTtlConfig,
    pub redis: RedisConfig,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: 3,
            cache_ttl: CacheTtlConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    pub regime_secs: u64,
    pub vol_secs: u64,
    pub anomaly_secs: u64,
    pub edge_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            regime_secs: 30,
            vol_secs: 30,
            anomaly_secs: 30,
            edge_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub addr: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl Config {
    /// Reads and parses a YAML configuration file, then validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("read config {}", path.as_ref().display()))?;
        let cfg: Config = serde_yaml::from_str(&raw).context("parse config")?;
        cfg.validate().context("validate config")?;
        Ok(cfg)
    }

    /// Loads config from YAML and overrides select fields from the
    /// environment.
    pub fn load_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("read config {}", path.as_ref().display()))?;
        let mut cfg: Config = serde_yaml::from_str(&raw).context("parse config")?;
        cfg.apply_env();
        cfg.validate().context("validate config")?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_str("FINNHUB_API_KEY") {
            self.finnhub.api_key = v;
        }
        if let Some(v) = env_str("SYMBOLS") {
            self.finnhub.symbols = split_csv(&v);
        }
        if let Some(v) = env_str("BACKEND") {
            self.backend.kind = v;
        }
        if let Some(v) = env_str("KAFKA_BROKERS") {
            self.kafka.brokers = split_csv(&v);
        }
        if let Some(v) = env_str("KAFKA_TOPIC") {
            self.kafka.topic = v;
        }
        if let Some(v) = env_str("CLICKHOUSE_HOST") {
            self.clickhouse.host = v;
        }
        if let Some(v) = env_str("REDIS_ADDR") {
            self.analytics.redis.addr = v;
            self.analytics.redis.enabled = true;
        }
    }

    /// Fatal-at-boot validation of required fields.
    pub fn validate(&self) -> Result<()> {
        if self.environment.is_empty() {
            bail!("environment is required");
        }
        let backend = self.backend()?;
        if matches!(backend, Backend::Kafka) || self.kafka.consumer.enabled {
            if self.kafka.brokers.is_empty() {
                bail!("kafka.brokers is required for the kafka backend");
            }
            if self.kafka.topic.is_empty() {
                bail!("kafka.topic is required for the kafka backend");
            }
        }
        if self.clickhouse.host.is_empty() {
            bail!("clickhouse.host is required");
        }
        if self.finnhub.api_key.is_empty() {
            bail!("finnhub.api_key is required");
        }
        if self.finnhub.symbols.is_empty() {
            bail!("finnhub.symbols is required");
        }
        if self.analytics.base_url.is_empty() {
            bail!("analytics.base_url is required");
        }
        Ok(())
    }

    /// Parses the backend selector; an unknown value is a fatal
    /// configuration error.
    pub fn backend(&self) -> Result<Backend> {
        self.backend.kind.parse()
    }
}

fn env_str(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
