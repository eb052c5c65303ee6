//! Runtime configuration
//!
//! Every option carries an environment-variable override so the parser can be
//! configured entirely from a container environment, with command-line flags
//! taking precedence (see `cli.rs`).

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn env_str(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

/// Capture source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Interface for live capture
    pub interface: String,
    /// PCAP file for offline replay (takes precedence over interface)
    pub pcap_file: Option<PathBuf>,
    /// BPF filter expression
    pub bpf_filter: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: env_str("NETWORK_INTERFACE", "any"),
            pcap_file: None,
            bpf_filter: {
                let f = env_str("BPF_FILTER", "");
                if f.is_empty() { None } else { Some(f) }
            },
        }
    }
}

/// File output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for time-bucketed CSV/JSONL files
    pub dir: PathBuf,
    /// Rolling interval in minutes (0 = single output_all bucket)
    pub rolling_interval: u32,
    /// File output enabled (false in realtime mode)
    pub file_output: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(env_str("OUTPUT_DIR", "./output")),
            rolling_interval: env_u64("ROLLING_INTERVAL", 0) as u32,
            file_output: env_str("PARSER_MODE", "with-files") != "realtime",
        }
    }
}

/// Asset inventory CSV paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    pub ip_csv: PathBuf,
    pub input_tags_csv: PathBuf,
    pub output_tags_csv: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            ip_csv: PathBuf::from(env_str("ASSET_IP_CSV", "assets/asset_ip.csv")),
            input_tags_csv: PathBuf::from(env_str("ASSET_INPUT_CSV", "assets/wired_input.csv")),
            output_tags_csv: PathBuf::from(env_str("ASSET_OUTPUT_CSV", "assets/wired_output.csv")),
        }
    }
}

/// Elasticsearch sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub index_prefix: String,
    pub use_https: bool,
    /// Documents per bulk request, clamped to 100 so memory stays bounded
    pub bulk_size: usize,
    /// Flusher period in milliseconds, clamped to 1000
    pub flush_interval_ms: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            host: env_str("ELASTICSEARCH_HOST", "localhost"),
            port: env_u64("ELASTICSEARCH_PORT", 9200) as u16,
            username: env_str("ELASTICSEARCH_USERNAME", ""),
            password: env_str("ELASTICSEARCH_PASSWORD", ""),
            index_prefix: env_str("ELASTICSEARCH_INDEX_PREFIX", "ics-packets"),
            use_https: env_bool("ELASTICSEARCH_USE_HTTPS", false),
            bulk_size: env_u64("ES_BULK_SIZE", 100) as usize,
            flush_interval_ms: env_u64("ES_BULK_FLUSH_INTERVAL_MS", 100),
        }
    }
}

impl ElasticConfig {
    /// Bulk size with the realtime-mode clamp applied
    pub fn effective_bulk_size(&self) -> usize {
        if self.bulk_size == 0 || self.bulk_size > 100 {
            100
        } else {
            self.bulk_size
        }
    }

    /// Flush interval with the realtime-mode clamp applied
    pub fn effective_flush_interval_ms(&self) -> u64 {
        if self.flush_interval_ms == 0 || self.flush_interval_ms > 1000 {
            1000
        } else {
            self.flush_interval_ms
        }
    }
}

/// Redis sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
    pub pool_size: usize,
    pub async_writers: usize,
    pub async_queue_size: usize,
    pub timeout_ms: u64,
    /// TTL in seconds for cache:asset:<ip> entries
    pub asset_cache_ttl: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: env_str("REDIS_HOST", "localhost"),
            port: env_u64("REDIS_PORT", 6379) as u16,
            password: env_str("REDIS_PASSWORD", ""),
            db: env_u64("REDIS_DB", 0) as i64,
            pool_size: env_u64("REDIS_POOL_SIZE", 8) as usize,
            async_writers: env_u64("REDIS_ASYNC_WRITERS", 2) as usize,
            async_queue_size: env_u64("REDIS_ASYNC_QUEUE_SIZE", 10_000) as usize,
            timeout_ms: env_u64("REDIS_TIMEOUT_MS", 1000),
            asset_cache_ttl: env_u64("REDIS_ASSET_CACHE_TTL", 3600),
        }
    }
}

impl RedisConfig {
    /// Connection URL carrying AUTH and SELECT
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub assets: AssetConfig,
    #[serde(default)]
    pub elastic: ElasticConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    /// Worker thread count (0 = auto)
    #[serde(default)]
    pub workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elastic_clamps() {
        let mut cfg = ElasticConfig::default();
        cfg.bulk_size = 0;
        cfg.flush_interval_ms = 0;
        assert_eq!(cfg.effective_bulk_size(), 100);
        assert_eq!(cfg.effective_flush_interval_ms(), 1000);

        cfg.bulk_size = 500;
        cfg.flush_interval_ms = 30_000;
        assert_eq!(cfg.effective_bulk_size(), 100);
        assert_eq!(cfg.effective_flush_interval_ms(), 1000);

        cfg.bulk_size = 50;
        cfg.flush_interval_ms = 250;
        assert_eq!(cfg.effective_bulk_size(), 50);
        assert_eq!(cfg.effective_flush_interval_ms(), 250);
    }

    #[test]
    fn test_redis_url() {
        let mut cfg = RedisConfig {
            host: "10.0.0.5".into(),
            port: 6380,
            password: String::new(),
            db: 2,
            ..RedisConfig::default()
        };
        assert_eq!(cfg.url(), "redis://10.0.0.5:6380/2");

        cfg.password = "secret".into();
        assert_eq!(cfg.url(), "redis://:secret@10.0.0.5:6380/2");
    }
}
