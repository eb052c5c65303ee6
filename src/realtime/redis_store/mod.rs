//! Redis facade
//!
//! Stream pushes, counters and the asset cache go through the asynchronous
//! writer; reads and alert publication are synchronous on a pooled
//! connection. Alerts deliberately bypass the drop-on-overflow queue: a lost
//! stream record is tolerable, a lost alert is not.

pub mod pool;
pub mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::RedisConfig;
use crate::core::UnifiedRecord;

pub use pool::ConnectionPool;
pub use writer::{AsyncWriter, WriterStats};

/// Protocols that get a seeded stream at startup
const STREAM_PROTOCOLS: [&str; 13] = [
    "modbus", "s7comm", "xgt_fen", "dnp3", "dns", "dhcp", "ethernet_ip", "iec104", "mms",
    "opc_ua", "bacnet", "arp", "tcp_session",
];

/// Key naming scheme
pub mod keys {
    pub fn protocol_stream(protocol: &str) -> String {
        format!("stream:protocol:{protocol}")
    }

    pub fn asset_cache(ip: &str) -> String {
        format!("cache:asset:{ip}")
    }

    pub fn alert_channel() -> &'static str {
        "channel:alerts"
    }

    pub fn stats_counter(protocol: &str) -> String {
        format!("stats:count:{protocol}")
    }
}

/// Cached asset identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetInfo {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub asset_id: String,
    #[serde(default)]
    pub asset_name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub location: String,
}

/// Stream payload mirroring the JSONL short field names
#[derive(Debug, Clone, Serialize)]
pub struct StreamRecord {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub protocol: String,
    pub smac: String,
    pub dmac: String,
    pub sip: String,
    pub dip: String,
    pub sp: String,
    pub dp: String,
    pub sq: String,
    pub ak: String,
    pub fl: String,
    pub dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_asset: Option<String>,
    /// Protocol detail blob
    #[serde(rename = "d", skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

fn opt_num<T: ToString>(v: &Option<T>) -> String {
    v.as_ref().map(|x| x.to_string()).unwrap_or_default()
}

impl StreamRecord {
    pub fn from_record(record: &UnifiedRecord) -> Self {
        Self {
            timestamp: record.timestamp.clone(),
            protocol: record.protocol.clone(),
            smac: record.smac.clone(),
            dmac: record.dmac.clone(),
            sip: record.sip.clone(),
            dip: record.dip.clone(),
            sp: opt_num(&record.sp),
            dp: opt_num(&record.dp),
            sq: opt_num(&record.sq),
            ak: opt_num(&record.ak),
            fl: opt_num(&record.fl),
            dir: record.dir.clone(),
            src_asset: record.src_asset_name.clone(),
            dst_asset: record.dst_asset_name.clone(),
            details: record.details.clone(),
        }
    }
}

pub struct RedisStore {
    config: RedisConfig,
    pool: Arc<ConnectionPool>,
    writer: AsyncWriter,
    connected: AtomicBool,
}

impl RedisStore {
    pub fn new(config: RedisConfig) -> anyhow::Result<Self> {
        let pool = Arc::new(ConnectionPool::new(&config)?);
        let writer = AsyncWriter::new(Arc::clone(&pool), config.async_writers, config.async_queue_size);
        Ok(Self {
            config,
            pool,
            writer,
            connected: AtomicBool::new(false),
        })
    }

    fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms.max(1000))
    }

    /// Validate one pooled connection, then start the async writer
    pub fn connect(&self) -> bool {
        let Some(mut conn) = self.pool.acquire_guard(self.pool_timeout()) else {
            warn!("redis connect failed: no usable connection");
            return false;
        };
        if redis::cmd("PING").query::<String>(&mut conn).is_err() {
            warn!("redis connect failed: PING error");
            return false;
        }
        drop(conn);

        self.writer.start();
        self.connected.store(true, Ordering::SeqCst);
        info!(
            "redis ready: {}:{} (db {}, {} pooled connection(s))",
            self.config.host,
            self.config.port,
            self.config.db,
            self.pool.available()
        );
        true
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.pool.available() > 0
    }

    /// Asynchronous asset-cache put with TTL
    pub fn cache_asset_info(&self, ip: &str, info: &AssetInfo) -> bool {
        let json = match serde_json::to_string(info) {
            Ok(json) => json,
            Err(_) => return false,
        };
        self.writer.cache_asset(ip.to_string(), json, self.config.asset_cache_ttl)
    }

    /// Synchronous cache read; a miss or parse failure yields the default
    pub fn get_asset_info(&self, ip: &str) -> AssetInfo {
        let Some(mut conn) = self.pool.acquire_guard(self.pool_timeout()) else {
            return AssetInfo::default();
        };

        let value: Option<String> = redis::cmd("GET")
            .arg(keys::asset_cache(ip))
            .query(&mut *conn)
            .unwrap_or(None);

        value
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default()
    }

    /// Asynchronous stream append; a successful enqueue also bumps the
    /// per-protocol stats counter
    pub fn push_to_stream(&self, stream_name: &str, data: &StreamRecord) -> bool {
        let json = match serde_json::to_string(data) {
            Ok(json) => json,
            Err(_) => return false,
        };

        let queued = self.writer.write_stream(stream_name.to_string(), json);
        if queued {
            self.writer.incr_counter(keys::stats_counter(&data.protocol));
        } else {
            warn!("failed to queue stream write: {stream_name}");
        }
        queued
    }

    /// Synchronous publish; alerts must not be lost to queue overflow
    pub fn publish_alert(&self, channel: &str, alert: &Value) -> bool {
        let Some(mut conn) = self.pool.acquire_guard(self.pool_timeout()) else {
            warn!("publish_alert: no redis connection");
            return false;
        };

        match redis::cmd("PUBLISH")
            .arg(channel)
            .arg(alert.to_string())
            .query::<i64>(&mut *conn)
        {
            Ok(subscribers) => {
                info!("alert published to {channel} ({subscribers} subscriber(s))");
                true
            }
            Err(e) => {
                warn!("publish_alert failed: {e}");
                false
            }
        }
    }

    /// Asynchronous counter bump, `value` individual increments
    pub fn increment_counter(&self, key: &str, value: u32) -> bool {
        for _ in 0..value {
            self.writer.incr_counter(key.to_string());
        }
        true
    }

    /// Synchronous counter read
    pub fn get_counter(&self, key: &str) -> i64 {
        let Some(mut conn) = self.pool.acquire_guard(self.pool_timeout()) else {
            return 0;
        };
        redis::cmd("GET")
            .arg(key)
            .query::<Option<String>>(&mut *conn)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Idempotent stream initialisation: probe each protocol stream and seed
    /// the missing ones with a placeholder entry
    pub fn create_protocol_streams(&self) {
        let Some(mut conn) = self.pool.acquire_guard(self.pool_timeout()) else {
            warn!("create_protocol_streams: no redis connection");
            return;
        };

        let mut created = 0;
        for protocol in STREAM_PROTOCOLS {
            let stream = keys::protocol_stream(protocol);
            let exists = redis::cmd("XINFO")
                .arg("STREAM")
                .arg(&stream)
                .query::<redis::Value>(&mut *conn)
                .is_ok();

            if !exists {
                match redis::cmd("XADD")
                    .arg(&stream)
                    .arg("*")
                    .arg("_init")
                    .arg(1)
                    .query::<String>(&mut *conn)
                {
                    Ok(_) => {
                        info!("created stream {stream}");
                        created += 1;
                    }
                    Err(e) => warn!("failed to create stream {stream}: {e}"),
                }
            }
        }
        info!(
            "stream initialisation complete ({created} created, {} existing)",
            STREAM_PROTOCOLS.len() - created
        );
    }

    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    /// Periodic statistics summary
    pub fn log_stats(&self) {
        let stats = self.writer.stats();
        info!(
            "redis: pool {}/{} available, writer queue={}, written={}, dropped={}",
            self.pool.available(),
            self.pool.capacity(),
            stats.queue_size,
            stats.total_written,
            stats.total_dropped
        );
    }

    /// Stop the writer first (it flushes pending batches), then the pool
    pub fn disconnect(&self) {
        info!("redis shutdown initiated");
        self.writer.stop();
        self.pool.shutdown();
        self.connected.store(false, Ordering::SeqCst);
        info!("redis shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_scheme() {
        assert_eq!(keys::protocol_stream("modbus"), "stream:protocol:modbus");
        assert_eq!(keys::asset_cache("10.0.0.1"), "cache:asset:10.0.0.1");
        assert_eq!(keys::alert_channel(), "channel:alerts");
        assert_eq!(keys::stats_counter("dns"), "stats:count:dns");
    }

    #[test]
    fn test_stream_record_from_unified() {
        let record = UnifiedRecord {
            timestamp: "2023-05-10T02:24:15.000001Z".into(),
            protocol: "modbus".into(),
            smac: "aa:bb:cc:dd:ee:01".into(),
            dmac: "aa:bb:cc:dd:ee:02".into(),
            sip: "192.168.1.10".into(),
            dip: "192.168.1.2".into(),
            sp: Some(49152),
            dp: Some(502),
            sq: Some(1),
            ak: Some(2),
            fl: Some(24),
            dir: "request".into(),
            src_asset_name: Some("PLC-1".into()),
            ..UnifiedRecord::default()
        };

        let stream = StreamRecord::from_record(&record);
        let json = serde_json::to_string(&stream).unwrap();
        assert!(json.contains("\"sp\":\"49152\""));
        assert!(json.contains("\"src_asset\":\"PLC-1\""));
        assert!(!json.contains("dst_asset"));
        assert!(!json.contains("\"d\":"));
    }

    #[test]
    fn test_stream_protocols_cover_known_set() {
        for protocol in STREAM_PROTOCOLS {
            assert!(crate::core::record::PROTOCOLS.contains(&protocol));
        }
        // The UDP fallback does not get a stream
        assert!(!STREAM_PROTOCOLS.contains(&"unknown"));
    }
}
