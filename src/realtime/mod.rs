//! Realtime fan-out
//!
//! Bridges the record sink's synchronous callback to the two realtime
//! backends: the Elasticsearch bulk buffer and the Redis stream writer. Owned
//! by the application, not by the sink; the sink only ever sees a function
//! value.

pub mod elastic;
pub mod redis_store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::core::UnifiedRecord;

pub use elastic::ElasticClient;
pub use redis_store::{keys, AssetInfo, RedisStore, StreamRecord};

pub struct RealtimePipeline {
    elastic: Option<Arc<ElasticClient>>,
    redis: Option<Arc<RedisStore>>,
    es_queued: AtomicU64,
    redis_sent: AtomicU64,
}

impl RealtimePipeline {
    pub fn new(elastic: Option<Arc<ElasticClient>>, redis: Option<Arc<RedisStore>>) -> Self {
        Self {
            elastic,
            redis,
            es_queued: AtomicU64::new(0),
            redis_sent: AtomicU64::new(0),
        }
    }

    /// Forward one record to every connected backend
    pub fn send(&self, record: &UnifiedRecord) {
        if let Some(elastic) = self.elastic.as_ref().filter(|c| c.is_connected()) {
            let doc = self.build_document(record);
            if elastic.add_to_bulk(&record.protocol, &doc) {
                let count = self.es_queued.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 1000 == 0 {
                    info!("elasticsearch: {count} documents queued to bulk");
                }
            } else {
                warn!("failed to add record to elasticsearch bulk");
            }
        }

        if let Some(redis) = self.redis.as_ref().filter(|r| r.is_connected()) {
            let stream_name = keys::protocol_stream(&record.protocol);
            if redis.push_to_stream(&stream_name, &StreamRecord::from_record(record)) {
                let count = self.redis_sent.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 1000 == 0 {
                    info!("redis: {count} records sent to streams");
                }
            } else {
                error!("failed to push record to {stream_name}");
            }
        }
    }

    /// Elasticsearch document: common identity fields, the protocol detail
    /// blob, per-protocol highlight fields and the cached asset objects.
    fn build_document(&self, record: &UnifiedRecord) -> Value {
        let mut doc = json!({
            "@timestamp": record.timestamp,
            "protocol": record.protocol,
            "src_ip": record.sip,
            "dst_ip": record.dip,
            "src_port": record.sp.unwrap_or(0),
            "dst_port": record.dp.unwrap_or(0),
            "src_mac": record.smac,
            "dst_mac": record.dmac,
            "direction": record.dir,
            "protocol_details": record.details.clone().unwrap_or_else(|| json!({})),
        });

        let Some(obj) = doc.as_object_mut() else {
            return doc;
        };
        match record.protocol.as_str() {
            "modbus" => {
                if let Some(fc) = record.modbus_fc {
                    obj.insert("modbus_function".into(), json!(fc.to_string()));
                }
                if let Some(addr) = record.modbus_addr {
                    obj.insert("modbus_address".into(), json!(addr.to_string()));
                }
                if let Some(desc) = &record.modbus_description {
                    obj.insert("description".into(), json!(desc));
                }
            }
            "s7comm" => {
                if let Some(function) = record.s7_fn {
                    obj.insert("s7_function".into(), json!(function.to_string()));
                }
                if let Some(desc) = &record.s7_description {
                    obj.insert("description".into(), json!(desc));
                }
            }
            "xgt_fen" => {
                if let Some(cmd) = record.xgt_cmd {
                    obj.insert("xgt_command".into(), json!(cmd.to_string()));
                }
                if let Some(desc) = &record.xgt_description {
                    obj.insert("description".into(), json!(desc));
                }
            }
            _ => {}
        }

        if let Some(redis) = self.redis.as_ref().filter(|r| r.is_connected()) {
            let src_asset = redis.get_asset_info(&record.sip);
            if !src_asset.asset_id.is_empty() {
                obj.insert("src_asset".into(), serde_json::to_value(&src_asset).unwrap_or_default());
            }
            let dst_asset = redis.get_asset_info(&record.dip);
            if !dst_asset.asset_id.is_empty() {
                obj.insert("dst_asset".into(), serde_json::to_value(&dst_asset).unwrap_or_default());
            }
        }

        doc
    }
}
