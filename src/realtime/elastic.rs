//! Elasticsearch bulk client
//!
//! Documents are staged as alternating action/document NDJSON lines in a
//! mutex-guarded buffer and shipped either when the buffer reaches twice the
//! bulk size or on the background flusher's tick. The buffer is always
//! swapped out under the lock and sent without it, so a slow cluster can
//! never deadlock the flusher against a worker inside `add_to_bulk`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::ElasticConfig;

const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct ElasticClient {
    config: ElasticConfig,
    client: reqwest::blocking::Client,
    connected: AtomicBool,
    /// Alternating action/document lines
    bulk: Mutex<Vec<String>>,
    /// Serialises all network egress through the shared HTTP client
    http: Mutex<()>,
    stop_flush: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
    total_docs: AtomicU64,
}

impl ElasticClient {
    pub fn new(config: ElasticConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(config.use_https)
            .build()?;

        info!(
            "elasticsearch configured: bulk_size={}, flush_interval={}ms",
            config.effective_bulk_size(),
            config.effective_flush_interval_ms()
        );

        Ok(Self {
            config,
            client,
            connected: AtomicBool::new(false),
            bulk: Mutex::new(Vec::new()),
            http: Mutex::new(()),
            stop_flush: AtomicBool::new(false),
            flusher: Mutex::new(None),
            total_docs: AtomicU64::new(0),
        })
    }

    pub fn build_url(&self, path: &str) -> String {
        let scheme = if self.config.use_https { "https" } else { "http" };
        if path.is_empty() {
            format!("{}://{}:{}", scheme, self.config.host, self.config.port)
        } else {
            format!("{}://{}:{}/{}", scheme, self.config.host, self.config.port, path)
        }
    }

    /// Daily index for a protocol, dated in UTC
    pub fn time_based_index(&self, protocol: &str) -> String {
        format!(
            "{}-{}-{}",
            self.config.index_prefix,
            protocol,
            Utc::now().format("%Y.%m.%d")
        )
    }

    /// Handshake against the root URL and start the background flusher
    pub fn connect(this: &Arc<Self>) -> bool {
        let mut request = this.client.get(this.build_url(""));
        if !this.config.username.is_empty() {
            request = request.basic_auth(&this.config.username, Some(&this.config.password));
        }
        match request.send() {
            Ok(_) => {}
            Err(e) => {
                error!("elasticsearch connection test failed: {e}");
                return false;
            }
        }

        this.connected.store(true, Ordering::SeqCst);
        info!("connected to elasticsearch at {}:{}", this.config.host, this.config.port);

        let client = Arc::clone(this);
        let interval = Duration::from_millis(this.config.effective_flush_interval_ms());
        *this.flusher.lock() = Some(std::thread::spawn(move || {
            info!("elasticsearch flusher started ({}ms interval)", interval.as_millis());
            while !client.stop_flush.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                client.flush_bulk();
            }
            info!("elasticsearch flusher stopped");
        }));

        true
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stage a document for the next bulk request
    pub fn add_to_bulk(&self, protocol: &str, document: &Value) -> bool {
        if !self.is_connected() {
            return false;
        }

        let action = json!({ "index": { "_index": self.time_based_index(protocol) } });

        let full = {
            let mut bulk = self.bulk.lock();
            bulk.push(action.to_string());
            bulk.push(document.to_string());

            if bulk.len() >= self.config.effective_bulk_size() * 2 {
                // Swap the buffer out under the lock, send without it
                Some(std::mem::take(&mut *bulk))
            } else {
                None
            }
        };

        match full {
            Some(lines) => self.send_lines(&lines),
            None => true,
        }
    }

    /// Send whatever is buffered, if anything
    pub fn flush_bulk(&self) -> bool {
        let lines = {
            let mut bulk = self.bulk.lock();
            if bulk.is_empty() {
                return true;
            }
            std::mem::take(&mut *bulk)
        };
        self.send_lines(&lines)
    }

    fn send_lines(&self, lines: &[String]) -> bool {
        if lines.is_empty() {
            return true;
        }
        if !self.is_connected() {
            error!("elasticsearch not connected, dropping bulk batch");
            return false;
        }

        let doc_count = lines.len() / 2;
        let mut body = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }

        let ok = self.send_request(&self.build_url("_bulk"), reqwest::Method::POST, body);
        if ok {
            let total = self.total_docs.fetch_add(doc_count as u64, Ordering::Relaxed) + doc_count as u64;
            if total % 1000 < doc_count as u64 || doc_count >= 1000 {
                info!("elasticsearch: {total} documents sent");
            }
        } else {
            error!("elasticsearch bulk flush failed for {doc_count} document(s)");
        }
        ok
    }

    /// Single network egress with bounded retry
    fn send_request(&self, url: &str, method: reqwest::Method, body: String) -> bool {
        let _serial = self.http.lock();

        for attempt in 1..=MAX_RETRIES {
            let mut request = self
                .client
                .request(method.clone(), url)
                .header("Content-Type", "application/json")
                .body(body.clone());
            if !self.config.username.is_empty() {
                request = request.basic_auth(&self.config.username, Some(&self.config.password));
            }

            match request.send() {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => {
                    warn!(
                        "elasticsearch request failed (attempt {attempt}/{MAX_RETRIES}): status {}",
                        response.status()
                    );
                }
                Err(e) => {
                    warn!("elasticsearch request failed (attempt {attempt}/{MAX_RETRIES}): {e}");
                }
            }

            if attempt < MAX_RETRIES {
                std::thread::sleep(RETRY_BACKOFF);
            }
        }

        error!("elasticsearch request failed after {MAX_RETRIES} attempts");
        false
    }

    /// Create an index with the standard record mapping
    pub fn create_index(&self, index: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mapping = json!({
            "mappings": {
                "properties": {
                    "@timestamp": { "type": "date" },
                    "protocol": { "type": "keyword" },
                    "src_ip": { "type": "ip" },
                    "dst_ip": { "type": "ip" },
                    "src_port": { "type": "integer" },
                    "dst_port": { "type": "integer" },
                    "src_mac": { "type": "keyword" },
                    "dst_mac": { "type": "keyword" },
                    "direction": { "type": "keyword" },
                    "src_asset": { "type": "object" },
                    "dst_asset": { "type": "object" },
                    "protocol_details": { "type": "object" },
                    "features": { "type": "object" }
                }
            }
        });
        self.send_request(&self.build_url(index), reqwest::Method::PUT, mapping.to_string())
    }

    pub fn delete_index(&self, index: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.send_request(&self.build_url(index), reqwest::Method::DELETE, String::new())
    }

    /// Stop the flusher and ship whatever is still buffered
    pub fn disconnect(&self) {
        self.stop_flush.store(true, Ordering::SeqCst);
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        self.flush_bulk();
        self.connected.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn buffered_lines(&self) -> usize {
        self.bulk.lock().len()
    }
}

impl Drop for ElasticClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ElasticConfig {
        ElasticConfig {
            host: "es.example".into(),
            port: 9200,
            username: String::new(),
            password: String::new(),
            index_prefix: "ics-packets".into(),
            use_https: false,
            bulk_size: 2,
            flush_interval_ms: 100,
        }
    }

    #[test]
    fn test_build_url() {
        let client = ElasticClient::new(test_config()).unwrap();
        assert_eq!(client.build_url(""), "http://es.example:9200");
        assert_eq!(client.build_url("_bulk"), "http://es.example:9200/_bulk");

        let mut cfg = test_config();
        cfg.use_https = true;
        let client = ElasticClient::new(cfg).unwrap();
        assert_eq!(client.build_url(""), "https://es.example:9200");
    }

    #[test]
    fn test_time_based_index_shape() {
        let client = ElasticClient::new(test_config()).unwrap();
        let index = client.time_based_index("modbus");
        assert!(index.starts_with("ics-packets-modbus-"));
        // prefix-protocol-YYYY.MM.DD
        let date = index.rsplit('-').next().unwrap();
        assert_eq!(date.len(), 10);
        assert_eq!(date.matches('.').count(), 2);
    }

    #[test]
    fn test_add_to_bulk_requires_connection() {
        let client = ElasticClient::new(test_config()).unwrap();
        assert!(!client.add_to_bulk("modbus", &json!({"a": 1})));
        assert_eq!(client.buffered_lines(), 0);
    }

    #[test]
    fn test_bulk_buffers_action_and_document_pairs() {
        let client = ElasticClient::new(test_config()).unwrap();
        client.connected.store(true, Ordering::SeqCst);

        assert!(client.add_to_bulk("modbus", &json!({"a": 1})));
        assert_eq!(client.buffered_lines(), 2);

        let bulk = client.bulk.lock();
        assert!(bulk[0].contains("\"index\""));
        assert!(bulk[0].contains("ics-packets-modbus-"));
        assert_eq!(bulk[1], "{\"a\":1}");
        drop(bulk);

        // Avoid a real network call from disconnect's final flush
        client.bulk.lock().clear();
        client.connected.store(false, Ordering::SeqCst);
    }
}
