//! Command-line surface and capture loop
//!
//! Wires the capture source into the packet engine and owns the shutdown
//! drain: stop capture, drain the queue, stop workers, flush the sink, stop
//! the Redis writer and pool, stop the Elasticsearch flusher and final-flush.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use clap::Parser;
use tracing::{error, info, warn};

use crate::assets::AssetCatalog;
use crate::config::Config;
use crate::engine::capture::{open_device, open_file};
use crate::engine::PacketEngine;
use crate::realtime::{ElasticClient, RealtimePipeline, RedisStore};
use crate::sink::RecordSink;

#[derive(Parser, Debug)]
#[command(name = "otparse")]
#[command(version, about = "Passive OT/ICS traffic dissector")]
pub struct Cli {
    /// Network interface to capture
    #[arg(short, long, env = "NETWORK_INTERFACE", default_value = "any")]
    pub interface: String,

    /// PCAP file to read (offline mode)
    #[arg(short, long)]
    pub pcap: Option<PathBuf>,

    /// BPF filter string
    #[arg(short, long, env = "BPF_FILTER")]
    pub filter: Option<String>,

    /// Output directory for time-bucketed CSV/JSONL files
    #[arg(short, long, env = "OUTPUT_DIR", default_value = "./output")]
    pub output: PathBuf,

    /// File rolling interval in minutes (0 = single output_all bucket)
    #[arg(short, long, env = "ROLLING_INTERVAL", default_value_t = 0)]
    pub rolling: u32,

    /// Realtime mode: file output off, Elasticsearch/Redis sinks on
    #[arg(long)]
    pub realtime: bool,

    /// Worker threads (0 = auto)
    #[arg(short = 't', long, env = "PARSER_THREADS", default_value_t = 0)]
    pub threads: usize,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    /// Fold the flags over the environment-derived defaults
    pub fn into_config(self) -> Config {
        let mut config = Config::default();
        config.capture.interface = self.interface;
        config.capture.pcap_file = self.pcap;
        if self.filter.is_some() {
            config.capture.bpf_filter = self.filter;
        }
        config.output.dir = self.output;
        config.output.rolling_interval = self.rolling;
        if self.realtime {
            config.output.file_output = false;
        }
        config.workers = self.threads;
        config
    }
}

/// libpcap hands timestamps over as (seconds, microseconds)
fn capture_timestamp(sec: i64, usec: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(sec, (usec as u32).saturating_mul(1000))
        .single()
        .unwrap_or_else(Utc::now)
}

/// Run the dissector to completion (offline) or until a stop signal (live)
pub fn run(config: Config) -> anyhow::Result<()> {
    let realtime = !config.output.file_output;

    info!(
        "configuration: source={}, filter={:?}, output={}, rolling={}min, mode={}, workers={}",
        config
            .capture
            .pcap_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| config.capture.interface.clone()),
        config.capture.bpf_filter,
        config.output.dir.display(),
        config.output.rolling_interval,
        if realtime { "realtime" } else { "with-files" },
        config.workers,
    );

    let assets = Arc::new(AssetCatalog::load(&config.assets));
    let sink = Arc::new(RecordSink::new(
        config.output.dir.clone(),
        config.output.rolling_interval,
        config.output.file_output,
    ));

    // Realtime backends only exist in realtime mode, and only when their
    // connection handshake succeeds
    let (elastic, redis) = if realtime {
        let elastic = match ElasticClient::new(config.elastic.clone()) {
            Ok(client) => {
                let client = Arc::new(client);
                if ElasticClient::connect(&client) {
                    Some(client)
                } else {
                    warn!("elasticsearch connection failed, documents will not be indexed");
                    None
                }
            }
            Err(e) => {
                warn!("elasticsearch client setup failed: {e:#}");
                None
            }
        };

        let redis = match RedisStore::new(config.redis.clone()) {
            Ok(store) => {
                if store.connect() {
                    store.create_protocol_streams();
                    Some(Arc::new(store))
                } else {
                    warn!("redis connection failed, stream output disabled");
                    None
                }
            }
            Err(e) => {
                warn!("redis client setup failed: {e:#}");
                None
            }
        };

        (elastic, redis)
    } else {
        info!("file output mode: elasticsearch and redis disabled");
        (None, None)
    };

    let pipeline = Arc::new(RealtimePipeline::new(elastic.clone(), redis.clone()));
    {
        let pipeline = Arc::clone(&pipeline);
        sink.set_callback(Box::new(move |record| pipeline.send(record)));
    }

    let mut engine = PacketEngine::new(config.workers, assets, Arc::clone(&sink));
    engine.start();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("stop signal received, shutting down");
            running.store(false, Ordering::SeqCst);
        })
        .context("could not install signal handler")?;
    }

    let offline = config.capture.pcap_file.is_some();
    if let Some(path) = &config.capture.pcap_file {
        run_offline(path, config.capture.bpf_filter.as_deref(), &engine, &running)?;
    } else {
        run_live(
            &config.capture.interface,
            config.capture.bpf_filter.as_deref(),
            &engine,
            &running,
            redis.as_deref(),
        )?;
    }

    // Shutdown drain
    info!("shutting down");
    if !offline {
        engine.wait_for_completion();
    }
    engine.stop();

    if config.output.file_output {
        info!("generating output files");
        sink.flush();
    }

    if let Some(redis) = &redis {
        redis.log_stats();
        redis.disconnect();
    }
    if let Some(elastic) = &elastic {
        elastic.disconnect();
    }

    info!("shutdown complete, {} packet(s) processed", engine.packets_processed());
    Ok(())
}

fn run_offline(
    path: &std::path::Path,
    filter: Option<&str>,
    engine: &PacketEngine,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let mut capture = open_file(path, filter)?;

    loop {
        if !running.load(Ordering::SeqCst) {
            info!("file processing interrupted");
            break;
        }
        match capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                engine.enqueue(capture_timestamp(ts.tv_sec as i64, ts.tv_usec as i64), packet.data);
            }
            Err(pcap::Error::NoMorePackets) => {
                info!("file reading completed");
                break;
            }
            Err(e) => {
                error!("capture error: {e}");
                break;
            }
        }
    }

    // Bounded input: wait for the queue to drain before the caller stops the
    // workers
    engine.wait_for_completion();
    Ok(())
}

fn run_live(
    interface: &str,
    filter: Option<&str>,
    engine: &PacketEngine,
    running: &AtomicBool,
    redis: Option<&RedisStore>,
) -> anyhow::Result<()> {
    let mut capture = open_device(interface, filter)?;

    info!("packet capture started");
    let mut interval_packets: u64 = 0;
    let mut last_stats = Instant::now();

    while running.load(Ordering::SeqCst) {
        match capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                engine.enqueue(capture_timestamp(ts.tv_sec as i64, ts.tv_usec as i64), packet.data);
                interval_packets += 1;
            }
            Err(pcap::Error::TimeoutExpired) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                error!("capture error: {e}");
                break;
            }
        }

        if last_stats.elapsed() >= Duration::from_secs(30) {
            info!("packets captured in last 30s: {interval_packets}");
            if let Some(redis) = redis {
                redis.log_stats();
            }
            interval_packets = 0;
            last_stats = Instant::now();
        }
    }

    Ok(())
}
