//! Packet engine: bounded work queue and worker pool
//!
//! The capture thread copies each frame into an owned buffer and enqueues it;
//! worker threads block on a condition variable, dequeue one frame at a time
//! and run it through their own parser registry. Parser state (the pending
//! request tables) is worker-local, so no locks are taken during parsing.

pub mod capture;
pub mod demux;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::assets::AssetCatalog;
use crate::core::packet::format_timestamp;
use crate::protocols::ParserSet;
use crate::sink::RecordSink;

pub use capture::CaptureError;

/// Queue bound; the producer blocks for space rather than dropping frames
const QUEUE_CAPACITY: usize = 100_000;

/// Frame copied out of the capture buffer
struct OwnedFrame {
    timestamp: DateTime<Utc>,
    data: Vec<u8>,
}

struct EngineShared {
    queue: Mutex<VecDeque<OwnedFrame>>,
    not_empty: Condvar,
    not_full: Condvar,
    stop: AtomicBool,
    queued: AtomicU64,
    processed: AtomicU64,
    assets: Arc<AssetCatalog>,
    sink: Arc<RecordSink>,
}

/// Worker pool with per-worker parser instances
pub struct PacketEngine {
    shared: Arc<EngineShared>,
    workers: Vec<JoinHandle<()>>,
    num_threads: usize,
}

/// Resolve the worker count: 0 means auto (half the cores, capped at 8),
/// explicit values are capped at 16
pub fn worker_count(requested: usize) -> usize {
    if requested == 0 {
        (num_cpus::get() / 2).clamp(1, 8)
    } else {
        requested.min(16)
    }
}

impl PacketEngine {
    pub fn new(requested_threads: usize, assets: Arc<AssetCatalog>, sink: Arc<RecordSink>) -> Self {
        let num_threads = worker_count(requested_threads);
        info!("using {num_threads} worker thread(s)");

        Self {
            shared: Arc::new(EngineShared {
                queue: Mutex::new(VecDeque::new()),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                stop: AtomicBool::new(false),
                queued: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                assets,
                sink,
            }),
            workers: Vec::new(),
            num_threads,
        }
    }

    /// Spawn the worker threads
    pub fn start(&mut self) {
        for worker_id in 0..self.num_threads {
            let shared = Arc::clone(&self.shared);
            self.workers.push(std::thread::spawn(move || worker_loop(worker_id, shared)));
        }
        info!("worker threads started");
    }

    /// Copy a captured frame into the queue, blocking for space when full
    pub fn enqueue(&self, timestamp: DateTime<Utc>, data: &[u8]) {
        let shared = &self.shared;
        let mut queue = shared.queue.lock();
        while queue.len() >= QUEUE_CAPACITY && !shared.stop.load(Ordering::Relaxed) {
            shared.not_full.wait(&mut queue);
        }
        if shared.stop.load(Ordering::Relaxed) {
            return;
        }
        queue.push_back(OwnedFrame { timestamp, data: data.to_vec() });
        shared.queued.fetch_add(1, Ordering::Relaxed);
        shared.not_empty.notify_one();
    }

    /// Poll until the queue is empty (offline bounded-input mode)
    pub fn wait_for_completion(&self) {
        info!("waiting for queue to empty");
        loop {
            if self.shared.queue.lock().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));

            let queued = self.shared.queued.load(Ordering::Relaxed);
            let processed = self.shared.processed.load(Ordering::Relaxed);
            if queued > 0 {
                debug!(
                    "progress: {processed}/{queued} ({:.1}%)",
                    processed as f64 / queued as f64 * 100.0
                );
            }
        }
        info!("all queued packets processed");
    }

    /// Stop the workers, draining whatever is still queued
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!("stopping worker threads");
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!(
            "worker threads stopped, {} packet(s) processed",
            self.shared.processed.load(Ordering::Relaxed)
        );
    }

    pub fn packets_processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

impl Drop for PacketEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(worker_id: usize, shared: Arc<EngineShared>) {
    debug!("worker {worker_id} started");
    let mut parsers = ParserSet::new(Arc::clone(&shared.assets));

    loop {
        let frame = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(frame) = queue.pop_front() {
                    shared.not_full.notify_one();
                    break Some(frame);
                }
                if shared.stop.load(Ordering::Relaxed) {
                    break None;
                }
                shared.not_empty.wait(&mut queue);
            }
        };

        let Some(frame) = frame else { break };

        let timestamp = format_timestamp(frame.timestamp);
        for record in demux::handle_frame(&frame.data, &timestamp, &mut parsers) {
            shared.sink.add(record);
        }
        shared.processed.fetch_add(1, Ordering::Relaxed);
    }

    debug!("worker {worker_id} stopped");
}

#[cfg(test)]
mod tests {
    use super::demux::frames;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_worker_count_rules() {
        let auto = worker_count(0);
        assert!((1..=8).contains(&auto));
        assert_eq!(worker_count(4), 4);
        assert_eq!(worker_count(64), 16);
    }

    #[test]
    fn test_engine_processes_frames_into_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordSink::new(dir.path(), 0, true));
        let assets = Arc::new(AssetCatalog::default());

        let mut engine = PacketEngine::new(2, assets, Arc::clone(&sink));
        engine.start();

        let ts = Utc.with_ymd_and_hms(2023, 5, 10, 2, 24, 15).unwrap();
        let mbap = [0, 1, 0, 0, 0, 6, 1, 3, 0, 12, 0, 3];
        for _ in 0..10 {
            let frame = frames::tcp_frame([192, 168, 1, 10], 49152, [192, 168, 1, 2], 502, &mbap);
            engine.enqueue(ts, &frame);
        }

        engine.wait_for_completion();
        engine.stop();
        assert_eq!(engine.packets_processed(), 10);

        sink.flush();
        let csv = std::fs::read_to_string(dir.path().join("output_all.csv")).unwrap();
        // Header plus ten records
        assert_eq!(csv.lines().count(), 11);
        assert!(csv.lines().nth(1).unwrap().contains("modbus"));
    }

    #[test]
    fn test_stop_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordSink::new(dir.path(), 0, false));
        let assets = Arc::new(AssetCatalog::default());

        let mut engine = PacketEngine::new(1, assets, sink);
        let ts = Utc.with_ymd_and_hms(2023, 5, 10, 2, 24, 15).unwrap();
        let frame = frames::udp_frame([10, 0, 0, 1], 40000, [10, 0, 0, 2], 9999, &[1, 2, 3]);
        for _ in 0..50 {
            engine.enqueue(ts, &frame);
        }

        // Workers start after the queue is already populated; stop must still
        // drain every frame
        engine.start();
        engine.stop();
        assert_eq!(engine.packets_processed(), 50);
    }
}
