//! Asynchronous Redis writer
//!
//! Write tasks go through a bounded queue with drop-on-overflow: losing a
//! stream record under burst load is acceptable, blocking a packet worker on
//! Redis is not. Writer threads drain the queue in batches and issue each
//! batch as one pipeline on a pooled connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::pool::ConnectionPool;

/// Tasks drained per worker iteration
const BATCH_SIZE: usize = 50;
/// Approximate stream cap handed to XADD MAXLEN
const STREAM_MAXLEN: u64 = 100_000;
/// Pool checkout bound per batch
const POOL_TIMEOUT: Duration = Duration::from_millis(1000);
/// Status line cadence per worker
const STATUS_PERIOD: Duration = Duration::from_secs(10);

/// One queued Redis write
pub enum WriteTask {
    StreamAppend { stream: String, json: String },
    CounterIncr { key: String },
    AssetCache { ip: String, json: String, ttl: u64 },
}

struct WriterShared {
    queue: Mutex<VecDeque<WriteTask>>,
    pending: Condvar,
    running: AtomicBool,
    max_queue: usize,
    total_written: AtomicU64,
    total_dropped: AtomicU64,
}

impl WriterShared {
    /// Push unless the queue is full; every 1000th drop is logged
    fn enqueue(&self, task: WriteTask) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_queue {
            let dropped = self.total_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 1000 == 1 {
                warn!("redis write queue full, {dropped} task(s) dropped");
            }
            return false;
        }
        queue.push_back(task);
        self.pending.notify_one();
        true
    }
}

/// Point-in-time writer statistics
#[derive(Debug, Clone, Copy)]
pub struct WriterStats {
    pub queue_size: usize,
    pub total_written: u64,
    pub total_dropped: u64,
}

pub struct AsyncWriter {
    shared: Arc<WriterShared>,
    pool: Arc<ConnectionPool>,
    num_writers: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncWriter {
    pub fn new(pool: Arc<ConnectionPool>, num_writers: usize, queue_size: usize) -> Self {
        Self {
            shared: Arc::new(WriterShared {
                queue: Mutex::new(VecDeque::new()),
                pending: Condvar::new(),
                running: AtomicBool::new(false),
                max_queue: queue_size,
                total_written: AtomicU64::new(0),
                total_dropped: AtomicU64::new(0),
            }),
            pool,
            num_writers,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut threads = self.threads.lock();
        for worker_id in 0..self.num_writers {
            let shared = Arc::clone(&self.shared);
            let pool = Arc::clone(&self.pool);
            threads.push(std::thread::spawn(move || writer_loop(worker_id, shared, pool)));
        }
        info!(
            "async writer started ({} thread(s), queue={})",
            self.num_writers, self.shared.max_queue
        );
    }

    /// Stop the workers; they drain the queue before exiting
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.pending.notify_all();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }

        let stats = self.stats();
        info!(
            "async writer stopped: written={}, dropped={}, remaining={}",
            stats.total_written, stats.total_dropped, stats.queue_size
        );
    }

    pub fn write_stream(&self, stream: String, json: String) -> bool {
        self.shared.enqueue(WriteTask::StreamAppend { stream, json })
    }

    pub fn incr_counter(&self, key: String) -> bool {
        self.shared.enqueue(WriteTask::CounterIncr { key })
    }

    pub fn cache_asset(&self, ip: String, json: String, ttl: u64) -> bool {
        self.shared.enqueue(WriteTask::AssetCache { ip, json, ttl })
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            queue_size: self.shared.queue.lock().len(),
            total_written: self.shared.total_written.load(Ordering::Relaxed),
            total_dropped: self.shared.total_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn writer_loop(worker_id: usize, shared: Arc<WriterShared>, pool: Arc<ConnectionPool>) {
    debug!("redis writer {worker_id} started");

    let mut batch: Vec<WriteTask> = Vec::with_capacity(BATCH_SIZE);
    let mut local_written: u64 = 0;
    let mut last_status = Instant::now();

    // Exits on the stop flag after finishing the batch in flight; anything
    // still queued at that point is reported as remaining, not drained into a
    // possibly-dead server.
    while shared.running.load(Ordering::SeqCst) {
        {
            let mut queue = shared.queue.lock();
            if queue.is_empty() {
                shared.pending.wait_for(&mut queue, Duration::from_millis(100));
            }
            if !shared.running.load(Ordering::SeqCst) && queue.is_empty() {
                break;
            }
            while batch.len() < BATCH_SIZE {
                match queue.pop_front() {
                    Some(task) => batch.push(task),
                    None => break,
                }
            }
        }

        if batch.is_empty() {
            continue;
        }

        match pool.acquire_guard(POOL_TIMEOUT) {
            Some(mut conn) => {
                let count = batch.len() as u64;
                if send_batch(&mut conn, &batch) {
                    local_written += count;
                    shared.total_written.fetch_add(count, Ordering::Relaxed);
                } else {
                    shared.total_dropped.fetch_add(count, Ordering::Relaxed);
                }
                batch.clear();
            }
            None => {
                warn!("redis writer {worker_id}: no connection, re-queueing batch");
                let mut queue = shared.queue.lock();
                for task in batch.drain(..) {
                    if queue.len() < shared.max_queue {
                        queue.push_back(task);
                    } else {
                        shared.total_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        if last_status.elapsed() >= STATUS_PERIOD {
            info!(
                "redis writer {worker_id}: written={local_written}, queue={}",
                shared.queue.lock().len()
            );
            local_written = 0;
            last_status = Instant::now();
        }
    }

    debug!("redis writer {worker_id} stopped");
}

/// Issue one batch as a pipeline: all commands are sent before any reply is
/// read.
fn send_batch(conn: &mut redis::Connection, batch: &[WriteTask]) -> bool {
    let mut pipe = redis::pipe();
    for task in batch {
        match task {
            WriteTask::StreamAppend { stream, json } => {
                pipe.cmd("XADD")
                    .arg(stream)
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(STREAM_MAXLEN)
                    .arg("*")
                    .arg("data")
                    .arg(json)
                    .ignore();
            }
            WriteTask::CounterIncr { key } => {
                pipe.cmd("INCRBY").arg(key).arg(1).ignore();
            }
            WriteTask::AssetCache { ip, json, ttl } => {
                pipe.cmd("SETEX")
                    .arg(format!("cache:asset:{ip}"))
                    .arg(*ttl)
                    .arg(json)
                    .ignore();
            }
        }
    }

    match pipe.query::<()>(conn) {
        Ok(()) => true,
        Err(e) => {
            warn!("redis pipeline failed for {} task(s): {e}", batch.len());
            false
        }
    }
}
