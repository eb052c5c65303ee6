//! Time-bucketed record sink
//!
//! Records accumulate in memory per time bucket and are written out as one
//! CSV plus one JSONL file per bucket on flush. Every `add` also drives the
//! realtime callback synchronously, so the Elasticsearch/Redis fan-out sees
//! records in arrival order regardless of the file-output mode.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Timelike};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::core::record::{UnifiedRecord, CSV_HEADER};

pub type RecordCallback = Box<dyn Fn(&UnifiedRecord) + Send + Sync>;

/// Thread-safe unified record sink
pub struct RecordSink {
    output_dir: PathBuf,
    interval_minutes: u32,
    /// Bucket accumulation off in realtime mode; the callback still fires
    file_output: bool,
    slots: Mutex<BTreeMap<String, Vec<UnifiedRecord>>>,
    callback: Mutex<Option<RecordCallback>>,
}

impl RecordSink {
    pub fn new(output_dir: impl Into<PathBuf>, interval_minutes: u32, file_output: bool) -> Self {
        let output_dir = output_dir.into();
        if file_output {
            if let Err(e) = fs::create_dir_all(&output_dir) {
                error!("could not create output directory {}: {e}", output_dir.display());
            }
        }
        Self {
            output_dir,
            interval_minutes,
            file_output,
            slots: Mutex::new(BTreeMap::new()),
            callback: Mutex::new(None),
        }
    }

    /// Register the realtime fan-out, invoked synchronously from `add`
    pub fn set_callback(&self, callback: RecordCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Bucket label for a record timestamp: `output_YYYYMMDD_HHMM` with the
    /// minute floor-aligned to the rolling interval; interval 0 collapses
    /// everything into `output_all`.
    pub fn time_slot(&self, timestamp: &str) -> Option<String> {
        if self.interval_minutes == 0 {
            return Some("output_all".to_string());
        }
        let Some(head) = timestamp.get(..19) else {
            warn!("invalid timestamp format: {timestamp}");
            return None;
        };
        let parsed = NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S").ok()?;
        let slot_minute = (parsed.minute() / self.interval_minutes) * self.interval_minutes;
        Some(format!(
            "output_{}_{:02}{:02}",
            parsed.format("%Y%m%d"),
            parsed.hour(),
            slot_minute
        ))
    }

    /// Append a record to its time bucket and drive the realtime callback
    pub fn add(&self, record: UnifiedRecord) {
        if self.file_output {
            if let Some(slot) = self.time_slot(&record.timestamp) {
                self.slots.lock().entry(slot).or_default().push(record.clone());
            }
        }

        if let Some(cb) = self.callback.lock().as_ref() {
            cb(&record);
        }
    }

    /// Write every bucket out and clear the map
    pub fn flush(&self) {
        let slots = std::mem::take(&mut *self.slots.lock());
        if slots.is_empty() {
            info!("no buffered records to flush");
            return;
        }

        info!("flushing {} time slot(s)", slots.len());
        for (slot, mut records) in slots {
            // Stable by-timestamp sort preserves the insertion order of
            // per-register Modbus rows that share one timestamp
            records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            if let Err(e) = self.write_slot(&slot, &records) {
                error!("could not write time slot {slot}: {e:#}");
            } else {
                info!("wrote {} record(s) to {slot}", records.len());
            }
        }
    }

    fn write_slot(&self, slot: &str, records: &[UnifiedRecord]) -> anyhow::Result<()> {
        self.write_csv(&self.output_dir.join(format!("{slot}.csv")), records)?;
        self.write_jsonl(&self.output_dir.join(format!("{slot}.jsonl")), records)?;
        Ok(())
    }

    fn write_csv(&self, path: &Path, records: &[UnifiedRecord]) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(CSV_HEADER)?;
        for record in records {
            writer.write_record(record.csv_fields())?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_jsonl(&self, path: &Path, records: &[UnifiedRecord]) -> anyhow::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for record in records {
            serde_json::to_writer(&mut out, record)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.slots.lock().values().map(|v| v.len()).sum()
    }
}

impl Drop for RecordSink {
    fn drop(&mut self) {
        if !self.slots.get_mut().is_empty() {
            warn!("record sink dropped with unflushed data, flushing now");
            self.flush();
        }
    }
}
