//! otparse: passive OT/ICS traffic dissector
//!
//! Decodes captured frames through successive protocol layers, classifies the
//! application payload among a fixed set of ICS and general protocols,
//! correlates requests with responses where the protocol demands it, enriches
//! records with asset identity lookups and fans the result out to
//! time-bucketed CSV/JSONL files and to Elasticsearch/Redis.

pub mod assets;
pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod protocols;
pub mod realtime;
pub mod sink;

pub use assets::AssetCatalog;
pub use config::Config;
pub use core::{PacketInfo, UnifiedRecord};
pub use engine::PacketEngine;
pub use sink::RecordSink;
