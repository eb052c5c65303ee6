//! Core packet and record types

pub mod packet;
pub mod record;

pub use packet::{canonical_flow_id, format_mac, format_timestamp, PacketInfo};
pub use record::UnifiedRecord;
