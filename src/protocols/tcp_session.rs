//! Fallback parser for TCP packets no application dissector claimed

use serde_json::json;

use crate::assets::AssetCatalog;
use crate::core::packet::{TH_ACK, TH_FIN, TH_RST, TH_SYN};
use crate::core::{PacketInfo, UnifiedRecord};

use super::base_record;

pub struct TcpSessionParser;

impl TcpSessionParser {
    pub fn is_protocol(&self, _info: &PacketInfo<'_>) -> bool {
        true
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        let mut record = base_record(info, "tcp_session", "unknown", assets);
        record.len = Some(info.payload_size() as u32);
        record.details = Some(json!({
            "seq": info.tcp_seq,
            "ack": info.tcp_ack,
            "flags": {
                "syn": (info.tcp_flags & TH_SYN != 0) as u8,
                "ack": (info.tcp_flags & TH_ACK != 0) as u8,
                "fin": (info.tcp_flags & TH_FIN != 0) as u8,
                "rst": (info.tcp_flags & TH_RST != 0) as u8,
            },
        }));
        vec![record]
    }
}
