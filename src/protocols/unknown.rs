//! Fallback parser for UDP packets no application dissector claimed

use serde_json::json;

use crate::assets::AssetCatalog;
use crate::core::{PacketInfo, UnifiedRecord};

use super::base_record;

pub struct UnknownParser;

impl UnknownParser {
    pub fn is_protocol(&self, _info: &PacketInfo<'_>) -> bool {
        true
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        let mut record = base_record(info, "unknown", "unknown", assets);
        record.len = Some(info.payload_size() as u32);
        record.details = Some(json!({ "len": info.payload_size() }));
        vec![record]
    }
}
