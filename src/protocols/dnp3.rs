//! DNP3 link-layer header dissector

use serde_json::json;

use crate::assets::AssetCatalog;
use crate::core::{PacketInfo, UnifiedRecord};

use super::base_record;

pub struct Dnp3Parser;

impl Dnp3Parser {
    pub fn is_protocol(&self, info: &PacketInfo<'_>) -> bool {
        (info.is_tcp() || info.is_udp())
            && (info.dst_port == 20000 || info.src_port == 20000)
            && info.payload_size() >= 2
            && info.payload[0] == 0x05
            && info.payload[1] == 0x64
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        let p = info.payload;

        let mut len = 0u8;
        let mut ctrl = 0u8;
        let mut dest = 0u16;
        let mut src = 0u16;
        let mut direction = "unknown";

        if p.len() >= 10 {
            len = p[2];
            ctrl = p[3];
            // Link-layer addresses are little-endian on the wire
            dest = u16::from_le_bytes([p[4], p[5]]);
            src = u16::from_le_bytes([p[6], p[7]]);
            direction = if ctrl & 0x80 != 0 { "request" } else { "response" };
        }

        let mut record = base_record(info, "dnp3", direction, assets);
        record.len = Some(info.payload_size() as u32);
        record.dnp3_len = Some(len);
        record.dnp3_ctrl = Some(ctrl);
        record.dnp3_dest = Some(dest);
        record.dnp3_src = Some(src);
        record.details = Some(json!({
            "len": len,
            "ctrl": ctrl,
            "dest": dest,
            "src": src,
        }));

        vec![record]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testutil::tcp_info;

    #[test]
    fn test_dnp3_admission_needs_magic() {
        let good = [0x05, 0x64, 0x05, 0xc4, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
        let bad = [0x06, 0x64, 0x05, 0xc4, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
        assert!(Dnp3Parser.is_protocol(&tcp_info("10.0.0.1", 40000, "10.0.0.2", 20000, &good)));
        assert!(!Dnp3Parser.is_protocol(&tcp_info("10.0.0.1", 40000, "10.0.0.2", 20000, &bad)));
    }

    #[test]
    fn test_dnp3_request_direction() {
        // ctrl 0xc4 has the DIR bit set
        let payload = [0x05, 0x64, 0x05, 0xc4, 0x01, 0x00, 0x02, 0x00, 0xaa, 0xbb];
        let info = tcp_info("10.0.0.1", 40000, "10.0.0.2", 20000, &payload);
        let records = Dnp3Parser.parse(&info, &AssetCatalog::default());

        let r = &records[0];
        assert_eq!(r.dir, "request");
        assert_eq!(r.dnp3_len, Some(5));
        assert_eq!(r.dnp3_ctrl, Some(0xc4));
        assert_eq!(r.dnp3_dest, Some(1));
        assert_eq!(r.dnp3_src, Some(2));
    }

    #[test]
    fn test_dnp3_short_frame_direction_unknown() {
        let payload = [0x05, 0x64, 0x05];
        let info = tcp_info("10.0.0.1", 40000, "10.0.0.2", 20000, &payload);
        let records = Dnp3Parser.parse(&info, &AssetCatalog::default());
        assert_eq!(records[0].dir, "unknown");
        assert_eq!(records[0].dnp3_dest, Some(0));
    }
}
