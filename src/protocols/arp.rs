//! ARP dissector

use serde_json::json;

use crate::assets::AssetCatalog;
use crate::core::packet::format_mac;
use crate::core::{PacketInfo, UnifiedRecord};

use super::base_record;

/// 28-byte ARP payload for IPv4 over Ethernet
const ARP_LEN: usize = 28;

pub struct ArpParser;

impl ArpParser {
    pub fn is_protocol(&self, info: &PacketInfo<'_>) -> bool {
        info.eth_type == 0x0806
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        let p = info.payload;
        if p.len() < ARP_LEN {
            return Vec::new();
        }

        let op_code = u16::from_be_bytes([p[6], p[7]]);
        let sender_mac = format_mac(&p[8..14]);
        let sender_ip = format!("{}.{}.{}.{}", p[14], p[15], p[16], p[17]);
        let target_mac = format_mac(&p[18..24]);
        let target_ip = format!("{}.{}.{}.{}", p[24], p[25], p[26], p[27]);

        let direction = match op_code {
            1 => "request",
            2 => "response",
            _ => "other",
        };

        let mut record = base_record(info, "arp", direction, assets);
        record.len = Some(info.payload_size() as u32);
        record.arp_op = Some(op_code);
        record.arp_tmac = Some(target_mac.clone());
        record.arp_tip = Some(target_ip.clone());
        record.details = Some(json!({
            "op": op_code,
            "smac": sender_mac,
            "sip": sender_ip,
            "tmac": target_mac,
            "tip": target_ip,
        }));

        vec![record]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PacketInfo;

    fn arp_payload(op: u16) -> Vec<u8> {
        let mut p = vec![
            0x00, 0x01, // hardware type: ethernet
            0x08, 0x00, // protocol type: IPv4
            6, 4, // address lengths
        ];
        p.extend_from_slice(&op.to_be_bytes());
        p.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]); // sender MAC
        p.extend_from_slice(&[10, 0, 0, 1]); // sender IP
        p.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // target MAC
        p.extend_from_slice(&[10, 0, 0, 2]); // target IP
        p
    }

    fn arp_info(payload: &[u8]) -> PacketInfo<'_> {
        PacketInfo {
            timestamp: "2023-05-10T02:24:15.000001Z".to_string(),
            flow_id: String::new(),
            src_mac: "aa:bb:cc:dd:ee:ff".to_string(),
            dst_mac: "ff:ff:ff:ff:ff:ff".to_string(),
            eth_type: 0x0806,
            src_ip: String::new(),
            dst_ip: String::new(),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            tcp_seq: 0,
            tcp_ack: 0,
            tcp_flags: 0,
            payload,
        }
    }

    #[test]
    fn test_arp_request() {
        let payload = arp_payload(1);
        let mut parser = ArpParser;
        let records = parser.parse(&arp_info(&payload), &AssetCatalog::default());

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.protocol, "arp");
        assert_eq!(r.dir, "request");
        assert_eq!(r.arp_op, Some(1));
        assert_eq!(r.arp_tmac.as_deref(), Some("00:00:00:00:00:00"));
        assert_eq!(r.arp_tip.as_deref(), Some("10.0.0.2"));
        assert_eq!(r.len, Some(28));
        // No port fields on a non-IP record
        assert_eq!(r.sp, None);
        assert_eq!(r.fl, None);
    }

    #[test]
    fn test_arp_other_opcode() {
        let payload = arp_payload(3);
        let mut parser = ArpParser;
        let records = parser.parse(&arp_info(&payload), &AssetCatalog::default());
        assert_eq!(records[0].dir, "other");
    }

    #[test]
    fn test_arp_short_payload_discarded() {
        let payload = arp_payload(1);
        let mut parser = ArpParser;
        let records = parser.parse(&arp_info(&payload[..20]), &AssetCatalog::default());
        assert!(records.is_empty());
    }
}
