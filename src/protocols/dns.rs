//! DNS header dissector

use serde_json::json;

use crate::assets::AssetCatalog;
use crate::core::{PacketInfo, UnifiedRecord};

use super::base_record;

pub struct DnsParser;

impl DnsParser {
    pub fn is_protocol(&self, info: &PacketInfo<'_>) -> bool {
        info.is_udp()
            && (info.dst_port == 53 || info.src_port == 53)
            && info.payload_size() >= 12
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        let p = info.payload;
        if p.len() < 12 {
            return Vec::new();
        }

        let tid = u16::from_be_bytes([p[0], p[1]]);
        let flags = u16::from_be_bytes([p[2], p[3]]);
        let qdcount = u16::from_be_bytes([p[4], p[5]]);
        let ancount = u16::from_be_bytes([p[6], p[7]]);

        let direction = if flags & 0x8000 != 0 { "response" } else { "request" };

        let mut record = base_record(info, "dns", direction, assets);
        record.len = Some(info.payload_size() as u32);
        record.dns_tid = Some(tid);
        record.dns_fl = Some(flags);
        record.dns_qc = Some(qdcount);
        record.dns_ac = Some(ancount);
        record.details = Some(json!({
            "tid": tid,
            "fl": flags,
            "qc": qdcount,
            "ac": ancount,
        }));

        vec![record]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testutil::udp_info;

    fn dns_header(tid: u16, flags: u16, qd: u16, an: u16) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&tid.to_be_bytes());
        p.extend_from_slice(&flags.to_be_bytes());
        p.extend_from_slice(&qd.to_be_bytes());
        p.extend_from_slice(&an.to_be_bytes());
        p.extend_from_slice(&[0u8; 4]); // ns/ar counts
        p
    }

    #[test]
    fn test_dns_query_direction() {
        let payload = dns_header(0x1234, 0x0100, 1, 0);
        let info = udp_info("10.0.0.1", 5353, "10.0.0.2", 53, &payload);
        let records = DnsParser.parse(&info, &AssetCatalog::default());

        let r = &records[0];
        assert_eq!(r.protocol, "dns");
        assert_eq!(r.dir, "request");
        assert_eq!(r.dns_tid, Some(0x1234));
        assert_eq!(r.dns_qc, Some(1));
    }

    #[test]
    fn test_dns_response_direction() {
        let payload = dns_header(0x1234, 0x8180, 1, 2);
        let info = udp_info("10.0.0.2", 53, "10.0.0.1", 5353, &payload);
        let records = DnsParser.parse(&info, &AssetCatalog::default());
        assert_eq!(records[0].dir, "response");
        assert_eq!(records[0].dns_ac, Some(2));
    }

    #[test]
    fn test_dns_admission_requires_12_bytes() {
        let payload = [0u8; 11];
        let info = udp_info("10.0.0.1", 5353, "10.0.0.2", 53, &payload);
        assert!(!DnsParser.is_protocol(&info));
    }
}
