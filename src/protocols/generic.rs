//! Length-only decoders for protocols identified purely by port

use serde_json::json;

use crate::assets::AssetCatalog;
use crate::core::{PacketInfo, UnifiedRecord};

use super::base_record;

/// One instance per protocol name; `is_protocol` is a fixed port test with no
/// payload inspection.
pub struct GenericParser {
    name: &'static str,
}

impl GenericParser {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_protocol(&self, info: &PacketInfo<'_>) -> bool {
        let port_match = |port: u16| info.src_port == port || info.dst_port == port;

        if info.is_tcp() {
            match self.name {
                "ethernet_ip" => port_match(44818),
                "iec104" => port_match(2404),
                "mms" => port_match(102),
                "opc_ua" => port_match(4840),
                _ => false,
            }
        } else if info.is_udp() {
            match self.name {
                "dhcp" => port_match(67) || port_match(68),
                "bacnet" => port_match(47808),
                _ => false,
            }
        } else {
            false
        }
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        let mut record = base_record(info, self.name, "unknown", assets);
        record.len = Some(info.payload_size() as u32);
        record.details = Some(json!({ "len": info.payload_size() }));
        vec![record]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testutil::{tcp_info, udp_info};

    #[test]
    fn test_port_table() {
        let tcp = tcp_info("10.0.0.1", 40000, "10.0.0.2", 2404, &[]);
        assert!(GenericParser::new("iec104").is_protocol(&tcp));
        assert!(!GenericParser::new("opc_ua").is_protocol(&tcp));
        // iec104 is TCP-only
        let udp = udp_info("10.0.0.1", 40000, "10.0.0.2", 2404, &[]);
        assert!(!GenericParser::new("iec104").is_protocol(&udp));

        let bacnet = udp_info("10.0.0.1", 47808, "10.0.0.2", 47808, &[]);
        assert!(GenericParser::new("bacnet").is_protocol(&bacnet));
    }

    #[test]
    fn test_parse_is_length_only() {
        let payload = [0u8; 9];
        let info = tcp_info("10.0.0.1", 40000, "10.0.0.2", 4840, &payload);
        let records = GenericParser::new("opc_ua").parse(&info, &AssetCatalog::default());
        assert_eq!(records[0].protocol, "opc_ua");
        assert_eq!(records[0].len, Some(9));
        assert_eq!(records[0].dir, "unknown");
    }
}
