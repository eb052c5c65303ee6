//! Protocol parsers and the per-worker dispatch registry
//!
//! Each worker owns one `ParserSet` holding one instance of every parser, so
//! the stateful dissectors (Modbus, S7Comm) keep their pending-request tables
//! without any cross-worker locking. The trade-off: when both directions of a
//! flow land on different workers, request/response correlation misses and
//! the response record simply lacks its base-address annotation.

pub mod arp;
pub mod dnp3;
pub mod dns;
pub mod generic;
pub mod modbus;
pub mod s7comm;
pub mod tcp_session;
pub mod unknown;
pub mod xgt_fenet;

use std::sync::Arc;

use crate::assets::AssetCatalog;
use crate::core::{PacketInfo, UnifiedRecord};

pub use arp::ArpParser;
pub use dnp3::Dnp3Parser;
pub use dns::DnsParser;
pub use generic::GenericParser;
pub use modbus::ModbusParser;
pub use s7comm::S7CommParser;
pub use tcp_session::TcpSessionParser;
pub use unknown::UnknownParser;
pub use xgt_fenet::XgtFenetParser;

/// Closed set of protocol parsers
///
/// The dispatch loop only needs `name()`, `is_protocol()` and `parse()`; a
/// variant per parser keeps the set closed and monomorphic.
pub enum Parser {
    Arp(ArpParser),
    TcpSession(TcpSessionParser),
    Modbus(ModbusParser),
    S7Comm(S7CommParser),
    XgtFenet(XgtFenetParser),
    Dnp3(Dnp3Parser),
    Generic(GenericParser),
    Dns(DnsParser),
    Unknown(UnknownParser),
}

impl Parser {
    pub fn name(&self) -> &'static str {
        match self {
            Parser::Arp(_) => "arp",
            Parser::TcpSession(_) => "tcp_session",
            Parser::Modbus(_) => "modbus",
            Parser::S7Comm(_) => "s7comm",
            Parser::XgtFenet(_) => "xgt_fen",
            Parser::Dnp3(_) => "dnp3",
            Parser::Generic(p) => p.name(),
            Parser::Dns(_) => "dns",
            Parser::Unknown(_) => "unknown",
        }
    }

    pub fn is_protocol(&self, info: &PacketInfo<'_>) -> bool {
        match self {
            Parser::Arp(p) => p.is_protocol(info),
            Parser::TcpSession(p) => p.is_protocol(info),
            Parser::Modbus(p) => p.is_protocol(info),
            Parser::S7Comm(p) => p.is_protocol(info),
            Parser::XgtFenet(p) => p.is_protocol(info),
            Parser::Dnp3(p) => p.is_protocol(info),
            Parser::Generic(p) => p.is_protocol(info),
            Parser::Dns(p) => p.is_protocol(info),
            Parser::Unknown(p) => p.is_protocol(info),
        }
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        match self {
            Parser::Arp(p) => p.parse(info, assets),
            Parser::TcpSession(p) => p.parse(info, assets),
            Parser::Modbus(p) => p.parse(info, assets),
            Parser::S7Comm(p) => p.parse(info, assets),
            Parser::XgtFenet(p) => p.parse(info, assets),
            Parser::Dnp3(p) => p.parse(info, assets),
            Parser::Generic(p) => p.parse(info, assets),
            Parser::Dns(p) => p.parse(info, assets),
            Parser::Unknown(p) => p.parse(info, assets),
        }
    }
}

/// Build the unified record skeleton every parser starts from: common fields
/// plus the asset-name lookups for both endpoints.
pub fn base_record(
    info: &PacketInfo<'_>,
    name: &'static str,
    direction: &str,
    assets: &AssetCatalog,
) -> UnifiedRecord {
    let mut record = UnifiedRecord {
        timestamp: info.timestamp.clone(),
        protocol: name.to_string(),
        smac: info.src_mac.clone(),
        dmac: info.dst_mac.clone(),
        sip: info.src_ip.clone(),
        dip: info.dst_ip.clone(),
        dir: direction.to_string(),
        ..UnifiedRecord::default()
    };

    // Port/sequence fields only exist for IP records
    if info.protocol != 0 {
        record.sp = Some(info.src_port);
        record.dp = Some(info.dst_port);
        record.sq = Some(info.tcp_seq);
        record.ak = Some(info.tcp_ack);
        record.fl = Some(info.tcp_flags);
    }

    let src_device = assets.device_name(&info.src_ip);
    if !src_device.is_empty() {
        record.src_asset_name = Some(src_device);
    }
    let dst_device = assets.device_name(&info.dst_ip);
    if !dst_device.is_empty() {
        record.dst_asset_name = Some(dst_device);
    }

    record
}

/// Per-worker parser registry with the fixed registration order
pub struct ParserSet {
    parsers: Vec<Parser>,
    assets: Arc<AssetCatalog>,
}

impl ParserSet {
    pub fn new(assets: Arc<AssetCatalog>) -> Self {
        let parsers = vec![
            Parser::Arp(ArpParser),
            Parser::TcpSession(TcpSessionParser),
            Parser::Modbus(ModbusParser::new()),
            Parser::S7Comm(S7CommParser::new()),
            Parser::XgtFenet(XgtFenetParser),
            Parser::Dnp3(Dnp3Parser),
            Parser::Generic(GenericParser::new("dhcp")),
            Parser::Dns(DnsParser),
            Parser::Generic(GenericParser::new("ethernet_ip")),
            Parser::Generic(GenericParser::new("iec104")),
            Parser::Generic(GenericParser::new("mms")),
            Parser::Generic(GenericParser::new("opc_ua")),
            Parser::Generic(GenericParser::new("bacnet")),
            Parser::Unknown(UnknownParser),
        ];
        Self { parsers, assets }
    }

    /// Two-phase dispatch: ARP short-circuit, then the first application
    /// parser whose admission check passes, then the TCP/UDP fallback.
    pub fn dispatch(&mut self, info: &PacketInfo<'_>) -> Vec<UnifiedRecord> {
        let assets = Arc::clone(&self.assets);

        if info.eth_type == 0x0806 {
            return self.parse_by_name("arp", info, &assets);
        }

        let mut matched = None;
        for (idx, parser) in self.parsers.iter().enumerate() {
            match parser.name() {
                "tcp_session" | "unknown" | "arp" => continue,
                _ => {}
            }
            if parser.is_protocol(info) {
                matched = Some(idx);
                break;
            }
        }

        if let Some(idx) = matched {
            return self.parsers[idx].parse(info, &assets);
        }

        if info.is_tcp() {
            self.parse_by_name("tcp_session", info, &assets)
        } else if info.is_udp() {
            self.parse_by_name("unknown", info, &assets)
        } else {
            Vec::new()
        }
    }

    fn parse_by_name(
        &mut self,
        name: &str,
        info: &PacketInfo<'_>,
        assets: &AssetCatalog,
    ) -> Vec<UnifiedRecord> {
        for parser in &mut self.parsers {
            if parser.name() == name {
                return parser.parse(info, assets);
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::core::PacketInfo;

    /// TCP packet skeleton for parser tests
    pub fn tcp_info<'a>(
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        payload: &'a [u8],
    ) -> PacketInfo<'a> {
        PacketInfo {
            timestamp: "2023-05-10T02:24:15.000001Z".to_string(),
            flow_id: crate::core::canonical_flow_id(src_ip, src_port, dst_ip, dst_port),
            src_mac: "aa:bb:cc:dd:ee:01".to_string(),
            dst_mac: "aa:bb:cc:dd:ee:02".to_string(),
            eth_type: 0x0800,
            src_ip: src_ip.to_string(),
            dst_ip: dst_ip.to_string(),
            src_port,
            dst_port,
            protocol: 6,
            tcp_seq: 1000,
            tcp_ack: 2000,
            tcp_flags: 0x18,
            payload,
        }
    }

    pub fn udp_info<'a>(
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        payload: &'a [u8],
    ) -> PacketInfo<'a> {
        let mut info = tcp_info(src_ip, src_port, dst_ip, dst_port, payload);
        info.protocol = 17;
        info.tcp_seq = 0;
        info.tcp_ack = 0;
        info.tcp_flags = 0;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{tcp_info, udp_info};
    use super::*;

    fn parser_set() -> ParserSet {
        ParserSet::new(Arc::new(AssetCatalog::default()))
    }

    #[test]
    fn test_dispatch_modbus_by_admission() {
        let mut set = parser_set();
        // Valid read-holding-registers request: MBAP len 6 == payload 12 - 6
        let payload = [0, 1, 0, 0, 0, 6, 1, 3, 0, 12, 0, 3];
        let info = tcp_info("192.168.1.10", 49152, "192.168.1.2", 502, &payload);
        let records = set.dispatch(&info);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].protocol, "modbus");
    }

    #[test]
    fn test_dispatch_falls_back_to_tcp_session() {
        let mut set = parser_set();
        // Port 502 but MBAP length mismatch: rejected by Modbus, lands in the
        // TCP session fallback
        let payload = [0, 0, 0, 0, 0, 7, 0, 4, 4, 0];
        let info = tcp_info("192.168.1.10", 49152, "192.168.1.2", 502, &payload);
        let records = set.dispatch(&info);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].protocol, "tcp_session");
    }

    #[test]
    fn test_dispatch_udp_fallback_is_unknown() {
        let mut set = parser_set();
        let payload = [1, 2, 3, 4];
        let info = udp_info("10.0.0.1", 40000, "10.0.0.2", 9999, &payload);
        let records = set.dispatch(&info);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].protocol, "unknown");
        assert_eq!(records[0].len, Some(4));
    }

    #[test]
    fn test_dispatch_generic_by_port() {
        let mut set = parser_set();
        let payload = [0u8; 16];
        let info = tcp_info("10.0.0.1", 40000, "10.0.0.2", 44818, &payload);
        let records = set.dispatch(&info);
        assert_eq!(records[0].protocol, "ethernet_ip");

        let info = udp_info("10.0.0.1", 68, "10.0.0.2", 67, &payload);
        let records = set.dispatch(&info);
        assert_eq!(records[0].protocol, "dhcp");
    }

    #[test]
    fn test_registration_order_prefers_s7_over_mms() {
        let set = parser_set();
        let names: Vec<_> = set.parsers.iter().map(|p| p.name()).collect();
        let s7_pos = names.iter().position(|n| *n == "s7comm").unwrap();
        let mms_pos = names.iter().position(|n| *n == "mms").unwrap();
        assert!(s7_pos < mms_pos);
    }
}
