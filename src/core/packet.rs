//! Per-packet metadata handed from the demultiplexer to the protocol parsers
//!
//! A `PacketInfo` lives for a single `parse` call; the payload slice borrows
//! from the worker-owned frame buffer.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

/// IP protocol numbers the dissector cares about
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// TCP flag bits
pub const TH_FIN: u8 = 0x01;
pub const TH_SYN: u8 = 0x02;
pub const TH_RST: u8 = 0x04;
pub const TH_ACK: u8 = 0x10;

/// Decoded packet handed to the parser registry
#[derive(Debug)]
pub struct PacketInfo<'a> {
    /// ISO-8601 capture timestamp with microsecond precision
    pub timestamp: String,
    /// Canonical, direction-independent flow identifier (empty for ARP)
    pub flow_id: String,
    pub src_mac: String,
    pub dst_mac: String,
    pub eth_type: u16,
    /// Dotted-quad source IP (empty for ARP)
    pub src_ip: String,
    /// Dotted-quad destination IP (empty for ARP)
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    /// L4 protocol number (6 TCP, 17 UDP, 0 for ARP)
    pub protocol: u8,
    pub tcp_seq: u32,
    pub tcp_ack: u32,
    pub tcp_flags: u8,
    /// Application payload, sized by the declared header lengths
    pub payload: &'a [u8],
}

impl<'a> PacketInfo<'a> {
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == IPPROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == IPPROTO_UDP
    }
}

/// Format a MAC address as lowercase colon-separated hex, octets in wire order
pub fn format_mac(mac: &[u8]) -> String {
    let mut out = String::with_capacity(17);
    for (i, b) in mac.iter().take(6).enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Format a capture timestamp as `2023-05-10T02:24:15.123456Z`
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Canonical flow identifier shared by both directions of a flow
///
/// Endpoints are ordered lexicographically by `(ip, port)` so a request and
/// its response map to the same key.
pub fn canonical_flow_id(ip1: &str, port1: u16, ip2: &str, port2: u16) -> String {
    if ip1 > ip2 || (ip1 == ip2 && port1 > port2) {
        format!("{}:{}-{}:{}", ip2, port2, ip1, port1)
    } else {
        format!("{}:{}-{}:{}", ip1, port1, ip2, port2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            "aa:bb:cc:dd:ee:ff"
        );
        assert_eq!(format_mac(&[0, 0, 0, 0, 0, 0]), "00:00:00:00:00:00");
    }

    #[test]
    fn test_format_timestamp_micros() {
        let ts = Utc.with_ymd_and_hms(2023, 5, 10, 2, 24, 15).unwrap()
            + chrono::Duration::microseconds(123456);
        assert_eq!(format_timestamp(ts), "2023-05-10T02:24:15.123456Z");
    }

    #[test]
    fn test_canonical_flow_id_direction_independent() {
        let a = canonical_flow_id("192.168.1.10", 49152, "192.168.1.2", 502);
        let b = canonical_flow_id("192.168.1.2", 502, "192.168.1.10", 49152);
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_flow_id_same_ip_orders_ports() {
        let id = canonical_flow_id("10.0.0.1", 5000, "10.0.0.1", 102);
        assert_eq!(id, "10.0.0.1:102-10.0.0.1:5000");
    }
}
