//! Frame demultiplexer
//!
//! Strips Ethernet/IP/TCP-UDP headers and hands the application payload to
//! the parser registry. Payload length is derived from the IP Total Length
//! field, never from the captured buffer: short-frame padding and residual
//! bytes in zero-payload ACK segments must not be misread as payload. Slices
//! are still bounded by the captured buffer so truncated captures stay safe.

use crate::core::packet::{canonical_flow_id, format_mac, PacketInfo, IPPROTO_TCP, IPPROTO_UDP};
use crate::core::UnifiedRecord;
use crate::protocols::ParserSet;

const ETH_HEADER_LEN: usize = 14;
const MIN_IP_HEADER_LEN: usize = 20;
const MIN_TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;

/// Decode one captured frame and dispatch it through the registry
pub fn handle_frame(data: &[u8], timestamp: &str, parsers: &mut ParserSet) -> Vec<UnifiedRecord> {
    if data.len() < ETH_HEADER_LEN {
        return Vec::new();
    }

    let dst_mac = format_mac(&data[0..6]);
    let src_mac = format_mac(&data[6..12]);
    let eth_type = u16::from_be_bytes([data[12], data[13]]);
    let l3 = &data[ETH_HEADER_LEN..];

    if eth_type == ETHERTYPE_ARP {
        let info = PacketInfo {
            timestamp: timestamp.to_string(),
            flow_id: String::new(),
            src_mac,
            dst_mac,
            eth_type,
            src_ip: String::new(),
            dst_ip: String::new(),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            tcp_seq: 0,
            tcp_ack: 0,
            tcp_flags: 0,
            payload: l3,
        };
        return parsers.dispatch(&info);
    }

    if eth_type != ETHERTYPE_IPV4 || l3.len() < MIN_IP_HEADER_LEN {
        return Vec::new();
    }

    let ip_header_len = ((l3[0] & 0x0f) as usize) * 4;
    let ip_total_len = u16::from_be_bytes([l3[2], l3[3]]) as usize;
    let protocol = l3[9];
    let src_ip = format!("{}.{}.{}.{}", l3[12], l3[13], l3[14], l3[15]);
    let dst_ip = format!("{}.{}.{}.{}", l3[16], l3[17], l3[18], l3[19]);

    if ip_header_len < MIN_IP_HEADER_LEN
        || ip_total_len < ip_header_len
        || l3.len() < ip_header_len
    {
        return Vec::new();
    }

    // L4 length comes from the IP header, bounded by what was captured
    let l4_declared = ip_total_len - ip_header_len;
    let l4 = &l3[ip_header_len..];

    match protocol {
        IPPROTO_TCP => {
            if l4_declared < MIN_TCP_HEADER_LEN || l4.len() < MIN_TCP_HEADER_LEN {
                return Vec::new();
            }

            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            let tcp_seq = u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]);
            let tcp_ack = u32::from_be_bytes([l4[8], l4[9], l4[10], l4[11]]);
            let tcp_header_len = ((l4[12] >> 4) as usize) * 4;
            let tcp_flags = l4[13];

            if tcp_header_len < MIN_TCP_HEADER_LEN
                || l4_declared < tcp_header_len
                || l4.len() < tcp_header_len
            {
                return Vec::new();
            }

            let declared_payload = l4_declared - tcp_header_len;
            let available = l4.len() - tcp_header_len;
            let payload = &l4[tcp_header_len..tcp_header_len + declared_payload.min(available)];

            let info = PacketInfo {
                timestamp: timestamp.to_string(),
                flow_id: canonical_flow_id(&src_ip, src_port, &dst_ip, dst_port),
                src_mac,
                dst_mac,
                eth_type,
                src_ip,
                dst_ip,
                src_port,
                dst_port,
                protocol: IPPROTO_TCP,
                tcp_seq,
                tcp_ack,
                tcp_flags,
                payload,
            };
            parsers.dispatch(&info)
        }
        IPPROTO_UDP => {
            if l4_declared < UDP_HEADER_LEN || l4.len() < UDP_HEADER_LEN {
                return Vec::new();
            }

            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);

            let declared_payload = l4_declared - UDP_HEADER_LEN;
            let available = l4.len() - UDP_HEADER_LEN;
            let payload = &l4[UDP_HEADER_LEN..UDP_HEADER_LEN + declared_payload.min(available)];

            let info = PacketInfo {
                timestamp: timestamp.to_string(),
                flow_id: canonical_flow_id(&src_ip, src_port, &dst_ip, dst_port),
                src_mac,
                dst_mac,
                eth_type,
                src_ip,
                dst_ip,
                src_port,
                dst_port,
                protocol: IPPROTO_UDP,
                tcp_seq: 0,
                tcp_ack: 0,
                tcp_flags: 0,
                payload,
            };
            parsers.dispatch(&info)
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod frames {
    //! Synthetic frame builders for tests

    pub fn ethernet(eth_type: u16, l3: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]); // dst
        frame.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]); // src
        frame.extend_from_slice(&eth_type.to_be_bytes());
        frame.extend_from_slice(l3);
        frame
    }

    pub fn ipv4(protocol: u8, src: [u8; 4], dst: [u8; 4], l4: &[u8]) -> Vec<u8> {
        let total_len = (20 + l4.len()) as u16;
        let mut p = vec![0x45, 0x00];
        p.extend_from_slice(&total_len.to_be_bytes());
        p.extend_from_slice(&[0, 0, 0, 0]); // id, frag
        p.push(64); // ttl
        p.push(protocol);
        p.extend_from_slice(&[0, 0]); // checksum
        p.extend_from_slice(&src);
        p.extend_from_slice(&dst);
        p.extend_from_slice(l4);
        p
    }

    pub fn tcp(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&src_port.to_be_bytes());
        p.extend_from_slice(&dst_port.to_be_bytes());
        p.extend_from_slice(&1000u32.to_be_bytes()); // seq
        p.extend_from_slice(&2000u32.to_be_bytes()); // ack
        p.push(0x50); // data offset 5 words
        p.push(flags);
        p.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]); // window, checksum, urg
        p.extend_from_slice(payload);
        p
    }

    pub fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&src_port.to_be_bytes());
        p.extend_from_slice(&dst_port.to_be_bytes());
        p.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(payload);
        p
    }

    /// Full TCP frame with the IP Total Length set from the payload
    pub fn tcp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
        ethernet(0x0800, &ipv4(6, src, dst, &tcp(sport, dport, 0x18, payload)))
    }

    pub fn udp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
        ethernet(0x0800, &ipv4(17, src, dst, &udp(sport, dport, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::frames::*;
    use super::*;
    use crate::assets::AssetCatalog;
    use std::sync::Arc;

    fn parsers() -> ParserSet {
        ParserSet::new(Arc::new(AssetCatalog::default()))
    }

    const TS: &str = "2023-05-10T02:24:15.000001Z";

    #[test]
    fn test_payload_length_from_ip_total_length() {
        // A zero-payload ACK whose capture carries 6 residual padding bytes:
        // the declared total length wins and the payload is empty
        let mut frame = tcp_frame([10, 0, 0, 1], 49152, [10, 0, 0, 2], 8080, &[]);
        frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x00]);

        let mut set = parsers();
        let records = handle_frame(&frame, TS, &mut set);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].protocol, "tcp_session");
        assert_eq!(records[0].len, Some(0));
    }

    #[test]
    fn test_truncated_capture_is_bounded() {
        // Declared 64-byte payload but only 4 captured bytes survive
        let payload = [0u8; 64];
        let mut frame = tcp_frame([10, 0, 0, 1], 49152, [10, 0, 0, 2], 8080, &payload);
        frame.truncate(frame.len() - 60);

        let mut set = parsers();
        let records = handle_frame(&frame, TS, &mut set);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].len, Some(4));
    }

    #[test]
    fn test_modbus_end_to_end() {
        let mbap = [0, 1, 0, 0, 0, 6, 1, 3, 0, 12, 0, 3];
        let frame = tcp_frame([192, 168, 1, 10], 49152, [192, 168, 1, 2], 502, &mbap);

        let mut set = parsers();
        let records = handle_frame(&frame, TS, &mut set);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.protocol, "modbus");
        assert_eq!(r.sip, "192.168.1.10");
        assert_eq!(r.dip, "192.168.1.2");
        assert_eq!(r.sp, Some(49152));
        assert_eq!(r.dp, Some(502));
    }

    #[test]
    fn test_arp_dispatch() {
        let mut arp = vec![0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01];
        arp.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        arp.extend_from_slice(&[10, 0, 0, 1]);
        arp.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        arp.extend_from_slice(&[10, 0, 0, 2]);
        let frame = ethernet(0x0806, &arp);

        let mut set = parsers();
        let records = handle_frame(&frame, TS, &mut set);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].protocol, "arp");
        assert_eq!(records[0].dir, "request");
    }

    #[test]
    fn test_dns_over_udp() {
        let mut dns = Vec::new();
        dns.extend_from_slice(&0x1234u16.to_be_bytes());
        dns.extend_from_slice(&0x0100u16.to_be_bytes());
        dns.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        let frame = udp_frame([10, 0, 0, 1], 5353, [8, 8, 8, 8], 53, &dns);

        let mut set = parsers();
        let records = handle_frame(&frame, TS, &mut set);
        assert_eq!(records[0].protocol, "dns");
        assert_eq!(records[0].dns_tid, Some(0x1234));
    }

    #[test]
    fn test_short_and_foreign_frames_dropped() {
        let mut set = parsers();
        assert!(handle_frame(&[0u8; 10], TS, &mut set).is_empty());
        // IPv6 ethertype
        assert!(handle_frame(&ethernet(0x86dd, &[0u8; 40]), TS, &mut set).is_empty());
        // ICMP
        let frame = ethernet(0x0800, &ipv4(1, [10, 0, 0, 1], [10, 0, 0, 2], &[0u8; 8]));
        assert!(handle_frame(&frame, TS, &mut set).is_empty());
    }
}
