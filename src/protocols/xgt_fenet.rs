//! LSIS XGT FEnet dissector
//!
//! Frames carry a 20-byte little-endian header ("LSIS-XGT" magic) followed by
//! a read/write instruction. Header-level framing problems are warnings, not
//! hard failures: the header fields are still worth a record even when the
//! instruction walk cannot complete.

use std::fmt::Write as _;

use tracing::warn;

use crate::assets::AssetCatalog;
use crate::core::{PacketInfo, UnifiedRecord};

use super::base_record;

const XGT_PORT: u16 = 2004;
const XGT_MAGIC: &[u8; 8] = b"LSIS-XGT";
const HEADER_LEN: usize = 20;

const DTYPE_CONTINUOUS: u16 = 0x0014;
const CMD_READ_REQ: u16 = 0x0054;
const CMD_READ_RESP: u16 = 0x0055;
const CMD_WRITE_REQ: u16 = 0x0058;
const CMD_WRITE_RESP: u16 = 0x0059;
const ERROR_STATUS_OK: u16 = 0x0000;

const SOURCE_REQUEST: u8 = 0x33;
const SOURCE_RESPONSE: u8 = 0x11;

struct Header {
    company_id: String,
    plc_info: u16,
    cpu_info: u8,
    source_of_frame: u8,
    invoke_id: u16,
    length: u16,
    fenet_position: u8,
}

#[derive(Default)]
struct Instruction {
    command: u16,
    data_type: u16,
    is_continuous: bool,
    block_count: u16,
    error_status: u16,
    error_info_or_block_count: u16,
    data_size: u16,
    variable_name: String,
    variables: Vec<String>,
    continuous_data: Vec<u8>,
    read_data: Vec<Vec<u8>>,
    write_data: Vec<Vec<u8>>,
}

fn le16(p: &[u8]) -> u16 {
    u16::from_le_bytes([p[0], p[1]])
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

pub struct XgtFenetParser;

impl XgtFenetParser {
    pub fn is_protocol(&self, info: &PacketInfo<'_>) -> bool {
        (info.is_tcp() || info.is_udp())
            && (info.dst_port == XGT_PORT || info.src_port == XGT_PORT)
            && info.payload_size() >= HEADER_LEN
            && &info.payload[..8] == XGT_MAGIC
    }

    fn parse_header(payload: &[u8]) -> Option<Header> {
        if payload.len() < HEADER_LEN || &payload[..8] != XGT_MAGIC {
            return None;
        }
        Some(Header {
            company_id: String::from_utf8_lossy(&payload[..8]).into_owned(),
            plc_info: le16(&payload[10..12]),
            cpu_info: payload[12],
            source_of_frame: payload[13],
            invoke_id: le16(&payload[14..16]),
            length: le16(&payload[16..18]),
            fenet_position: payload[18],
        })
    }

    fn parse_instruction(inst: &[u8], header: &Header) -> Option<Instruction> {
        if inst.len() < 4 {
            warn!("XGT instruction too short: {} bytes", inst.len());
            return None;
        }

        let mut instruction = Instruction {
            command: le16(&inst[0..2]),
            data_type: le16(&inst[2..4]),
            ..Instruction::default()
        };
        instruction.is_continuous = instruction.data_type == DTYPE_CONTINUOUS;
        let mut offset = 4;

        let is_response = header.source_of_frame == SOURCE_RESPONSE;
        let is_request = header.source_of_frame == SOURCE_REQUEST;
        let is_read = matches!(instruction.command, CMD_READ_REQ | CMD_READ_RESP);
        let is_write = matches!(instruction.command, CMD_WRITE_REQ | CMD_WRITE_RESP);

        if !is_read && !is_write {
            warn!("XGT unknown command: 0x{:04x}", instruction.command);
            return None;
        }

        // Reserved field
        if inst.len() < offset + 2 {
            return None;
        }
        offset += 2;

        if is_response {
            if inst.len() < offset + 2 {
                return None;
            }
            instruction.error_status = le16(&inst[offset..]);
            offset += 2;

            if inst.len() < offset + 2 {
                return None;
            }
            instruction.error_info_or_block_count = le16(&inst[offset..]);
            offset += 2;

            // An error status is still a valid response; parsing stops here
            if instruction.error_status != ERROR_STATUS_OK {
                warn!(
                    "XGT error status 0x{:04x}, info 0x{:04x}",
                    instruction.error_status, instruction.error_info_or_block_count
                );
                return Some(instruction);
            }

            instruction.block_count = instruction.error_info_or_block_count;

            if is_read {
                if instruction.is_continuous {
                    if inst.len() < offset + 2 {
                        warn!("XGT missing data size in continuous read response");
                        return None;
                    }
                    instruction.data_size = le16(&inst[offset..]);
                    offset += 2;

                    let size = instruction.data_size as usize;
                    if inst.len() < offset + size {
                        warn!(
                            "XGT insufficient data: expected {}, available {}",
                            size,
                            inst.len() - offset
                        );
                        return None;
                    }
                    instruction.continuous_data = inst[offset..offset + size].to_vec();
                    offset += size;
                } else {
                    for i in 0..instruction.block_count {
                        if inst.len() < offset + 2 {
                            warn!("XGT missing data length for block {i}");
                            return None;
                        }
                        let data_len = le16(&inst[offset..]) as usize;
                        offset += 2;

                        if inst.len() < offset + data_len {
                            warn!("XGT insufficient data for block {i}");
                            return None;
                        }
                        instruction.read_data.push(inst[offset..offset + data_len].to_vec());
                        offset += data_len;
                    }
                }
            }
            // Write responses carry no data beyond the block count
        } else if is_request {
            if inst.len() < offset + 2 {
                return None;
            }
            instruction.block_count = le16(&inst[offset..]);
            offset += 2;

            if instruction.is_continuous {
                if instruction.block_count != 1 {
                    warn!(
                        "XGT continuous request must have block count 1, got {}",
                        instruction.block_count
                    );
                    return None;
                }

                if inst.len() < offset + 2 {
                    return None;
                }
                let var_len = le16(&inst[offset..]) as usize;
                offset += 2;

                if inst.len() < offset + var_len {
                    warn!("XGT insufficient space for variable name");
                    return None;
                }
                instruction.variable_name =
                    String::from_utf8_lossy(&inst[offset..offset + var_len]).into_owned();
                offset += var_len;

                if inst.len() < offset + 2 {
                    return None;
                }
                instruction.data_size = le16(&inst[offset..]);
                offset += 2;

                if is_write {
                    let size = instruction.data_size as usize;
                    if inst.len() < offset + size {
                        warn!("XGT insufficient write data");
                        return None;
                    }
                    instruction.continuous_data = inst[offset..offset + size].to_vec();
                    offset += size;
                }
                // A continuous read request carries no data
            } else {
                for i in 0..instruction.block_count {
                    if inst.len() < offset + 2 {
                        warn!("XGT missing variable length for block {i}");
                        return None;
                    }
                    let var_len = le16(&inst[offset..]) as usize;
                    offset += 2;

                    if inst.len() < offset + var_len {
                        warn!("XGT insufficient space for variable {i}");
                        return None;
                    }
                    instruction
                        .variables
                        .push(String::from_utf8_lossy(&inst[offset..offset + var_len]).into_owned());
                    offset += var_len;
                }

                if is_write {
                    for i in 0..instruction.block_count {
                        if inst.len() < offset + 2 {
                            warn!("XGT missing data length for block {i}");
                            return None;
                        }
                        let data_len = le16(&inst[offset..]) as usize;
                        offset += 2;

                        if inst.len() < offset + data_len {
                            warn!("XGT insufficient write data for block {i}");
                            return None;
                        }
                        instruction.write_data.push(inst[offset..offset + data_len].to_vec());
                        offset += data_len;
                    }
                }
                // An individual read request carries no data
            }
        } else {
            warn!("XGT invalid source of frame: 0x{:02x}", header.source_of_frame);
            return None;
        }

        if offset != inst.len() {
            warn!("XGT parsing mismatch: consumed {} of {} bytes", offset, inst.len());
            return None;
        }

        Some(instruction)
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        let Some(header) = Self::parse_header(info.payload) else {
            return Vec::new();
        };

        if HEADER_LEN + header.length as usize != info.payload_size() {
            warn!(
                "XGT size mismatch: header declares {}, actual instruction {} ({})",
                header.length,
                info.payload_size().saturating_sub(HEADER_LEN),
                info.timestamp
            );
        }

        let available = info.payload_size() - HEADER_LEN;
        let inst_size = (header.length as usize).min(available);
        let instruction =
            Self::parse_instruction(&info.payload[HEADER_LEN..HEADER_LEN + inst_size], &header);

        let direction = match header.source_of_frame {
            SOURCE_REQUEST => "request",
            SOURCE_RESPONSE => "response",
            _ => "unknown",
        };

        let mut record = base_record(info, "xgt_fen", direction, assets);
        // len reports the header-declared instruction length
        record.len = Some(header.length as u32);
        record.xgt_prid = Some(header.invoke_id);
        record.xgt_company_id = Some(header.company_id.clone());
        record.xgt_plcinfo = Some(header.plc_info);
        record.xgt_cpuinfo = Some(header.cpu_info);
        record.xgt_source = Some(header.source_of_frame);
        record.xgt_len = Some(header.length);
        record.xgt_fenetpos = Some(header.fenet_position);

        if let Some(inst) = instruction {
            record.xgt_cmd = Some(inst.command);
            record.xgt_dtype = Some(inst.data_type);
            record.xgt_blkcnt = Some(inst.block_count);
            record.xgt_errstat = Some(inst.error_status);
            record.xgt_errinfo = Some(inst.error_info_or_block_count);
            if inst.data_size > 0 {
                record.xgt_datasize = Some(inst.data_size);
            }

            let vars = if !inst.variable_name.is_empty() {
                inst.variable_name.clone()
            } else {
                inst.variables.join(";")
            };
            if !vars.is_empty() {
                record.xgt_vars = Some(vars);
            }

            let data = if !inst.continuous_data.is_empty() {
                hex_string(&inst.continuous_data)
            } else if !inst.read_data.is_empty() {
                let mut s = hex_string(&inst.read_data[0]);
                if inst.read_data.len() > 1 {
                    let _ = write!(s, "...({} items)", inst.read_data.len());
                }
                s
            } else if !inst.write_data.is_empty() {
                let mut s = hex_string(&inst.write_data[0]);
                if inst.write_data.len() > 1 {
                    let _ = write!(s, "...({} items)", inst.write_data.len());
                }
                s
            } else {
                String::new()
            };
            if !data.is_empty() {
                record.xgt_data = Some(data);
            }

            let primary_var = if !inst.variable_name.is_empty() {
                Some(inst.variable_name.as_str())
            } else {
                inst.variables.first().map(|s| s.as_str())
            };
            if let Some(var) = primary_var {
                let translated = assets.translate_xgt_address(var);
                let description = assets.description(&translated);
                if !translated.is_empty() {
                    record.xgt_translated_addr = Some(translated);
                }
                if !description.is_empty() {
                    record.xgt_description = Some(description);
                }
            }
        }

        vec![record]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testutil::tcp_info;

    fn xgt_frame(source: u8, invoke_id: u16, instruction: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(XGT_MAGIC);
        frame.extend_from_slice(&[0, 0]); // reserved1
        frame.extend_from_slice(&0u16.to_le_bytes()); // plc info
        frame.push(0); // cpu info
        frame.push(source);
        frame.extend_from_slice(&invoke_id.to_le_bytes());
        frame.extend_from_slice(&(instruction.len() as u16).to_le_bytes());
        frame.push(0); // fenet position
        frame.push(0); // reserved2
        frame.extend_from_slice(instruction);
        frame
    }

    #[test]
    fn test_admission_needs_magic() {
        let frame = xgt_frame(SOURCE_REQUEST, 1, &[]);
        let info = tcp_info("10.0.0.1", 49152, "10.0.0.2", 2004, &frame);
        assert!(XgtFenetParser.is_protocol(&info));

        let mut bad = frame.clone();
        bad[0] = b'X';
        let info = tcp_info("10.0.0.1", 49152, "10.0.0.2", 2004, &bad);
        assert!(!XgtFenetParser.is_protocol(&info));
    }

    #[test]
    fn test_continuous_read_response() {
        let mut inst = Vec::new();
        inst.extend_from_slice(&CMD_READ_RESP.to_le_bytes());
        inst.extend_from_slice(&DTYPE_CONTINUOUS.to_le_bytes());
        inst.extend_from_slice(&[0, 0]); // reserved
        inst.extend_from_slice(&0u16.to_le_bytes()); // error status
        inst.extend_from_slice(&1u16.to_le_bytes()); // block count
        inst.extend_from_slice(&16u16.to_le_bytes()); // data size
        inst.extend_from_slice(&[0xab; 16]);

        let frame = xgt_frame(SOURCE_RESPONSE, 1, &inst);
        let info = tcp_info("10.0.0.2", 2004, "10.0.0.1", 49152, &frame);
        let records = XgtFenetParser.parse(&info, &AssetCatalog::default());

        let r = &records[0];
        assert_eq!(r.protocol, "xgt_fen");
        assert_eq!(r.dir, "response");
        assert_eq!(r.xgt_cmd, Some(85));
        assert_eq!(r.xgt_dtype, Some(20));
        assert_eq!(r.xgt_errstat, Some(0));
        assert_eq!(r.xgt_blkcnt, Some(1));
        assert_eq!(r.xgt_datasize, Some(16));
        assert_eq!(r.xgt_data.as_deref(), Some("ab".repeat(16).as_str()));
        assert_eq!(r.len, Some(inst.len() as u32));
    }

    #[test]
    fn test_individual_write_request_with_translation() {
        let mut inst = Vec::new();
        inst.extend_from_slice(&CMD_WRITE_REQ.to_le_bytes());
        inst.extend_from_slice(&0x0002u16.to_le_bytes()); // word type
        inst.extend_from_slice(&[0, 0]); // reserved
        inst.extend_from_slice(&1u16.to_le_bytes()); // block count
        let var = b"%DB40";
        inst.extend_from_slice(&(var.len() as u16).to_le_bytes());
        inst.extend_from_slice(var);
        inst.extend_from_slice(&2u16.to_le_bytes()); // data length
        inst.extend_from_slice(&[0x12, 0x34]);

        let frame = xgt_frame(SOURCE_REQUEST, 9, &inst);
        let info = tcp_info("10.0.0.1", 49152, "10.0.0.2", 2004, &frame);
        let records = XgtFenetParser.parse(&info, &AssetCatalog::default());

        let r = &records[0];
        assert_eq!(r.dir, "request");
        assert_eq!(r.xgt_cmd, Some(0x58));
        assert_eq!(r.xgt_vars.as_deref(), Some("%DB40"));
        assert_eq!(r.xgt_data.as_deref(), Some("1234"));
        assert_eq!(r.xgt_translated_addr.as_deref(), Some("D20"));
    }

    #[test]
    fn test_error_response_still_emitted() {
        let mut inst = Vec::new();
        inst.extend_from_slice(&CMD_READ_RESP.to_le_bytes());
        inst.extend_from_slice(&DTYPE_CONTINUOUS.to_le_bytes());
        inst.extend_from_slice(&[0, 0]); // reserved
        inst.extend_from_slice(&0xffffu16.to_le_bytes()); // error status
        inst.extend_from_slice(&0x0021u16.to_le_bytes()); // error info

        let frame = xgt_frame(SOURCE_RESPONSE, 2, &inst);
        let info = tcp_info("10.0.0.2", 2004, "10.0.0.1", 49152, &frame);
        let records = XgtFenetParser.parse(&info, &AssetCatalog::default());

        let r = &records[0];
        assert_eq!(r.xgt_errstat, Some(0xffff));
        assert_eq!(r.xgt_errinfo, Some(0x21));
        assert_eq!(r.xgt_data, None);
    }

    #[test]
    fn test_truncated_instruction_keeps_header_fields() {
        // Header declares a longer instruction than the payload carries
        let mut inst = Vec::new();
        inst.extend_from_slice(&CMD_READ_REQ.to_le_bytes());
        let mut frame = xgt_frame(SOURCE_REQUEST, 3, &inst);
        // Declare 40 bytes of instruction
        frame[16..18].copy_from_slice(&40u16.to_le_bytes());

        let info = tcp_info("10.0.0.1", 49152, "10.0.0.2", 2004, &frame);
        let records = XgtFenetParser.parse(&info, &AssetCatalog::default());

        let r = &records[0];
        assert_eq!(r.xgt_prid, Some(3));
        assert_eq!(r.len, Some(40));
        // The instruction walk failed, so no command fields
        assert_eq!(r.xgt_cmd, None);
    }
}
