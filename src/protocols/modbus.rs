//! Modbus/TCP dissector with request/response correlation
//!
//! Admission is strict on purpose: the payload must match the MBAP-declared
//! frame size exactly, which rejects pure ACK segments carrying residual bytes
//! from earlier transmissions. Those packets fall through to the TCP session
//! fallback instead of producing phantom Modbus records.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::assets::AssetCatalog;
use crate::core::{PacketInfo, UnifiedRecord};

use super::base_record;

const MODBUS_PORT: u16 = 502;
/// Sweep cadence for the pending-request table
const CLEANUP_PERIOD: Duration = Duration::from_secs(60);
/// Requests older than this are considered abandoned
const REQUEST_TTL: Duration = Duration::from_secs(300);

struct PendingRequest {
    start_address: u16,
    created: Instant,
}

pub struct ModbusParser {
    /// flow key -> ((transaction id << 8) | function code) -> request info
    pending: HashMap<String, HashMap<u32, PendingRequest>>,
    last_cleanup: Instant,
}

fn be16(p: &[u8]) -> u16 {
    u16::from_be_bytes([p[0], p[1]])
}

impl ModbusParser {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            last_cleanup: Instant::now(),
        }
    }

    pub fn is_protocol(&self, info: &PacketInfo<'_>) -> bool {
        if !info.is_tcp() || (info.dst_port != MODBUS_PORT && info.src_port != MODBUS_PORT) {
            return false;
        }

        // 7-byte MBAP header plus at least one PDU byte
        let p = info.payload;
        if p.len() < 8 {
            return false;
        }

        // Protocol identifier must be zero
        if p[2] != 0x00 || p[3] != 0x00 {
            return false;
        }

        // Length counts unit id + PDU, so a valid frame declares at least 2
        let mbap_length = be16(&p[4..6]);
        if mbap_length < 2 {
            return false;
        }

        // The payload must equal the declared frame size exactly; anything
        // else is an ACK with residual data or a fragmented frame
        p.len() == 6 + mbap_length as usize
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        self.cleanup_old_requests();

        let p = info.payload;
        let trans_id = be16(&p[0..2]);
        let pdu = &p[7..];
        if pdu.is_empty() {
            return Vec::new();
        }

        let is_response = info.src_port == MODBUS_PORT;
        let direction = if info.dst_port == MODBUS_PORT { "request" } else { "response" };
        let function_code = pdu[0] & 0x7f;
        let is_exception = pdu[0] & 0x80 != 0;

        // Flow key with the client (non-502) endpoint first
        let (client_ip, client_port, server_ip, server_port) = if is_response {
            (&info.dst_ip, info.dst_port, &info.src_ip, info.src_port)
        } else {
            (&info.src_ip, info.src_port, &info.dst_ip, info.dst_port)
        };
        let flow_key = format!("{}:{}->{}:{}", client_ip, client_port, server_ip, server_port);

        let req_key = (u32::from(trans_id) << 8) | u32::from(function_code);

        let matched_start_addr = if is_response {
            self.pending
                .get(&flow_key)
                .and_then(|m| m.get(&req_key))
                .map(|r| r.start_address)
        } else {
            let start_address = if pdu.len() >= 3
                && ((1..=6).contains(&function_code) || function_code == 15 || function_code == 16)
            {
                be16(&pdu[1..3])
            } else {
                0
            };
            self.pending.entry(flow_key.clone()).or_default().insert(
                req_key,
                PendingRequest { start_address, created: Instant::now() },
            );
            None
        };

        let mut record = base_record(info, "modbus", direction, assets);
        // Datagram length at the Modbus layer is the PDU, not the TCP payload
        record.len = Some(pdu.len() as u32);
        record.modbus_tid = Some(trans_id);
        record.modbus_fc = Some(function_code);

        if is_exception {
            if pdu.len() >= 2 {
                record.modbus_err = Some(pdu[1]);
            }
        } else {
            match function_code {
                1..=4 => {
                    if is_response {
                        if pdu.len() >= 2 {
                            let byte_count = pdu[1];
                            record.modbus_bc = Some(byte_count);

                            if byte_count > 0 && pdu.len() >= 2 + byte_count as usize {
                                return self.fan_out_registers(
                                    &record,
                                    &pdu[2..2 + byte_count as usize],
                                    matched_start_addr.unwrap_or(0),
                                    function_code,
                                    assets,
                                );
                            }
                        }
                    } else if pdu.len() >= 5 {
                        record.modbus_addr = Some(be16(&pdu[1..3]));
                        record.modbus_qty = Some(be16(&pdu[3..5]));
                    }
                }
                5 | 6 => {
                    if pdu.len() >= 5 {
                        record.modbus_addr = Some(be16(&pdu[1..3]));
                        record.modbus_val = Some(be16(&pdu[3..5]));
                    }
                }
                15 | 16 => {
                    if is_response {
                        if pdu.len() >= 5 {
                            record.modbus_addr = Some(be16(&pdu[1..3]));
                            record.modbus_qty = Some(be16(&pdu[3..5]));
                        }
                    } else if pdu.len() >= 6 {
                        record.modbus_addr = Some(be16(&pdu[1..3]));
                        record.modbus_qty = Some(be16(&pdu[3..5]));
                        record.modbus_bc = Some(pdu[5]);
                    }
                }
                _ => {}
            }
        }

        if let Some(addr) = record.modbus_addr {
            let translated = assets.translate_modbus_address(function_code, addr as u32);
            let description = assets.description(&translated);
            if !translated.is_empty() {
                record.modbus_translated_addr = Some(translated);
            }
            if !description.is_empty() {
                record.modbus_description = Some(description);
            }
        }

        vec![record]
    }

    /// One record per 16-bit register in a read response, each tagged with its
    /// absolute address and translated tag. All records share the packet
    /// timestamp; the sink's stable sort keeps them in address order.
    fn fan_out_registers(
        &self,
        template: &UnifiedRecord,
        reg_data: &[u8],
        start_addr: u16,
        function_code: u8,
        assets: &AssetCatalog,
    ) -> Vec<UnifiedRecord> {
        let num_registers = reg_data.len() / 2;
        let mut records = Vec::with_capacity(num_registers);

        for i in 0..num_registers {
            let reg_addr = start_addr as u32 + i as u32;
            let reg_value = be16(&reg_data[i * 2..]);

            let mut record = template.clone();
            record.modbus_regs_addr = Some(reg_addr);
            record.modbus_regs_val = Some(reg_value);

            let translated = assets.translate_modbus_address(function_code, reg_addr);
            let description = assets.description(&translated);
            if !translated.is_empty() {
                record.modbus_translated_addr = Some(translated);
            }
            if !description.is_empty() {
                record.modbus_description = Some(description);
            }

            records.push(record);
        }

        records
    }

    fn cleanup_old_requests(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_cleanup) < CLEANUP_PERIOD {
            return;
        }

        for table in self.pending.values_mut() {
            table.retain(|_, req| now.duration_since(req.created) <= REQUEST_TTL);
        }
        self.pending.retain(|_, table| !table.is_empty());
        self.last_cleanup = now;
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.values().map(|m| m.len()).sum()
    }
}

impl Default for ModbusParser {
    fn default() -> Self {
        Self::new()
    }
}
