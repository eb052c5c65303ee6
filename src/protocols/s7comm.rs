//! S7Comm dissector with request/response correlation
//!
//! Frames arrive as TPKT/COTP on TCP 102 with the S7 PDU at offset 7. Job
//! frames (ROSCTR 0x01) register their PDU reference per flow; ack and
//! ack-data frames are only reported when they match a registered job, which
//! keeps unrelated chatter on port 102 out of the record stream.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::assets::AssetCatalog;
use crate::core::{PacketInfo, UnifiedRecord};

use super::base_record;

const S7_PORT: u16 = 102;
const CLEANUP_PERIOD: Duration = Duration::from_secs(60);
const REQUEST_TTL: Duration = Duration::from_secs(300);

const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK: u8 = 0x02;
const ROSCTR_ACK_DATA: u8 = 0x03;
const ROSCTR_USERDATA: u8 = 0x07;

const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;

struct PendingRequest {
    /// Item count from the read/write parameter block, zero otherwise
    items: usize,
    created: Instant,
}

pub struct S7CommParser {
    /// canonical flow id -> PDU reference -> request info
    pending: HashMap<String, HashMap<u16, PendingRequest>>,
    last_cleanup: Instant,
}

fn be16(p: &[u8]) -> u16 {
    u16::from_be_bytes([p[0], p[1]])
}

/// 24-bit big-endian bit address, divided by 8 into a byte address
fn s7_byte_address(p: &[u8]) -> u32 {
    let bits = (u32::from(p[0]) << 16) | (u32::from(p[1]) << 8) | u32::from(p[2]);
    bits >> 3
}

impl S7CommParser {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            last_cleanup: Instant::now(),
        }
    }

    pub fn is_protocol(&self, info: &PacketInfo<'_>) -> bool {
        info.is_tcp()
            && (info.dst_port == S7_PORT || info.src_port == S7_PORT)
            && info.payload_size() >= 17
            && info.payload[0] == 0x03
            && info.payload[5] == 0xf0
            && info.payload[7] == 0x32
    }

    pub fn parse(&mut self, info: &PacketInfo<'_>, assets: &AssetCatalog) -> Vec<UnifiedRecord> {
        self.cleanup_old_requests();

        let pdu = &info.payload[7..];
        if pdu.len() < 10 {
            return Vec::new();
        }

        let rosctr = pdu[1];
        let pdu_ref = be16(&pdu[4..6]);
        let param_len = be16(&pdu[6..8]) as usize;
        let data_len = be16(&pdu[8..10]) as usize;
        let header_size = if rosctr == ROSCTR_JOB || rosctr == ROSCTR_USERDATA { 10 } else { 12 };

        let (direction, request_items) = match rosctr {
            ROSCTR_ACK | ROSCTR_ACK_DATA => {
                match self.pending.get(&info.flow_id).and_then(|m| m.get(&pdu_ref)) {
                    Some(req) => ("response", req.items),
                    // Response with no registered job: ignored
                    None => return Vec::new(),
                }
            }
            ROSCTR_JOB => {
                let mut items = 0;
                if param_len > 0 && pdu.len() >= 10 + param_len {
                    let param = &pdu[10..10 + param_len];
                    if (param[0] == FN_READ_VAR || param[0] == FN_WRITE_VAR) && param_len >= 2 {
                        items = param[1] as usize;
                    }
                }
                self.pending
                    .entry(info.flow_id.clone())
                    .or_default()
                    .insert(pdu_ref, PendingRequest { items, created: Instant::now() });
                ("request", items)
            }
            _ => return Vec::new(),
        };

        let mut record = base_record(info, "s7comm", direction, assets);
        // COTP framing is 7 bytes; len reports the S7 PDU
        record.len = Some(pdu.len() as u32);
        record.s7_prid = Some(pdu_ref);
        record.s7_ros = Some(rosctr);

        if param_len > 0 && pdu.len() >= header_size + param_len {
            let param = &pdu[header_size..header_size + param_len];
            record.s7_fn = Some(param[0]);

            if (param[0] == FN_READ_VAR || param[0] == FN_WRITE_VAR) && param_len >= 2 {
                let item_count = param[1];
                record.s7_ic = Some(item_count);

                let mut offset = 2;
                for i in 0..item_count as usize {
                    if offset + 12 > param.len() {
                        break;
                    }
                    let item = &param[offset..offset + 12];

                    if i == 0 {
                        let area = item[8];
                        let byte_addr = s7_byte_address(&item[9..12]);

                        record.s7_syn = Some(item[2]);
                        record.s7_tsz = Some(item[3]);
                        record.s7_amt = Some(be16(&item[4..6]));
                        record.s7_ar = Some(area);
                        record.s7_addr = Some(byte_addr);

                        let db = if area == 0x84 {
                            let db = be16(&item[6..8]);
                            record.s7_db = Some(db);
                            db
                        } else {
                            0
                        };

                        let translated = assets.translate_s7_address(area, db, byte_addr);
                        let description = assets.description(&translated);
                        if !description.is_empty() {
                            record.s7_description = Some(description);
                        }
                    }

                    offset += 12;
                }
            }
        }

        if data_len > 0 && pdu.len() >= header_size + param_len + data_len {
            let data = &pdu[header_size + param_len..header_size + param_len + data_len];

            if rosctr == ROSCTR_ACK_DATA && request_items > 0 {
                let mut offset = 0;
                for i in 0..request_items {
                    if offset + 1 > data.len() {
                        break;
                    }
                    let return_code = data[offset];

                    if i == 0 {
                        record.s7_rc = Some(return_code);
                    }

                    if return_code == 0xff {
                        if offset + 4 > data.len() {
                            offset += 1;
                            continue;
                        }
                        let read_len_bits = be16(&data[offset + 2..offset + 4]) as u32;
                        let read_len_bytes = ((read_len_bits + 7) / 8) as u16;

                        if i == 0 {
                            record.s7_len = Some(read_len_bytes);
                        }

                        if offset + 4 + read_len_bytes as usize <= data.len() {
                            offset += 4 + read_len_bytes as usize;
                            // Items are padded to even byte boundaries
                            if read_len_bytes % 2 != 0 {
                                offset += 1;
                            }
                        } else {
                            offset += 4;
                        }
                    } else {
                        offset += 1;
                    }
                }
            }
        }

        if direction == "response" {
            if let Some(table) = self.pending.get_mut(&info.flow_id) {
                table.remove(&pdu_ref);
            }
        }

        vec![record]
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

impl Default for S7CommParser {
    fn default() -> Self {
        Self::new()
    }
}
