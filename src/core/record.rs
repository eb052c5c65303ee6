//! The single output schema shared by every sink
//!
//! A `UnifiedRecord` is one decoded application-layer event. Common fields are
//! always populated; protocol field groups are populated only by their owning
//! parser, so JSONL serialisation can simply skip `None`s. Serde field order
//! matches the JSONL key order; the CSV column order is fixed separately by
//! `CSV_HEADER` / `csv_fields`.

use serde::Serialize;

/// Every protocol name a record may carry
pub const PROTOCOLS: [&str; 14] = [
    "arp",
    "tcp_session",
    "modbus",
    "s7comm",
    "xgt_fen",
    "dnp3",
    "dns",
    "dhcp",
    "ethernet_ip",
    "iec104",
    "mms",
    "opc_ua",
    "bacnet",
    "unknown",
];

/// One decoded record
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnifiedRecord {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub protocol: String,
    pub smac: String,
    pub dmac: String,
    pub sip: String,
    pub dip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sp: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dp: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sq: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ak: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fl: Option<u8>,
    pub dir: String,

    #[serde(rename = "src_asset", skip_serializing_if = "Option::is_none")]
    pub src_asset_name: Option<String>,
    #[serde(rename = "dst_asset", skip_serializing_if = "Option::is_none")]
    pub dst_asset_name: Option<String>,

    // ARP
    #[serde(rename = "arp.op", skip_serializing_if = "Option::is_none")]
    pub arp_op: Option<u16>,
    #[serde(rename = "arp.tmac", skip_serializing_if = "Option::is_none")]
    pub arp_tmac: Option<String>,
    #[serde(rename = "arp.tip", skip_serializing_if = "Option::is_none")]
    pub arp_tip: Option<String>,

    // DNS
    #[serde(rename = "dns.tid", skip_serializing_if = "Option::is_none")]
    pub dns_tid: Option<u16>,
    #[serde(rename = "dns.fl", skip_serializing_if = "Option::is_none")]
    pub dns_fl: Option<u16>,
    #[serde(rename = "dns.qc", skip_serializing_if = "Option::is_none")]
    pub dns_qc: Option<u16>,
    #[serde(rename = "dns.ac", skip_serializing_if = "Option::is_none")]
    pub dns_ac: Option<u16>,

    // DNP3
    #[serde(rename = "dnp3.len", skip_serializing_if = "Option::is_none")]
    pub dnp3_len: Option<u8>,
    #[serde(rename = "dnp3.ctrl", skip_serializing_if = "Option::is_none")]
    pub dnp3_ctrl: Option<u8>,
    #[serde(rename = "dnp3.dest", skip_serializing_if = "Option::is_none")]
    pub dnp3_dest: Option<u16>,
    #[serde(rename = "dnp3.src", skip_serializing_if = "Option::is_none")]
    pub dnp3_src: Option<u16>,

    /// Datagram length at the protocol being reported. For Modbus this is the
    /// PDU length and for XGT FEnet the header-declared instruction length;
    /// every other parser reports the application payload length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<u32>,

    // Modbus/TCP
    #[serde(rename = "modbus.tid", skip_serializing_if = "Option::is_none")]
    pub modbus_tid: Option<u16>,
    #[serde(rename = "modbus.fc", skip_serializing_if = "Option::is_none")]
    pub modbus_fc: Option<u8>,
    #[serde(rename = "modbus.err", skip_serializing_if = "Option::is_none")]
    pub modbus_err: Option<u8>,
    #[serde(rename = "modbus.bc", skip_serializing_if = "Option::is_none")]
    pub modbus_bc: Option<u8>,
    #[serde(rename = "modbus.addr", skip_serializing_if = "Option::is_none")]
    pub modbus_addr: Option<u16>,
    #[serde(rename = "modbus.qty", skip_serializing_if = "Option::is_none")]
    pub modbus_qty: Option<u16>,
    #[serde(rename = "modbus.val", skip_serializing_if = "Option::is_none")]
    pub modbus_val: Option<u16>,
    #[serde(rename = "modbus.regs.addr", skip_serializing_if = "Option::is_none")]
    pub modbus_regs_addr: Option<u32>,
    #[serde(rename = "modbus.regs.val", skip_serializing_if = "Option::is_none")]
    pub modbus_regs_val: Option<u16>,
    #[serde(rename = "modbus.translated_addr", skip_serializing_if = "Option::is_none")]
    pub modbus_translated_addr: Option<String>,
    #[serde(rename = "modbus.description", skip_serializing_if = "Option::is_none")]
    pub modbus_description: Option<String>,

    // S7Comm
    #[serde(rename = "s7comm.prid", skip_serializing_if = "Option::is_none")]
    pub s7_prid: Option<u16>,
    #[serde(rename = "s7comm.ros", skip_serializing_if = "Option::is_none")]
    pub s7_ros: Option<u8>,
    #[serde(rename = "s7comm.fn", skip_serializing_if = "Option::is_none")]
    pub s7_fn: Option<u8>,
    #[serde(rename = "s7comm.ic", skip_serializing_if = "Option::is_none")]
    pub s7_ic: Option<u8>,
    #[serde(rename = "s7comm.syn", skip_serializing_if = "Option::is_none")]
    pub s7_syn: Option<u8>,
    #[serde(rename = "s7comm.tsz", skip_serializing_if = "Option::is_none")]
    pub s7_tsz: Option<u8>,
    #[serde(rename = "s7comm.amt", skip_serializing_if = "Option::is_none")]
    pub s7_amt: Option<u16>,
    #[serde(rename = "s7comm.db", skip_serializing_if = "Option::is_none")]
    pub s7_db: Option<u16>,
    #[serde(rename = "s7comm.ar", skip_serializing_if = "Option::is_none")]
    pub s7_ar: Option<u8>,
    #[serde(rename = "s7comm.addr", skip_serializing_if = "Option::is_none")]
    pub s7_addr: Option<u32>,
    #[serde(rename = "s7comm.rc", skip_serializing_if = "Option::is_none")]
    pub s7_rc: Option<u8>,
    #[serde(rename = "s7comm.len", skip_serializing_if = "Option::is_none")]
    pub s7_len: Option<u16>,
    #[serde(rename = "s7comm.description", skip_serializing_if = "Option::is_none")]
    pub s7_description: Option<String>,

    // XGT FEnet
    #[serde(rename = "xgt_fen.prid", skip_serializing_if = "Option::is_none")]
    pub xgt_prid: Option<u16>,
    #[serde(rename = "xgt_fen.companyId", skip_serializing_if = "Option::is_none")]
    pub xgt_company_id: Option<String>,
    #[serde(rename = "xgt_fen.plcinfo", skip_serializing_if = "Option::is_none")]
    pub xgt_plcinfo: Option<u16>,
    #[serde(rename = "xgt_fen.cpuinfo", skip_serializing_if = "Option::is_none")]
    pub xgt_cpuinfo: Option<u8>,
    #[serde(rename = "xgt_fen.source", skip_serializing_if = "Option::is_none")]
    pub xgt_source: Option<u8>,
    #[serde(rename = "xgt_fen.len", skip_serializing_if = "Option::is_none")]
    pub xgt_len: Option<u16>,
    #[serde(rename = "xgt_fen.fenetpos", skip_serializing_if = "Option::is_none")]
    pub xgt_fenetpos: Option<u8>,
    #[serde(rename = "xgt_fen.cmd", skip_serializing_if = "Option::is_none")]
    pub xgt_cmd: Option<u16>,
    #[serde(rename = "xgt_fen.dtype", skip_serializing_if = "Option::is_none")]
    pub xgt_dtype: Option<u16>,
    #[serde(rename = "xgt_fen.blkcnt", skip_serializing_if = "Option::is_none")]
    pub xgt_blkcnt: Option<u16>,
    #[serde(rename = "xgt_fen.errstat", skip_serializing_if = "Option::is_none")]
    pub xgt_errstat: Option<u16>,
    #[serde(rename = "xgt_fen.errinfo", skip_serializing_if = "Option::is_none")]
    pub xgt_errinfo: Option<u16>,
    #[serde(rename = "xgt_fen.vars", skip_serializing_if = "Option::is_none")]
    pub xgt_vars: Option<String>,
    #[serde(rename = "xgt_fen.datasize", skip_serializing_if = "Option::is_none")]
    pub xgt_datasize: Option<u16>,
    #[serde(rename = "xgt_fen.data", skip_serializing_if = "Option::is_none")]
    pub xgt_data: Option<String>,
    #[serde(rename = "xgt_fen.translated_addr", skip_serializing_if = "Option::is_none")]
    pub xgt_translated_addr: Option<String>,
    #[serde(rename = "xgt_fen.description", skip_serializing_if = "Option::is_none")]
    pub xgt_description: Option<String>,

    /// Protocol detail blob for the realtime fan-out, never written to files
    #[serde(skip)]
    pub details: Option<serde_json::Value>,
}

/// Fixed CSV header covering every field of every protocol
pub const CSV_HEADER: [&str; 67] = [
    "@timestamp", "protocol", "smac", "dmac", "sip", "sp", "dip", "dp", "sq", "ak", "fl", "dir",
    "src_asset", "dst_asset",
    "arp.op", "arp.tmac", "arp.tip",
    "dns.tid", "dns.fl", "dns.qc", "dns.ac",
    "dnp3.len", "dnp3.ctrl", "dnp3.dest", "dnp3.src",
    "len",
    "modbus.tid", "modbus.fc", "modbus.err", "modbus.bc", "modbus.addr", "modbus.qty",
    "modbus.val", "modbus.regs.addr", "modbus.regs.val", "modbus.translated_addr",
    "modbus.description",
    "s7comm.prid", "s7comm.ros", "s7comm.fn", "s7comm.ic", "s7comm.syn", "s7comm.tsz",
    "s7comm.amt", "s7comm.db", "s7comm.ar", "s7comm.addr", "s7comm.rc", "s7comm.len",
    "s7comm.description",
    "xgt_fen.prid", "xgt_fen.companyId", "xgt_fen.plcinfo", "xgt_fen.cpuinfo", "xgt_fen.source",
    "xgt_fen.len", "xgt_fen.fenetpos", "xgt_fen.cmd", "xgt_fen.dtype", "xgt_fen.blkcnt",
    "xgt_fen.errstat", "xgt_fen.errinfo", "xgt_fen.vars", "xgt_fen.datasize", "xgt_fen.data",
    "xgt_fen.translated_addr", "xgt_fen.description",
];

fn num<T: ToString>(v: &Option<T>) -> String {
    v.as_ref().map(|x| x.to_string()).unwrap_or_default()
}

fn text(v: &Option<String>) -> String {
    v.clone().unwrap_or_default()
}

impl UnifiedRecord {
    /// Record flattened into `CSV_HEADER` column order
    pub fn csv_fields(&self) -> Vec<String> {
        vec![
            self.timestamp.clone(),
            self.protocol.clone(),
            self.smac.clone(),
            self.dmac.clone(),
            self.sip.clone(),
            num(&self.sp),
            self.dip.clone(),
            num(&self.dp),
            num(&self.sq),
            num(&self.ak),
            num(&self.fl),
            self.dir.clone(),
            text(&self.src_asset_name),
            text(&self.dst_asset_name),
            num(&self.arp_op),
            text(&self.arp_tmac),
            text(&self.arp_tip),
            num(&self.dns_tid),
            num(&self.dns_fl),
            num(&self.dns_qc),
            num(&self.dns_ac),
            num(&self.dnp3_len),
            num(&self.dnp3_ctrl),
            num(&self.dnp3_dest),
            num(&self.dnp3_src),
            num(&self.len),
            num(&self.modbus_tid),
            num(&self.modbus_fc),
            num(&self.modbus_err),
            num(&self.modbus_bc),
            num(&self.modbus_addr),
            num(&self.modbus_qty),
            num(&self.modbus_val),
            num(&self.modbus_regs_addr),
            num(&self.modbus_regs_val),
            text(&self.modbus_translated_addr),
            text(&self.modbus_description),
            num(&self.s7_prid),
            num(&self.s7_ros),
            num(&self.s7_fn),
            num(&self.s7_ic),
            num(&self.s7_syn),
            num(&self.s7_tsz),
            num(&self.s7_amt),
            num(&self.s7_db),
            num(&self.s7_ar),
            num(&self.s7_addr),
            num(&self.s7_rc),
            num(&self.s7_len),
            text(&self.s7_description),
            num(&self.xgt_prid),
            text(&self.xgt_company_id),
            num(&self.xgt_plcinfo),
            num(&self.xgt_cpuinfo),
            num(&self.xgt_source),
            num(&self.xgt_len),
            num(&self.xgt_fenetpos),
            num(&self.xgt_cmd),
            num(&self.xgt_dtype),
            num(&self.xgt_blkcnt),
            num(&self.xgt_errstat),
            num(&self.xgt_errinfo),
            text(&self.xgt_vars),
            num(&self.xgt_datasize),
            text(&self.xgt_data),
            text(&self.xgt_translated_addr),
            text(&self.xgt_description),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_fields_match_header_width() {
        let record = UnifiedRecord::default();
        assert_eq!(record.csv_fields().len(), CSV_HEADER.len());
    }

    #[test]
    fn test_jsonl_skips_empty_groups() {
        let record = UnifiedRecord {
            timestamp: "2023-05-10T02:24:15.000001Z".into(),
            protocol: "modbus".into(),
            smac: "aa:bb:cc:dd:ee:01".into(),
            dmac: "aa:bb:cc:dd:ee:02".into(),
            sip: "192.168.1.10".into(),
            dip: "192.168.1.2".into(),
            sp: Some(49152),
            dp: Some(502),
            sq: Some(1),
            ak: Some(1),
            fl: Some(0x18),
            dir: "request".into(),
            modbus_tid: Some(7),
            modbus_fc: Some(3),
            len: Some(5),
            ..UnifiedRecord::default()
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"modbus.tid\":7"));
        assert!(json.contains("\"modbus.fc\":3"));
        assert!(json.contains("\"@timestamp\":\"2023-05-10T02:24:15.000001Z\""));
        assert!(!json.contains("s7comm"));
        assert!(!json.contains("xgt_fen"));
        assert!(!json.contains("arp."));
    }

    #[test]
    fn test_jsonl_ports_are_numbers() {
        let record = UnifiedRecord {
            protocol: "dns".into(),
            sp: Some(5353),
            dp: Some(53),
            dns_tid: Some(77),
            ..UnifiedRecord::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"sp\":5353"));
        assert!(json.contains("\"dp\":53"));
        assert!(json.contains("\"dns.tid\":77"));
    }

    #[test]
    fn test_details_never_serialized() {
        let record = UnifiedRecord {
            protocol: "unknown".into(),
            details: Some(serde_json::json!({"len": 4})),
            ..UnifiedRecord::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("details"));
    }
}
