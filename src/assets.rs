//! Asset catalogue
//!
//! Three read-only maps built once at startup from plant inventory CSVs:
//! IP -> device name, translated tag -> description, plus the pure address
//! translation rules for Modbus, S7 and XGT.
//!
//! The inventory files are hand-maintained exports and arrive noisy: decimal
//! commas inside IPs, `/port` suffixes, `modbus:` prefixes, blank device-name
//! cells that mean "same device as the previous row". Those quirks are
//! accepted input, not errors; only rows that still fail IPv4 validation after
//! normalisation are skipped.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use crate::config::AssetConfig;

/// Tag columns carrying per-vendor addresses, all mapped to the column-1
/// description: Mitsubishi, LS, Siemens, detachable (LS), detachable
/// (Mitsubishi)
const TAG_COLUMNS: [usize; 5] = [3, 4, 5, 6, 7];

fn xgt_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^%([A-Z]{2})([0-9]+)$").expect("static regex"))
}

/// Normalise a noisy inventory IP literal
///
/// `192,168.10.25` -> `192.168.10.25`, `192.168.1.22/502` -> `192.168.1.22`,
/// `modbus: 192.168.1.22/502` -> `192.168.1.22`. Idempotent.
pub fn normalize_ip(raw: &str) -> String {
    let mut s = raw.replace(',', ".");

    if let Some(pos) = s.find('/') {
        s.truncate(pos);
    }

    if s.contains("modbus:") {
        if let Some(pos) = s.find(':') {
            s = s[pos + 1..].trim().to_string();
            if let Some(pos) = s.find('/') {
                s.truncate(pos);
            }
        }
    }

    s.trim().to_string()
}

fn is_valid_ipv4(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

/// Read-only asset lookup maps
#[derive(Debug, Default)]
pub struct AssetCatalog {
    ip_device: HashMap<String, String>,
    tag_description: HashMap<String, String>,
}

impl AssetCatalog {
    /// Load the catalogue; per-file failures are logged and leave that map
    /// empty, the process never aborts on asset errors.
    pub fn load(config: &AssetConfig) -> Self {
        let mut catalog = Self::default();

        if let Err(e) = catalog.load_ip_csv(&config.ip_csv) {
            warn!("could not load IP inventory {}: {e:#}", config.ip_csv.display());
        }
        for path in [&config.input_tags_csv, &config.output_tags_csv] {
            if let Err(e) = catalog.load_tag_csv(path) {
                warn!("could not load tag inventory {}: {e:#}", path.display());
            }
        }

        info!(
            "asset catalogue ready: {} IP entries, {} tag entries",
            catalog.ip_device.len(),
            catalog.tag_description.len()
        );
        catalog
    }

    fn load_ip_csv(&mut self, path: &Path) -> anyhow::Result<()> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;

        let mut header_skipped = false;
        let mut last_device_name = String::new();

        for (line, result) in reader.records().enumerate() {
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    warn!("IP inventory line {}: {e}", line + 1);
                    continue;
                }
            };

            if row.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            if !header_skipped
                && row.iter().any(|f| f.contains("Device Name") || f.contains("IP"))
            {
                header_skipped = true;
                continue;
            }
            if row.len() < 2 {
                warn!("IP inventory line {}: insufficient fields, skipping", line + 1);
                continue;
            }

            let mut device_name = row[0].trim().to_string();
            let ip_raw = row[1].trim();
            let ip = normalize_ip(ip_raw);

            if device_name.is_empty() && !last_device_name.is_empty() {
                device_name = format!("{} (secondary)", last_device_name);
            }

            if !is_valid_ipv4(&ip) {
                if !ip.is_empty() {
                    warn!(
                        "IP inventory line {}: invalid IP '{}' (normalised '{}'), skipping",
                        line + 1,
                        ip_raw,
                        ip
                    );
                }
                continue;
            }

            if device_name.is_empty() {
                device_name = format!("Unknown Device ({})", ip);
            }

            self.ip_device.insert(ip, device_name.clone());
            last_device_name = device_name;
        }

        Ok(())
    }

    fn load_tag_csv(&mut self, path: &Path) -> anyhow::Result<()> {
        let mut file = BufReader::new(File::open(path)?);

        // Vendor exports often carry a UTF-8 BOM
        let mut bom = [0u8; 3];
        let n = file.read(&mut bom)?;
        if !(n == 3 && bom == [0xef, 0xbb, 0xbf]) {
            file.seek(SeekFrom::Start(0))?;
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        for result in reader.records() {
            let row = match result {
                Ok(row) => row,
                Err(_) => continue,
            };
            if row.len() < 2 {
                continue;
            }
            let description = row[1].to_string();
            if description.is_empty() {
                continue;
            }
            for &col in &TAG_COLUMNS {
                if let Some(tag) = row.get(col) {
                    let tag = tag.trim();
                    if !tag.is_empty() {
                        self.tag_description.insert(tag.to_string(), description.clone());
                    }
                }
            }
        }

        Ok(())
    }

    /// Device name for a normalised IP, empty on miss
    pub fn device_name(&self, ip: &str) -> String {
        self.ip_device.get(ip).cloned().unwrap_or_default()
    }

    /// Tag description for a translated address, empty on miss
    pub fn description(&self, translated_addr: &str) -> String {
        self.tag_description.get(translated_addr).cloned().unwrap_or_default()
    }

    /// Translate an XGT variable name to a word-addressed tag
    ///
    /// `%DB40` -> `D20`, `%MB7` -> `M3`, `%PB2` -> `P1`. Anything that is not
    /// a byte-addressed D/M/P variable yields the empty string.
    pub fn translate_xgt_address(&self, var_name: &str) -> String {
        if !var_name.starts_with('%') {
            return String::new();
        }
        let Some(caps) = xgt_var_regex().captures(var_name) else {
            return String::new();
        };
        let prefix = match &caps[1] {
            "DB" => "D",
            "MB" => "M",
            "PB" => "P",
            _ => return String::new(),
        };
        match caps[2].parse::<u64>() {
            Ok(n) => format!("{}{}", prefix, n / 2),
            Err(_) => String::new(),
        }
    }

    /// Translate a Modbus register address into the conventional data-model
    /// numbering for its function code
    pub fn translate_modbus_address(&self, fc: u8, addr: u32) -> String {
        let offset: u64 = match fc {
            0 => 1,
            1 | 2 => 10_001,
            3 => 300_001,
            4 => 400_001,
            _ => return addr.to_string(),
        };
        (offset + addr as u64).to_string()
    }

    /// Translate an S7 item address; only the DB area (0x84) maps to a tag
    pub fn translate_s7_address(&self, area: u8, db: u16, byte_addr: u32) -> String {
        if area != 0x84 {
            return String::new();
        }
        format!("DB{},{}", db, byte_addr)
    }
}
