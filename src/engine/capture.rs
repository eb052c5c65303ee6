//! Capture source setup
//!
//! Opens the libpcap source (offline file or live interface) and applies the
//! BPF filter. These are the fatal-at-startup paths: a source that cannot be
//! opened or a filter that does not compile ends the process with a nonzero
//! exit, so the failures carry their own typed error.

use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("could not open PCAP file {path}: {source}")]
    FileOpen { path: String, source: pcap::Error },

    #[error("could not open device {device}: {source}")]
    DeviceOpen { device: String, source: pcap::Error },

    #[error("could not activate capture on {device}: {source}")]
    Activate { device: String, source: pcap::Error },

    #[error("could not compile BPF filter '{filter}': {source}")]
    BadFilter { filter: String, source: pcap::Error },
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Open a capture file for offline replay
pub fn open_file(path: &Path, filter: Option<&str>) -> Result<pcap::Capture<pcap::Offline>> {
    info!("opening PCAP file {}", path.display());
    let mut capture = pcap::Capture::from_file(path).map_err(|source| CaptureError::FileOpen {
        path: path.display().to_string(),
        source,
    })?;
    apply_filter(&mut capture, filter)?;
    Ok(capture)
}

/// Open a live capture on an interface
pub fn open_device(device: &str, filter: Option<&str>) -> Result<pcap::Capture<pcap::Active>> {
    info!("opening interface {device}");
    let inactive = pcap::Capture::from_device(device).map_err(|source| CaptureError::DeviceOpen {
        device: device.to_string(),
        source,
    })?;

    let mut capture = inactive
        .promisc(true)
        .snaplen(65535)
        .timeout(1000)
        .open()
        .map_err(|source| CaptureError::Activate {
            device: device.to_string(),
            source,
        })?;

    apply_filter(&mut capture, filter)?;
    Ok(capture)
}

fn apply_filter<T: pcap::Activated + ?Sized>(
    capture: &mut pcap::Capture<T>,
    filter: Option<&str>,
) -> Result<()> {
    if let Some(expr) = filter {
        capture.filter(expr, true).map_err(|source| CaptureError::BadFilter {
            filter: expr.to_string(),
            source,
        })?;
        info!("BPF filter applied: {expr}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file_is_typed() {
        let err = open_file(Path::new("/nonexistent/trace.pcap"), None).unwrap_err();
        assert!(matches!(err, CaptureError::FileOpen { .. }));
        assert!(err.to_string().contains("/nonexistent/trace.pcap"));
    }

    #[test]
    fn test_errors_carry_context_in_display() {
        let err = CaptureError::BadFilter {
            filter: "tcp port 502".into(),
            source: pcap::Error::PcapError("syntax error".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("tcp port 502"));
        assert!(msg.contains("syntax error"));
    }

    #[test]
    fn test_converts_into_anyhow() {
        fn fallible() -> anyhow::Result<()> {
            Err(CaptureError::DeviceOpen {
                device: "ens3".into(),
                source: pcap::Error::PcapError("permission denied".into()),
            })?;
            Ok(())
        }
        let err = fallible().unwrap_err();
        assert!(err.to_string().contains("ens3"));
    }
}
