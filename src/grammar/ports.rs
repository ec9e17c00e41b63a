//! `usbip port` output.

use std::sync::LazyLock;

use regex::Regex;

use super::{parse_header, parse_metadata, DeviceMetadata};
use crate::error::Grammar;
use crate::remote::RemoteHost;

const HEADER: &str = "Imported USB devices";

/// Printed in place of the uri when the kernel no longer knows the origin.
const UNKNOWN_REMOTE: &str = "unknown host, remote port and remote busid";

static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*Port (\d+): ((?i:<Port in Use>) )?at (.*)$").expect("valid regex")
});

/// Where an imported device came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedRemote {
    pub remote_host: RemoteHost,
    pub remote_bus_id: String,
}

/// A device attached to a local virtual host controller port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedDevice {
    pub port: String,
    pub in_use: bool,
    pub speed: String,
    pub metadata: DeviceMetadata,
    /// `None` only when the tool reports the origin as unknown.
    pub remote: Option<ImportedRemote>,
}

/// Parse a port listing.
///
/// Each record is a status line followed by a metadata line and a remote
/// line; anything after those up to the next status line is ignored. A
/// record whose metadata or remote line does not parse is dropped.
pub fn parse_ports(raw: &str) -> crate::Result<Vec<ImportedDevice>> {
    let lines: Vec<&str> = raw.lines().collect();
    let body = parse_header(&lines, HEADER, Grammar::Ports, raw)?;

    let mut devices = Vec::new();
    let mut index = body;

    while index < lines.len() {
        let Some(status) = STATUS_LINE.captures(lines[index]) else {
            index += 1;
            continue;
        };
        let status_line = index + 1;
        index += 1;

        let block_start = index;
        while index < lines.len() && !STATUS_LINE.is_match(lines[index]) {
            index += 1;
        }
        let block: Vec<&str> = lines[block_start..index]
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect();

        let port = status[1].to_string();
        let record = block
            .first()
            .and_then(|meta| parse_metadata(meta))
            .zip(block.get(1).and_then(|remote| parse_remote_line(remote)));

        match record {
            Some((metadata, remote)) => devices.push(ImportedDevice {
                port,
                in_use: status.get(2).is_some(),
                speed: status[3].trim().to_string(),
                metadata,
                remote,
            }),
            None => {
                tracing::debug!(port = %port, line = status_line, "Skipping malformed port record");
            }
        }
    }

    Ok(devices)
}

/// `<localbusid> -> <uri>` or the unknown-origin sentinel.
///
/// The outer `Option` is the parse result; the inner one is the remote.
fn parse_remote_line(line: &str) -> Option<Option<ImportedRemote>> {
    let target = match line.split_once(" -> ") {
        Some((_local_bus_id, target)) => target.trim(),
        None => line.trim(),
    };

    if target.eq_ignore_ascii_case(UNKNOWN_REMOTE) {
        return Some(None);
    }

    let (_scheme, rest) = target.split_once("://")?;
    let (authority, path) = rest.split_once('/')?;
    let remote_bus_id = path.trim_start_matches('/').trim();
    if remote_bus_id.is_empty() {
        return None;
    }
    let remote_host = RemoteHost::parse(authority).ok()?;

    Some(Some(ImportedRemote {
        remote_host,
        remote_bus_id: remote_bus_id.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;

    #[test]
    fn test_single_port_in_use() {
        let raw = "Imported USB devices\n====================\nPort 00: <Port in Use> at Full Speed(12Mbps)\n       unknown vendor : unknown product (0403:6001)\n       1-7 -> usbip://192.168.0.121:3240/1-7\n";
        let devices = parse_ports(raw).unwrap();
        assert_eq!(devices.len(), 1);

        let device = &devices[0];
        assert_eq!(device.port, "00");
        assert!(device.in_use);
        assert_eq!(device.speed, "Full Speed(12Mbps)");
        assert_eq!(device.metadata.vendor, "unknown vendor");
        assert_eq!(device.metadata.product, "unknown product");
        assert_eq!(device.metadata.vendor_id, "0403");
        assert_eq!(device.metadata.product_id, "6001");

        let remote = device.remote.as_ref().unwrap();
        assert_eq!(remote.remote_bus_id, "1-7");
        assert_eq!(remote.remote_host.host, "192.168.0.121");
        assert_eq!(remote.remote_host.port, 3240);
    }

    #[test]
    fn test_fixture_with_error_preamble_and_trailer() {
        let devices = parse_ports(include_str!("../../testdata/usbip-port-1.txt")).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].port, "00");
        let remote = devices[0].remote.as_ref().unwrap();
        assert_eq!(remote.remote_bus_id, "1-7");
        assert_eq!(remote.remote_host.to_string(), "192.168.0.121:3240");
    }

    #[test]
    fn test_multiple_ports() {
        let devices = parse_ports(include_str!("../../testdata/usbip-port-2.txt")).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].port, "01");
        assert_eq!(devices[1].metadata.id_pattern(), "1050:0407");
        assert_eq!(devices[1].remote.as_ref().unwrap().remote_bus_id, "1-1.6");
    }

    #[test]
    fn test_parentheses_in_product_name() {
        let devices = parse_ports(include_str!("../../testdata/usbip-port-3.txt")).unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.metadata.vendor, "Future Technology Devices International, Ltd");
        assert_eq!(device.metadata.product, "FT232 Serial (UART) IC");
        let remote = device.remote.as_ref().unwrap();
        assert_eq!(remote.remote_host.host, "br1");
        assert_eq!(remote.remote_bus_id, "1-7");
    }

    #[test]
    fn test_unknown_remote_sentinel() {
        let devices = parse_ports(include_str!("../../testdata/usbip-port-4.txt")).unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert!(device.remote.is_none());
        assert_eq!(device.port, "00");
        assert!(device.in_use);
        assert_eq!(device.speed, "Full Speed(12Mbps)");
        assert_eq!(device.metadata.product, "FT232 Serial (UART) IC");
    }

    #[test]
    fn test_sentinel_without_local_bus_id() {
        let raw = "Imported USB devices\n===\nPort 03: at High Speed(480Mbps)\n  a : b (1234:5678)\n  unknown host, remote port and remote busid\n";
        let devices = parse_ports(raw).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].in_use);
        assert_eq!(devices[0].speed, "High Speed(480Mbps)");
        assert!(devices[0].remote.is_none());
    }

    #[test]
    fn test_malformed_record_is_dropped() {
        let raw = "Imported USB devices\n===\nPort 00: <Port in Use> at Full Speed(12Mbps)\n  a : b (1234:\n  1-1 -> usbip://br1:3240/1-7\nPort 01: <Port in Use> at Full Speed(12Mbps)\n  a : b (1234:5678)\n  1-2 -> usbip://br1:3240/1-8\n";
        let devices = parse_ports(raw).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].port, "01");
    }

    #[test]
    fn test_unparseable_uri_drops_record() {
        let raw = "Imported USB devices\n===\nPort 00: <Port in Use> at Full Speed(12Mbps)\n  a : b (1234:5678)\n  1-1 -> somewhere/1-7\n";
        assert!(parse_ports(raw).unwrap().is_empty());
    }

    #[test]
    fn test_no_imports() {
        assert!(parse_ports("Imported USB devices\n====================\n").unwrap().is_empty());
    }

    #[test]
    fn test_missing_header_fails() {
        let raw = "usbip: error: open vhci_driver\n";
        let err = parse_ports(raw).unwrap_err();
        assert!(matches!(err, MonitorError::Parse { grammar: Grammar::Ports, .. }));
    }

    #[test]
    fn test_reparse_is_identical() {
        let raw = include_str!("../../testdata/usbip-port-2.txt");
        assert_eq!(parse_ports(raw).unwrap(), parse_ports(raw).unwrap());
    }
}
