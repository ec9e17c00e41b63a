//! `usbip list --remote=<host>` output.

use super::{parse_header, parse_metadata, DeviceMetadata};
use crate::error::Grammar;

const HEADER: &str = "Exportable USB devices";

/// One device offered by a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub bus_id: String,
    pub vendor: String,
    pub product: String,
    pub vendor_id: String,
    pub product_id: String,
}

impl ExportedDevice {
    /// `vendorid:productid`, compared verbatim against `--find-by-id`.
    pub fn id_pattern(&self) -> String {
        format!("{}:{}", self.vendor_id, self.product_id)
    }
}

/// A remote endpoint and the devices it currently exports, in listing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportHost {
    pub name: String,
    pub devices: Vec<ExportedDevice>,
}

/// Parse an export listing into its host blocks.
///
/// A listing with no host blocks yields an empty vector.
pub fn parse_exports(raw: &str) -> crate::Result<Vec<ExportHost>> {
    let lines: Vec<&str> = raw.lines().collect();
    let body = parse_header(&lines, HEADER, Grammar::Exports, raw)?;

    let mut hosts: Vec<ExportHost> = Vec::new();

    for (index, line) in lines.iter().enumerate().skip(body) {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            continue;
        }

        if let Some(name) = trimmed.strip_prefix("- ") {
            hosts.push(ExportHost {
                name: name.trim().to_string(),
                devices: Vec::new(),
            });
            continue;
        }

        let Some(host) = hosts.last_mut() else {
            tracing::debug!(line = index + 1, text = %trimmed, "Ignoring text before the first host");
            continue;
        };

        match parse_device_line(trimmed) {
            Some(device) => host.devices.push(device),
            None => {
                tracing::debug!(
                    host = %host.name,
                    line = index + 1,
                    text = %trimmed,
                    "Skipping malformed device line"
                );
            }
        }
    }

    Ok(hosts)
}

/// `<busid>: <vendor> : <product> (<vendorid>:<productid>)`
fn parse_device_line(line: &str) -> Option<ExportedDevice> {
    let (bus_id, rest) = line.split_once(':')?;
    let bus_id = bus_id.trim();
    if bus_id.is_empty() || bus_id.starts_with('-') {
        return None;
    }

    let DeviceMetadata {
        vendor,
        product,
        vendor_id,
        product_id,
    } = parse_metadata(rest)?;

    Some(ExportedDevice {
        bus_id: bus_id.to_string(),
        vendor,
        product,
        vendor_id,
        product_id,
    })
}
