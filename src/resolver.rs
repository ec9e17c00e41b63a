//! Turning the caller's device selection into a bus id to attach.

use std::fmt;

use crate::error::MonitorError;
use crate::grammar::ExportHost;

/// What the caller asked to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    /// Ids used verbatim, without checking the listing.
    Explicit {
        bus_id: String,
        device_id: Option<String>,
    },
    /// `vendorid:productid`, which must match exactly one exported device.
    ByIdPattern(String),
}

impl TargetSpec {
    /// Build a spec from the mutually exclusive selection flags.
    ///
    /// Every violation is reported in one `InvalidConfig` error.
    pub fn from_selection(
        bus_id: Option<String>,
        device_id: Option<String>,
        find_by_id: Option<String>,
    ) -> crate::Result<Self> {
        let errors = selection_errors(
            bus_id.as_deref(),
            device_id.as_deref(),
            find_by_id.as_deref(),
        );
        if !errors.is_empty() {
            return Err(MonitorError::InvalidConfig(errors.join("; ")));
        }

        match (find_by_id, bus_id) {
            (Some(pattern), _) => Ok(TargetSpec::ByIdPattern(pattern.trim().to_string())),
            (None, Some(bus_id)) => Ok(TargetSpec::Explicit { bus_id, device_id }),
            (None, None) => Err(MonitorError::InvalidConfig(
                "--bus-id is required".to_string(),
            )),
        }
    }
}

fn selection_errors(
    bus_id: Option<&str>,
    device_id: Option<&str>,
    find_by_id: Option<&str>,
) -> Vec<String> {
    let mut errors = Vec::new();
    let blank = |v: Option<&str>| v.is_some_and(|s| s.trim().is_empty());

    match find_by_id {
        Some(pattern) => {
            if bus_id.is_some() || device_id.is_some() {
                errors.push("--find-by-id cannot be combined with --bus-id or --device-id".to_string());
            }
            let valid = pattern
                .trim()
                .split_once(':')
                .is_some_and(|(vid, pid)| !vid.is_empty() && !pid.is_empty() && !pid.contains(':'));
            if !valid {
                errors.push(format!(
                    "--find-by-id '{}' must have the form <vendorid>:<productid>",
                    pattern
                ));
            }
        }
        None => {
            if bus_id.is_none() {
                errors.push("--bus-id is required unless --find-by-id is given".to_string());
            }
            if blank(bus_id) {
                errors.push("--bus-id must not be empty".to_string());
            }
            if blank(device_id) {
                errors.push("--device-id must not be empty".to_string());
            }
        }
    }

    errors
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Explicit {
                bus_id,
                device_id: Some(device_id),
            } => write!(f, "bus {} device {}", bus_id, device_id),
            TargetSpec::Explicit { bus_id, .. } => write!(f, "bus {}", bus_id),
            TargetSpec::ByIdPattern(pattern) => write!(f, "id {}", pattern),
        }
    }
}

/// The ids handed to `attach`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub bus_id: String,
    pub device_id: Option<String>,
}

/// Pick the device to attach from one host's listing.
pub fn resolve(spec: &TargetSpec, host: &ExportHost) -> crate::Result<ResolvedTarget> {
    match spec {
        TargetSpec::Explicit { bus_id, device_id } => {
            tracing::info!(
                bus_id = %bus_id,
                device_id = ?device_id,
                "Using explicit ids without checking the export listing"
            );
            Ok(ResolvedTarget {
                bus_id: bus_id.clone(),
                device_id: device_id.clone(),
            })
        }
        TargetSpec::ByIdPattern(pattern) => {
            let matches: Vec<_> = host
                .devices
                .iter()
                .filter(|d| d.id_pattern() == *pattern)
                .collect();

            match matches.as_slice() {
                [] => Err(MonitorError::DeviceNotFound(pattern.clone())),
                [device] => {
                    tracing::info!(
                        pattern = %pattern,
                        bus_id = %device.bus_id,
                        vendor = %device.vendor,
                        product = %device.product,
                        "Resolved device by id"
                    );
                    Ok(ResolvedTarget {
                        bus_id: device.bus_id.clone(),
                        device_id: None,
                    })
                }
                many => {
                    for device in many {
                        tracing::warn!(pattern = %pattern, bus_id = %device.bus_id, "Candidate device");
                    }
                    Err(MonitorError::AmbiguousDevice {
                        pattern: pattern.clone(),
                        count: many.len(),
                    })
                }
            }
        }
    }
}
