//! Text grammars for the console output of `usbip` and `/proc/version`.
//!
//! Pure text parsers (no I/O). Output of the usbip tool is quasi-structured:
//! it may be preceded by `usbip: error: ...` diagnostics (for example when
//! the hwdata id database is missing), vendor and product names may contain
//! colons and parentheses, and descriptive trailer lines vary between
//! versions. Each grammar therefore fails hard only when the header is
//! unrecognizable; a malformed record inside the body is skipped on its own.

pub mod exports;
pub mod kernel;
pub mod ports;

pub use exports::{parse_exports, ExportHost, ExportedDevice};
pub use kernel::{parse_kernel_version, KernelVersion};
pub use ports::{parse_ports, ImportedDevice, ImportedRemote};

use crate::error::{Grammar, MonitorError, ParseLocation};

/// Diagnostic lines usbip prints ahead of its real output.
const ERROR_LINE_PREFIX: &str = "usbip: error:";

/// Vendor, product and the USB id pair, as printed after a bus id or port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub vendor: String,
    pub product: String,
    pub vendor_id: String,
    pub product_id: String,
}

impl DeviceMetadata {
    /// The `vendorid:productid` identity used for by-id lookups.
    pub fn id_pattern(&self) -> String {
        format!("{}:{}", self.vendor_id, self.product_id)
    }
}

fn is_error_line(line: &str) -> bool {
    line.get(..ERROR_LINE_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(ERROR_LINE_PREFIX))
}

/// Match `<title>` followed by a line of `=` after any leading error lines.
///
/// Returns the index of the first body line.
pub(crate) fn parse_header(
    lines: &[&str],
    title: &str,
    grammar: Grammar,
    raw: &str,
) -> crate::Result<usize> {
    let fail = |index: usize, expected: &'static str| MonitorError::Parse {
        grammar,
        location: ParseLocation {
            line: index + 1,
            expected,
        },
        raw: raw.to_string(),
    };

    let title_index = lines
        .iter()
        .position(|line| !is_error_line(line))
        .unwrap_or(lines.len());

    match lines.get(title_index) {
        Some(line) if line.trim_end().eq_ignore_ascii_case(title) => {}
        _ => return Err(fail(title_index, "header")),
    }

    let underline_index = title_index + 1;
    match lines.get(underline_index) {
        Some(line) => {
            let underline = line.trim_end();
            if underline.is_empty() || !underline.chars().all(|c| c == '=') {
                return Err(fail(underline_index, "header underline"));
            }
        }
        None => return Err(fail(underline_index, "header underline")),
    }

    Ok(underline_index + 1)
}

/// Extract `<vendor> : <product> (<vendorid>:<productid>)`.
///
/// The id pair is the last parenthesized group on the line, split at its
/// last `:`. Vendor and product are split at the last `:` before that
/// group, so `FT232 Serial (UART) IC` survives intact.
pub(crate) fn parse_metadata(text: &str) -> Option<DeviceMetadata> {
    let close = text.rfind(')')?;
    let open = text[..close].rfind('(')?;

    let (vendor_id, product_id) = text[open + 1..close].rsplit_once(':')?;
    let (vendor, product) = text[..open].rsplit_once(':')?;

    let vendor_id = vendor_id.trim();
    let product_id = product_id.trim();
    if vendor_id.is_empty() || product_id.is_empty() {
        return None;
    }

    Some(DeviceMetadata {
        vendor: vendor.trim().to_string(),
        product: product.trim().to_string(),
        vendor_id: vendor_id.to_string(),
        product_id: product_id.to_string(),
    })
}
