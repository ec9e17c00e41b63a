//! Error types for usbip-monitor operations.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which text grammar rejected its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    /// `usbip list --remote=<host>`
    Exports,
    /// `usbip port`
    Ports,
    /// `/proc/version`
    KernelVersion,
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grammar::Exports => write!(f, "export listing"),
            Grammar::Ports => write!(f, "port listing"),
            Grammar::KernelVersion => write!(f, "kernel version"),
        }
    }
}

/// Where inside the raw text a grammar gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLocation {
    /// 1-based line number within the raw input.
    pub line: usize,
    /// Name of the rule that failed to match.
    pub expected: &'static str,
}

impl fmt::Display for ParseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, expected {}", self.line, self.expected)
    }
}

/// Main error type for usbip-monitor operations
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Structurally unrecognizable tool output (bad header, missing prefix)
    #[error("failed to parse {grammar} ({location})")]
    Parse {
        grammar: Grammar,
        location: ParseLocation,
        raw: String,
    },

    /// The external tool exited with a nonzero status
    #[error("command '{program} {}' exited with status {code}", .args.join(" "))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// The external tool could not be started at all
    #[error("failed to spawn '{0}': {1}")]
    Spawn(String, #[source] std::io::Error),

    /// The operation was abandoned because cancellation was requested
    #[error("operation cancelled")]
    Cancelled,

    /// No exported device matched the vendor:product pattern
    #[error("failed to locate any exported device by id '{0}'")]
    DeviceNotFound(String),

    /// More than one exported device matched the vendor:product pattern
    #[error("found {count} exported devices by id '{pattern}', exactly one is required")]
    AmbiguousDevice { pattern: String, count: usize },

    /// The attached device never showed up on a local port
    #[error("failed to map remote bus id '{bus_id}' to a local port after {attempts} attempts")]
    PortMappingTimeout { bus_id: String, attempts: u32 },

    /// Invalid command-line selection or configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No usbip executable in any searched location
    #[error("failed to locate usbip, searched: {}", display_paths(.0))]
    ExecutableNotFound(Vec<PathBuf>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// True for the cooperative-cancellation outcome, which is not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MonitorError::Cancelled)
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "<nothing>".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for usbip-monitor operations
pub type Result<T> = std::result::Result<T, MonitorError>;
