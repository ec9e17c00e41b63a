//! usbip-monitor: attach one remotely exported USB/IP device and keep it attached.
//!
//! Drives the `usbip` command-line tool: resolves the requested device from
//! the remote export listing, attaches it, finds the local port it lands on,
//! keeps checking that mapping, and detaches on shutdown.

pub mod config;
pub mod driver;
pub mod error;
pub mod grammar;
pub mod locator;
pub mod monitor;
pub mod process;
pub mod remote;
pub mod resolver;

pub use config::{MonitorConfig, HOSTFS_PREFIX_ENV};
pub use driver::{UsbIp, UsbIpDriver};
pub use error::{MonitorError, Result};
pub use grammar::{
    parse_exports, parse_kernel_version, parse_ports, ExportHost, ExportedDevice, ImportedDevice,
    KernelVersion,
};
pub use locator::{check_executable, BinaryLocator};
pub use monitor::{AttachmentMonitor, MonitorReport, MonitorState, MonitorTimings};
pub use remote::{RemoteHost, DEFAULT_USBIP_PORT};
pub use resolver::{resolve, ResolvedTarget, TargetSpec};
