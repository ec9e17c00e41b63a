//! The four `usbip` operations against one remote endpoint.
//!
//! `UsbIp` is the seam the monitor is generic over; `UsbIpDriver` is the
//! implementation that shells out to the real tool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::grammar::{parse_exports, parse_ports, ExportHost, ImportedDevice};
use crate::process::run_captured;
use crate::remote::{RemoteHost, DEFAULT_USBIP_PORT};

#[async_trait]
pub trait UsbIp: Send + Sync {
    /// The endpoint every operation is addressed to.
    fn remote(&self) -> &RemoteHost;

    /// Devices exported by the remote endpoint.
    async fn list(&self, cancel: &CancellationToken) -> crate::Result<Vec<ExportHost>>;

    /// Devices currently attached to local ports.
    async fn port(&self, cancel: &CancellationToken) -> crate::Result<Vec<ImportedDevice>>;

    async fn attach(
        &self,
        bus_id: &str,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;

    async fn detach(&self, port: &str, cancel: &CancellationToken) -> crate::Result<()>;
}

/// Drives a `usbip` executable.
pub struct UsbIpDriver {
    executable: PathBuf,
    remote: RemoteHost,
    span: tracing::Span,
}

impl UsbIpDriver {
    pub fn new(executable: impl Into<PathBuf>, remote: RemoteHost) -> Self {
        let executable = executable.into();
        let span = tracing::info_span!("usbip", remote = %remote.host);

        if remote.port != DEFAULT_USBIP_PORT {
            span.in_scope(|| {
                tracing::warn!(
                    requested = remote.port,
                    used = DEFAULT_USBIP_PORT,
                    "usbip cannot select a remote port, ignoring the requested one"
                );
            });
        }

        Self {
            executable,
            remote,
            span,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn remote_arg(&self) -> String {
        format!("--remote={}", self.remote.host)
    }

    async fn run(&self, args: Vec<String>, cancel: &CancellationToken) -> crate::Result<String> {
        let output = run_captured(&self.executable, &args, cancel).await?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl UsbIp for UsbIpDriver {
    fn remote(&self) -> &RemoteHost {
        &self.remote
    }

    async fn list(&self, cancel: &CancellationToken) -> crate::Result<Vec<ExportHost>> {
        async {
            let raw = self.run(vec!["list".to_string(), self.remote_arg()], cancel).await?;
            let hosts = parse_exports(&raw).inspect_err(|e| {
                tracing::error!(error = %e, raw = %raw, "Unrecognized export listing");
            })?;

            for host in &hosts {
                tracing::debug!(host = %host.name, devices = host.devices.len(), "Exported host");
                for device in &host.devices {
                    tracing::debug!(
                        host = %host.name,
                        bus_id = %device.bus_id,
                        vendor = %device.vendor,
                        product = %device.product,
                        id = %device.id_pattern(),
                        "Exported device"
                    );
                }
            }
            Ok(hosts)
        }
        .instrument(self.span.clone())
        .await
    }

    async fn port(&self, cancel: &CancellationToken) -> crate::Result<Vec<ImportedDevice>> {
        async {
            let raw = self.run(vec!["port".to_string()], cancel).await?;
            let devices = parse_ports(&raw).inspect_err(|e| {
                tracing::error!(error = %e, raw = %raw, "Unrecognized port listing");
            })?;

            for device in &devices {
                let (remote_host, remote_bus_id) = match &device.remote {
                    Some(r) => (r.remote_host.to_string(), r.remote_bus_id.as_str()),
                    None => ("unknown".to_string(), "unknown"),
                };
                tracing::debug!(
                    port = %device.port,
                    in_use = device.in_use,
                    speed = %device.speed,
                    id = %device.metadata.id_pattern(),
                    remote = %remote_host,
                    remote_bus_id = %remote_bus_id,
                    "Imported device"
                );
            }
            Ok(devices)
        }
        .instrument(self.span.clone())
        .await
    }

    async fn attach(
        &self,
        bus_id: &str,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let mut args = vec![
            "attach".to_string(),
            self.remote_arg(),
            format!("--busid={}", bus_id),
        ];
        if let Some(device_id) = device_id {
            args.push(format!("--device={}", device_id));
        }

        async {
            tracing::info!(bus_id = %bus_id, device_id = ?device_id, "Attaching");
            self.run(args, cancel).await.map(|_| ())
        }
        .instrument(self.span.clone())
        .await
    }

    async fn detach(&self, port: &str, cancel: &CancellationToken) -> crate::Result<()> {
        async {
            tracing::info!(port = %port, "Detaching");
            self.run(vec!["detach".to_string(), format!("--port={}", port)], cancel)
                .await
                .map(|_| ())
        }
        .instrument(self.span.clone())
        .await
    }
}
