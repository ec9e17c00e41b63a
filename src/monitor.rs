//! The attach, map, poll and detach state machine.
//!
//! One `AttachmentMonitor` owns one target device for the lifetime of a
//! run. It executes strictly sequentially: at most one `usbip` invocation
//! is in flight at any time, and every wait is abandoned as soon as the
//! run's cancellation token fires.
//!
//! Once `attach` has succeeded the attachment is released on every exit
//! path where a local port is known, using a detach call bounded by its
//! own timeout and independent of the run's token.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::driver::UsbIp;
use crate::error::MonitorError;
use crate::grammar::{ExportHost, ImportedDevice};
use crate::resolver::{resolve, ResolvedTarget, TargetSpec};

/// Observable lifecycle of a monitor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Resolving,
    Attaching,
    /// Waiting for the attached device to appear on a local port.
    PortMapping,
    /// Mapped; polling to confirm the mapping still exists.
    Monitoring,
    Detaching,
    /// Ended gracefully or by cancellation.
    Terminated,
    /// Ended by a fatal error.
    Failed,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Idle => "idle",
            MonitorState::Resolving => "resolving",
            MonitorState::Attaching => "attaching",
            MonitorState::PortMapping => "port-mapping",
            MonitorState::Monitoring => "monitoring",
            MonitorState::Detaching => "detaching",
            MonitorState::Terminated => "terminated",
            MonitorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Waits and bounds used by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTimings {
    /// Delay between mapping checks while monitoring.
    pub poll_interval: Duration,
    /// Delay between port-mapping attempts.
    pub retry_backoff: Duration,
    /// Port-mapping attempts before giving up.
    pub max_map_attempts: u32,
    /// Upper bound on the shutdown detach.
    pub detach_timeout: Duration,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            retry_backoff: Duration::from_secs(1),
            max_map_attempts: 10,
            detach_timeout: Duration::from_secs(1),
        }
    }
}

/// Summary of a run that ended without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub bus_id: String,
    pub device_id: Option<String>,
    /// The local port last seen backing the attachment.
    pub last_port: Option<String>,
}

pub struct AttachmentMonitor<U: UsbIp> {
    usbip: U,
    target: TargetSpec,
    timings: MonitorTimings,
    state_tx: watch::Sender<MonitorState>,
    span: tracing::Span,
}

impl<U: UsbIp> AttachmentMonitor<U> {
    pub fn new(usbip: U, target: TargetSpec, timings: MonitorTimings) -> Self {
        let span = tracing::info_span!("monitor", device = %target);
        let (state_tx, _) = watch::channel(MonitorState::Idle);
        Self {
            usbip,
            target,
            timings,
            state_tx,
            span,
        }
    }

    /// Receive every state transition of this monitor.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> MonitorState {
        *self.state_tx.borrow()
    }

    pub fn usbip(&self) -> &U {
        &self.usbip
    }

    /// Attach the target and keep it mapped until `cancel` fires.
    ///
    /// Returns `MonitorError::Cancelled` if cancellation arrives before the
    /// attachment exists; after that point cancellation ends the run with
    /// `Ok`.
    pub async fn run(&self, cancel: &CancellationToken) -> crate::Result<MonitorReport> {
        self.run_inner(cancel).instrument(self.span.clone()).await
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> crate::Result<MonitorReport> {
        let target = match self.acquire(cancel).await {
            Ok(target) => target,
            Err(e) => return Err(self.finish_before_attach(e)),
        };

        let mut last_port: Option<String> = None;
        let outcome = self.supervise(&target, &mut last_port, cancel).await;

        match (&outcome, &last_port) {
            (_, Some(port)) => self.release(port).await,
            (Err(e), None) if e.is_cancelled() => {
                tracing::warn!(
                    bus_id = %target.bus_id,
                    "Cancelled before the device was mapped to a local port, it stays attached"
                );
            }
            (_, None) => {}
        }

        match outcome {
            Err(e) if !e.is_cancelled() => {
                tracing::error!(error = %e, "Monitoring failed");
                self.set_state(MonitorState::Failed);
                Err(e)
            }
            _ => {
                self.set_state(MonitorState::Terminated);
                Ok(MonitorReport {
                    bus_id: target.bus_id,
                    device_id: target.device_id,
                    last_port,
                })
            }
        }
    }

    /// Resolve the target and attach it.
    async fn acquire(&self, cancel: &CancellationToken) -> crate::Result<ResolvedTarget> {
        self.set_state(MonitorState::Resolving);
        let host = self.fetch_host(cancel).await?;
        let target = resolve(&self.target, &host)?;

        self.set_state(MonitorState::Attaching);
        ensure_active(cancel)?;
        self.usbip
            .attach(&target.bus_id, target.device_id.as_deref(), cancel)
            .await?;
        tracing::info!(
            bus_id = %target.bus_id,
            device_id = target.device_id.as_deref().unwrap_or("<root>"),
            "Attached"
        );
        Ok(target)
    }

    fn finish_before_attach(&self, error: MonitorError) -> MonitorError {
        if error.is_cancelled() {
            tracing::info!("Cancelled before attaching");
            self.set_state(MonitorState::Terminated);
        } else {
            tracing::error!(error = %error, "Failed to attach");
            self.set_state(MonitorState::Failed);
        }
        error
    }

    /// The one host addressed by the driver, or an empty listing.
    async fn fetch_host(&self, cancel: &CancellationToken) -> crate::Result<ExportHost> {
        ensure_active(cancel)?;
        let mut hosts = self.usbip.list(cancel).await?;
        if hosts.len() != 1 {
            tracing::warn!(hosts = hosts.len(), "Expected exactly one exporting host in listing");
        }
        if hosts.is_empty() {
            return Ok(ExportHost {
                name: self.usbip.remote().host.clone(),
                devices: Vec::new(),
            });
        }
        Ok(hosts.swap_remove(0))
    }

    /// Map, then poll until cancelled or the mapping is lost for good.
    ///
    /// Always returns an error; `Cancelled` is the graceful ending.
    async fn supervise(
        &self,
        target: &ResolvedTarget,
        last_port: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        self.set_state(MonitorState::PortMapping);
        let port = self.map_port(target, cancel).await?;
        tracing::info!(port = %port, "Mapped attached device to local port");
        *last_port = Some(port);
        self.set_state(MonitorState::Monitoring);

        loop {
            sleep_or_cancel(self.timings.poll_interval, cancel).await?;
            let port = self.map_port(target, cancel).await?;
            if last_port.as_deref() != Some(port.as_str()) {
                tracing::info!(
                    previous = last_port.as_deref().unwrap_or("<none>"),
                    port = %port,
                    "Local port changed"
                );
                *last_port = Some(port);
            }
            self.set_state(MonitorState::Monitoring);
        }
    }

    /// Bounded retry loop looking for the target on a local port.
    async fn map_port(
        &self,
        target: &ResolvedTarget,
        cancel: &CancellationToken,
    ) -> crate::Result<String> {
        let max = self.timings.max_map_attempts;
        let mut attempt = 1;
        loop {
            ensure_active(cancel)?;
            let devices = self.usbip.port(cancel).await?;
            if let Some(port) = self.find_port(&devices, &target.bus_id) {
                return Ok(port);
            }

            if attempt >= max {
                return Err(MonitorError::PortMappingTimeout {
                    bus_id: target.bus_id.clone(),
                    attempts: attempt,
                });
            }

            self.set_state(MonitorState::PortMapping);
            tracing::info!(
                bus_id = %target.bus_id,
                attempt,
                max,
                backoff_ms = self.timings.retry_backoff.as_millis() as u64,
                "No local port for the attached device yet, retrying"
            );
            sleep_or_cancel(self.timings.retry_backoff, cancel).await?;
            attempt += 1;
        }
    }

    fn find_port(&self, devices: &[ImportedDevice], bus_id: &str) -> Option<String> {
        let remote = self.usbip.remote();
        devices
            .iter()
            .find(|device| {
                device.remote.as_ref().is_some_and(|r| {
                    r.remote_bus_id == bus_id && r.remote_host.matches_host(&remote.host)
                })
            })
            .map(|device| device.port.clone())
    }

    /// Best-effort detach; the outcome is logged, never returned.
    async fn release(&self, port: &str) {
        self.set_state(MonitorState::Detaching);
        let detach_cancel = CancellationToken::new();

        match tokio::time::timeout(
            self.timings.detach_timeout,
            self.usbip.detach(port, &detach_cancel),
        )
        .await
        {
            Ok(Ok(())) => tracing::info!(port = %port, "Detached"),
            Ok(Err(e)) => tracing::warn!(port = %port, error = %e, "Detach failed"),
            Err(_elapsed) => {
                detach_cancel.cancel();
                tracing::warn!(
                    port = %port,
                    timeout_ms = self.timings.detach_timeout.as_millis() as u64,
                    "Detach timed out"
                );
            }
        }
    }

    fn set_state(&self, next: MonitorState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "State transition");
        }
    }
}

fn ensure_active(cancel: &CancellationToken) -> crate::Result<()> {
    if cancel.is_cancelled() {
        return Err(MonitorError::Cancelled);
    }
    Ok(())
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> crate::Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MonitorError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
