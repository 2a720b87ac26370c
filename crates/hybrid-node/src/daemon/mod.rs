//! `daemon` manages the small fixed set of host services a hybrid node needs.
//!
//! [`DaemonManager`] is a thin typed wrapper over the host's service
//! supervisor. Each [`Daemon`] variant knows how to configure itself from the
//! node configuration and cloud credentials, and is started, checked and
//! stopped through the manager.
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artifact::Component;
use crate::backoff::{poll_until, ExponentialBackoffStrategy, Check};
use crate::error::{Error, Result};

pub mod containerd;
pub mod kubelet;
pub mod ssm;
pub mod systemd;

pub use containerd::ContainerdDaemon;
pub use kubelet::KubeletDaemon;
pub use ssm::SsmDaemon;
pub use systemd::SystemdManager;

/// What the service supervisor reports about a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonStatus {
    /// Running.
    Running,
    /// Starting or reloading.
    Activating,
    /// Not running.
    Stopped,
    /// Exited with an error.
    Failed,
    /// Any state the supervisor reports that is not modeled above.
    Unknown,
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DaemonStatus::Running => "running",
            DaemonStatus::Activating => "activating",
            DaemonStatus::Stopped => "stopped",
            DaemonStatus::Failed => "failed",
            DaemonStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Control over the host's service supervision facility, by unit name.
///
/// Implementations fail with [`Error::DaemonNotFound`] when the unit does
/// not exist and [`Error::DaemonControl`] (carrying the captured output)
/// for any other supervisor failure.
#[async_trait]
pub trait DaemonManager: Send + Sync {
    /// Starts the unit.
    async fn start(&self, name: &str) -> Result<()>;
    /// Stops the unit.
    async fn stop(&self, name: &str) -> Result<()>;
    /// Restarts the unit.
    async fn restart(&self, name: &str) -> Result<()>;
    /// Enables the unit at boot.
    async fn enable(&self, name: &str) -> Result<()>;
    /// Disables the unit at boot.
    async fn disable(&self, name: &str) -> Result<()>;
    /// Reports the unit's current state.
    async fn status(&self, name: &str) -> Result<DaemonStatus>;
    /// Re-reads unit files after they were written or removed.
    async fn reload(&self) -> Result<()>;
}

/// The daemons a hybrid node runs.
///
/// The set is closed: container runtime, kubelet and the remote management
/// agent. Each variant owns disjoint host resources (unit names, config
/// paths), so different daemons never need to synchronize with each other.
pub enum Daemon {
    /// The container runtime.
    Containerd(ContainerdDaemon),
    /// The kubelet.
    Kubelet(KubeletDaemon),
    /// The remote management agent.
    Ssm(SsmDaemon),
}

impl Daemon {
    /// The service unit name.
    pub fn name(&self) -> &'static str {
        match self {
            Daemon::Containerd(_) => containerd::DAEMON_NAME,
            Daemon::Kubelet(_) => kubelet::DAEMON_NAME,
            Daemon::Ssm(_) => ssm::DAEMON_NAME,
        }
    }

    /// The installed component this daemon needs in place before it can run.
    pub fn component(&self) -> Component {
        match self {
            Daemon::Containerd(_) => Component::Containerd,
            Daemon::Kubelet(_) => Component::Kubelet,
            Daemon::Ssm(_) => Component::Ssm,
        }
    }

    /// Writes daemon specific configuration derived from the node config and credentials.
    pub async fn configure(&self) -> Result<()> {
        info!(daemon = self.name(), "Configuring daemon");
        match self {
            Daemon::Containerd(d) => d.configure().await,
            Daemon::Kubelet(d) => d.configure().await,
            Daemon::Ssm(d) => d.configure().await,
        }
    }

    /// Starts the daemon unless it is already running.
    pub async fn ensure_running(&self) -> Result<()> {
        match self {
            Daemon::Containerd(d) => d.ensure_running().await,
            Daemon::Kubelet(d) => d.ensure_running().await,
            Daemon::Ssm(d) => d.ensure_running().await,
        }
    }

    /// Stops the daemon.
    pub async fn stop(&self) -> Result<()> {
        info!(daemon = self.name(), "Stopping daemon");
        match self {
            Daemon::Containerd(d) => d.stop().await,
            Daemon::Kubelet(d) => d.stop().await,
            Daemon::Ssm(d) => d.stop().await,
        }
    }
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Daemon").field(&self.name()).finish()
    }
}

/// Starts `name` if it is not running and waits for it to become active.
///
/// Idempotent: a running unit is left alone. A unit that lands in the
/// failed state aborts the wait immediately.
pub(crate) async fn ensure_running(
    manager: &dyn DaemonManager,
    name: &str,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<()> {
    if manager.status(name).await? == DaemonStatus::Running {
        debug!(daemon = name, "Daemon already running");
        return Ok(());
    }
    manager.reload().await?;
    manager.enable(name).await?;
    manager.start(name).await?;

    let operation = format!("daemon {} to become active", name);
    poll_until(
        &operation,
        cancel,
        timeout,
        ExponentialBackoffStrategy::default(),
        move || async move {
            Ok(match manager.status(name).await? {
                DaemonStatus::Running => Check::Ready(()),
                DaemonStatus::Failed => Check::Failed(DaemonStatus::Failed.to_string()),
                other => Check::Pending(other.to_string()),
            })
        },
    )
    .await?;
    info!(daemon = name, "Daemon running");
    Ok(())
}

/// Stops `name`, treating a unit that no longer exists as already stopped.
pub(crate) async fn stop_if_present(manager: &dyn DaemonManager, name: &str) -> Result<()> {
    match manager.stop(name).await {
        Err(Error::DaemonNotFound { .. }) => {
            debug!(daemon = name, "Daemon not present, nothing to stop");
            Ok(())
        }
        other => other,
    }
}
