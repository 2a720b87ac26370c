//! The remote management agent.
//!
//! Configuring the agent registers the machine; it has no config file of
//! its own to write.
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{ensure_running, stop_if_present, DaemonManager};
use crate::api::SharedNodeConfig;
use crate::artifact::{install_component, remove_path, write_file, Component, Source};
use crate::config::Config;
use crate::credentials::ssm::register_machine;
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use crate::tracker::Tracker;

/// The agent's service unit.
pub const DAEMON_NAME: &str = "amazon-ssm-agent";

const UNIT: &[u8] = include_bytes!("units/amazon-ssm-agent.service");

/// Registers the machine and controls the agent's service.
pub struct SsmDaemon {
    manager: Arc<dyn DaemonManager>,
    node_config: SharedNodeConfig,
    executor: Arc<dyn CommandExecutor>,
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl SsmDaemon {
    /// Creates the daemon.
    pub fn new(
        manager: Arc<dyn DaemonManager>,
        node_config: SharedNodeConfig,
        executor: Arc<dyn CommandExecutor>,
        config: Arc<Config>,
        cancel: CancellationToken,
    ) -> Self {
        SsmDaemon {
            manager,
            node_config,
            executor,
            config,
            cancel,
        }
    }

    /// Registers the machine unless already registered and records the node name.
    pub async fn configure(&self) -> Result<()> {
        register_machine(
            &self.node_config,
            &self.config.ssm,
            self.executor.as_ref(),
            &self.cancel,
        )
        .await
        .map(|_| ())
    }

    /// Starts the agent unless it is already running.
    pub async fn ensure_running(&self) -> Result<()> {
        ensure_running(
            self.manager.as_ref(),
            DAEMON_NAME,
            &self.cancel,
            self.config.daemon_start_timeout,
        )
        .await
    }

    /// Stops the agent.
    pub async fn stop(&self) -> Result<()> {
        stop_if_present(self.manager.as_ref(), DAEMON_NAME).await
    }
}

/// Installs the agent binary to the first well-known path and writes its unit file.
pub async fn install(
    cancel: &CancellationToken,
    tracker: &Tracker,
    source: &mut Source,
    config: &Config,
) -> Result<()> {
    let binary = primary_binary(config)?;
    install_component(cancel, tracker, Component::Ssm, binary, source, 0o755).await?;
    write_file(config.unit_file(DAEMON_NAME), UNIT, 0o644).await
}

/// Removes the agent binary and unit file. The agent's registration record is left alone.
pub async fn uninstall(config: &Config) -> Result<()> {
    remove_path(config.unit_file(DAEMON_NAME)).await?;
    remove_path(primary_binary(config)?).await
}

fn primary_binary(config: &Config) -> Result<PathBuf> {
    config
        .ssm
        .agent_binaries
        .first()
        .cloned()
        .ok_or_else(|| Error::Configuration("no remote management agent paths configured".into()))
}
