//! The container runtime.
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ensure_running, stop_if_present, DaemonManager};
use crate::api::SharedNodeConfig;
use crate::artifact::{install_component, remove_path, write_file, Component, Source};
use crate::config::Config;
use crate::credentials::AwsConfig;
use crate::error::Result;
use crate::tracker::Tracker;

/// The containerd service unit.
pub const DAEMON_NAME: &str = "containerd";

const UNIT: &[u8] = include_bytes!("units/containerd.service");
const CREDENTIALS_DROP_IN: &str = "10-aws-credentials.conf";
const SANDBOX_IMAGE: &str = "registry.k8s.io/pause:3.9";

/// Writes containerd's configuration and controls its service.
pub struct ContainerdDaemon {
    manager: Arc<dyn DaemonManager>,
    node_config: SharedNodeConfig,
    aws_config: AwsConfig,
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl ContainerdDaemon {
    /// Creates the daemon.
    pub fn new(
        manager: Arc<dyn DaemonManager>,
        node_config: SharedNodeConfig,
        aws_config: AwsConfig,
        config: Arc<Config>,
        cancel: CancellationToken,
    ) -> Self {
        ContainerdDaemon {
            manager,
            node_config,
            aws_config,
            config,
            cancel,
        }
    }

    /// Writes `config.toml` and the drop-in exporting the AWS credential environment.
    pub async fn configure(&self) -> Result<()> {
        let extra = self.node_config.read().await.spec.containerd.config.clone();
        let config_file = &self.config.containerd.config_file;
        write_file(config_file, render_config(&extra), 0o644).await?;
        debug!(path = ?config_file, "Wrote containerd config");

        let drop_in = self.drop_in_path();
        write_file(&drop_in, render_environment(&self.aws_config), 0o644).await?;
        debug!(path = ?drop_in, "Wrote containerd credentials drop-in");
        Ok(())
    }

    /// Starts containerd unless it is already running.
    pub async fn ensure_running(&self) -> Result<()> {
        ensure_running(
            self.manager.as_ref(),
            DAEMON_NAME,
            &self.cancel,
            self.config.daemon_start_timeout,
        )
        .await
    }

    /// Stops containerd.
    pub async fn stop(&self) -> Result<()> {
        stop_if_present(self.manager.as_ref(), DAEMON_NAME).await
    }

    fn drop_in_path(&self) -> PathBuf {
        self.config
            .unit_drop_in_dir(DAEMON_NAME)
            .join(CREDENTIALS_DROP_IN)
    }
}

/// Installs the containerd binary and its unit file.
pub async fn install(
    cancel: &CancellationToken,
    tracker: &Tracker,
    source: &mut Source,
    config: &Config,
) -> Result<()> {
    install_component(
        cancel,
        tracker,
        Component::Containerd,
        &config.containerd.binary,
        source,
        0o755,
    )
    .await?;
    // Only a tracked component gets a unit, so uninstall always finds it.
    write_file(config.unit_file(DAEMON_NAME), UNIT, 0o644).await
}

/// Removes everything [`install`] and [`ContainerdDaemon::configure`] wrote.
pub async fn uninstall(config: &Config) -> Result<()> {
    remove_path(config.unit_drop_in_dir(DAEMON_NAME)).await?;
    remove_path(config.unit_file(DAEMON_NAME)).await?;
    if let Some(dir) = config.containerd.config_file.parent() {
        remove_path(dir).await?;
    }
    remove_path(&config.containerd.binary).await
}

fn render_config(extra: &str) -> String {
    let mut config = format!(
        r#"version = 2
root = "/var/lib/containerd"
state = "/run/containerd"

[grpc]
address = "/run/containerd/containerd.sock"

[plugins."io.containerd.grpc.v1.cri"]
sandbox_image = "{sandbox}"

[plugins."io.containerd.grpc.v1.cri".containerd]
default_runtime_name = "runc"
discard_unpacked_layers = true

[plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc]
runtime_type = "io.containerd.runc.v2"

[plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc.options]
SystemdCgroup = true

[plugins."io.containerd.grpc.v1.cri".cni]
bin_dir = "/opt/cni/bin"
conf_dir = "/etc/cni/net.d"
"#,
        sandbox = SANDBOX_IMAGE
    );
    if !extra.trim().is_empty() {
        config.push('\n');
        config.push_str(extra.trim_end());
        config.push('\n');
    }
    config
}

fn render_environment(aws: &AwsConfig) -> String {
    let mut unit = String::from("[Service]\n");
    for (key, value) in aws.environment() {
        unit.push_str(&format!("Environment=\"{}={}\"\n", key, value));
    }
    unit
}
