//! `hybrid` ties credentials, daemons and the tracker together for one node.
//!
//! Startup happens in two phases. [`HybridNodeProvider::pre_process_daemon`]
//! establishes the machine identity (registering with the remote management
//! service when the node is configured for it), after which
//! [`HybridNodeProvider::get_daemons`] hands out the workload daemons in the
//! order they have to start.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::SharedNodeConfig;
use crate::artifact::{Component, Source};
use crate::config::Config;
use crate::credentials::{iam_roles_anywhere, AwsConfig, ProviderKind};
use crate::daemon::{
    self, ContainerdDaemon, Daemon, DaemonManager, KubeletDaemon, SsmDaemon,
};
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use crate::tracker::Tracker;

/// Per-invocation orchestrator of a hybrid node.
pub struct HybridNodeProvider {
    node_config: SharedNodeConfig,
    daemon_manager: Arc<dyn DaemonManager>,
    executor: Arc<dyn CommandExecutor>,
    config: Arc<Config>,
    aws_config: Option<AwsConfig>,
    cancel: CancellationToken,
}

impl HybridNodeProvider {
    /// Creates a provider. No cloud identity is established yet.
    pub fn new(
        node_config: SharedNodeConfig,
        daemon_manager: Arc<dyn DaemonManager>,
        executor: Arc<dyn CommandExecutor>,
        config: Arc<Config>,
        cancel: CancellationToken,
    ) -> Self {
        HybridNodeProvider {
            node_config,
            daemon_manager,
            executor,
            config,
            aws_config: None,
            cancel,
        }
    }

    /// The node configuration this provider acts on.
    pub fn node_config(&self) -> &SharedNodeConfig {
        &self.node_config
    }

    /// The runtime configuration this provider acts on.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolves the credential locations for the configured provider.
    ///
    /// Must run before [`HybridNodeProvider::get_daemons`].
    pub async fn with_aws_config(&mut self) -> Result<()> {
        let aws = AwsConfig::for_node(&*self.node_config.read().await, &self.config)?;
        info!(region = %aws.region, "Resolved AWS config");
        self.aws_config = Some(aws);
        Ok(())
    }

    /// Establishes the machine identity before any workload daemon starts.
    ///
    /// For remote activation this configures (registers) and starts the
    /// management agent, which assigns the node its name. For certificate
    /// trust it writes the credential helper config.
    pub async fn pre_process_daemon(&self) -> Result<()> {
        let kind = self.node_config.read().await.provider_kind()?;
        match kind {
            ProviderKind::Ssm => {
                let ssm = Daemon::Ssm(self.ssm_daemon());
                ssm.configure().await?;
                ssm.ensure_running().await?;
            }
            ProviderKind::IamRolesAnywhere => {
                let node = self.node_config.read().await;
                iam_roles_anywhere::write_credential_config(&node, &self.config).await?;
            }
        }
        info!(provider = %kind, "Node identity established");
        Ok(())
    }

    /// The workload daemons, container runtime first.
    ///
    /// The kubelet needs the runtime socket, so the runtime always comes
    /// before the kubelet.
    pub fn get_daemons(&self) -> Result<Vec<Daemon>> {
        let aws = self
            .aws_config
            .clone()
            .ok_or_else(|| Error::Configuration("aws config not set".into()))?;
        Ok(vec![
            Daemon::Containerd(ContainerdDaemon::new(
                self.daemon_manager.clone(),
                self.node_config.clone(),
                aws.clone(),
                self.config.clone(),
                self.cancel.clone(),
            )),
            Daemon::Kubelet(KubeletDaemon::new(
                self.daemon_manager.clone(),
                self.node_config.clone(),
                aws,
                self.config.clone(),
                self.cancel.clone(),
            )),
        ])
    }

    /// Configures and starts every workload daemon in order.
    pub async fn start_daemons(&self) -> Result<()> {
        for daemon in self.get_daemons()? {
            daemon.configure().await?;
            daemon.ensure_running().await?;
        }
        Ok(())
    }

    /// Installs `component` from `source` and tracks it.
    pub async fn install(
        &self,
        tracker: &Tracker,
        component: Component,
        source: &mut Source,
    ) -> Result<()> {
        install(&self.cancel, tracker, component, source, &self.config).await
    }

    /// Stops and removes every tracked component, most recently installed first.
    pub async fn uninstall(&self, tracker: &Tracker) -> Result<()> {
        uninstall(self.daemon_manager.as_ref(), tracker, &self.config).await
    }

    fn ssm_daemon(&self) -> SsmDaemon {
        SsmDaemon::new(
            self.daemon_manager.clone(),
            self.node_config.clone(),
            self.executor.clone(),
            self.config.clone(),
            self.cancel.clone(),
        )
    }
}

/// Installs `component` from `source` and tracks it.
///
/// Installing needs no node configuration, so this is usable before a node
/// config exists on the host.
pub async fn install(
    cancel: &CancellationToken,
    tracker: &Tracker,
    component: Component,
    source: &mut Source,
    config: &Config,
) -> Result<()> {
    match component {
        Component::Containerd => daemon::containerd::install(cancel, tracker, source, config).await,
        Component::Kubelet => daemon::kubelet::install(cancel, tracker, source, config).await,
        Component::IamAuthenticator => {
            daemon::kubelet::install_authenticator(cancel, tracker, source, config).await
        }
        Component::Ssm => daemon::ssm::install(cancel, tracker, source, config).await,
        Component::IamRolesAnywhere => {
            iam_roles_anywhere::install(cancel, tracker, source, config).await
        }
    }
}

/// Stops and removes every tracked component, most recently installed first.
///
/// Components are untracked one at a time as they are removed, so a failed
/// uninstall can simply be run again.
pub async fn uninstall(
    manager: &dyn DaemonManager,
    tracker: &Tracker,
    config: &Config,
) -> Result<()> {
    let mut components = tracker.components().await?;
    components.reverse();
    for component in components {
        info!(%component, "Uninstalling component");
        if let Some(name) = daemon_name(component) {
            daemon::stop_if_present(manager, name).await?;
            if let Err(e) = manager.disable(name).await {
                warn!(daemon = name, error = %e, "Could not disable daemon");
            }
        }
        uninstall_component(component, config).await?;
        tracker.remove(component).await?;
    }
    manager.reload().await?;
    tracker.clear_if_empty().await
}

/// The components a node using `provider` needs, in installation order.
pub fn components_for(provider: ProviderKind) -> Vec<Component> {
    let credential = match provider {
        ProviderKind::Ssm => Component::Ssm,
        ProviderKind::IamRolesAnywhere => Component::IamRolesAnywhere,
    };
    vec![
        credential,
        Component::Containerd,
        Component::IamAuthenticator,
        Component::Kubelet,
    ]
}

fn daemon_name(component: Component) -> Option<&'static str> {
    match component {
        Component::Containerd => Some(daemon::containerd::DAEMON_NAME),
        Component::Kubelet => Some(daemon::kubelet::DAEMON_NAME),
        Component::Ssm => Some(daemon::ssm::DAEMON_NAME),
        Component::IamAuthenticator | Component::IamRolesAnywhere => None,
    }
}

async fn uninstall_component(component: Component, config: &Config) -> Result<()> {
    match component {
        Component::Containerd => daemon::containerd::uninstall(config).await,
        Component::Kubelet => daemon::kubelet::uninstall(config).await,
        Component::IamAuthenticator => daemon::kubelet::uninstall_authenticator(config).await,
        Component::Ssm => daemon::ssm::uninstall(config).await,
        Component::IamRolesAnywhere => iam_roles_anywhere::uninstall(config).await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::test::{iam_roles_anywhere_config, ssm_config};
    use crate::api::NodeConfig;
    use crate::daemon::fake::FakeDaemonManager;
    use crate::daemon::DaemonStatus;
    use crate::exec::fake::{exit, FakeExecutor};

    const UNITS: &[&str] = &[
        daemon::containerd::DAEMON_NAME,
        daemon::kubelet::DAEMON_NAME,
        daemon::ssm::DAEMON_NAME,
    ];

    struct Harness {
        _dir: tempfile::TempDir,
        config: Arc<Config>,
        manager: Arc<FakeDaemonManager>,
        executor: Arc<FakeExecutor>,
        provider: HybridNodeProvider,
    }

    fn harness(node: NodeConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::rooted_at(dir.path()));
        let record = config.ssm.registration_file.clone();
        let executor = Arc::new(FakeExecutor::new(move |_, _| {
            std::fs::create_dir_all(record.parent().unwrap()).unwrap();
            std::fs::write(&record, r#"{"ManagedInstanceID":"mi-42","Region":"us-west-2"}"#)
                .unwrap();
            exit(0, "")
        }));
        let manager = Arc::new(FakeDaemonManager::with_units(UNITS));
        let provider = HybridNodeProvider::new(
            node.into_shared(),
            manager.clone(),
            executor.clone(),
            config.clone(),
            CancellationToken::new(),
        );
        Harness {
            _dir: dir,
            config,
            manager,
            executor,
            provider,
        }
    }

    #[tokio::test]
    async fn get_daemons_requires_aws_config() {
        let h = harness(ssm_config());
        assert!(matches!(
            h.provider.get_daemons(),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn runtime_comes_before_kubelet() {
        for node in [ssm_config(), iam_roles_anywhere_config()] {
            let mut h = harness(node);
            h.provider.with_aws_config().await.unwrap();
            let names: Vec<_> = h
                .provider
                .get_daemons()
                .unwrap()
                .iter()
                .map(Daemon::name)
                .collect();
            assert_eq!(vec!["containerd", "kubelet"], names);
        }
    }

    #[tokio::test]
    async fn pre_process_registers_ssm_nodes() {
        let h = harness(ssm_config());
        let agent = &h.config.ssm.agent_binaries[0];
        std::fs::create_dir_all(agent.parent().unwrap()).unwrap();
        std::fs::write(agent, "").unwrap();

        h.provider.pre_process_daemon().await.unwrap();
        assert_eq!(
            Some("mi-42"),
            h.provider.node_config().read().await.node_name()
        );
        assert_eq!(
            DaemonStatus::Running,
            h.manager.status(daemon::ssm::DAEMON_NAME).await.unwrap()
        );

        h.provider.pre_process_daemon().await.unwrap();
        assert_eq!(1, h.executor.calls().len());
    }

    #[tokio::test]
    async fn pre_process_without_agent_leaves_node_unnamed() {
        let h = harness(ssm_config());
        assert!(matches!(
            h.provider.pre_process_daemon().await,
            Err(Error::AgentNotInstalled { .. })
        ));
        assert_eq!(None, h.provider.node_config().read().await.node_name());
        assert_eq!(
            DaemonStatus::Stopped,
            h.manager.status(daemon::ssm::DAEMON_NAME).await.unwrap()
        );
    }

    #[tokio::test]
    async fn pre_process_writes_certificate_credentials() {
        let h = harness(iam_roles_anywhere_config());
        h.provider.pre_process_daemon().await.unwrap();
        assert!(h.config.iam_roles_anywhere.aws_config_file.exists());
        assert!(h.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn uninstall_walks_tracker_in_reverse() {
        let mut h = harness(iam_roles_anywhere_config());
        let tracker = Tracker::new(&h.config.tracker_file);
        for component in [
            Component::IamRolesAnywhere,
            Component::Containerd,
            Component::Kubelet,
        ] {
            let mut source = Source::embedded(component.as_str(), b"binary");
            h.provider
                .install(&tracker, component, &mut source)
                .await
                .unwrap();
        }
        h.provider.pre_process_daemon().await.unwrap();
        h.provider.with_aws_config().await.unwrap();
        h.provider.start_daemons().await.unwrap();

        h.provider.uninstall(&tracker).await.unwrap();
        let stops: Vec<_> = h
            .manager
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("stop "))
            .collect();
        assert_eq!(vec!["stop kubelet", "stop containerd"], stops);
        assert!(!h.config.tracker_file.exists());
        assert!(!h.config.kubelet.binary.exists());
        assert!(!h.config.iam_roles_anywhere.signing_helper.exists());

        h.provider.uninstall(&tracker).await.unwrap();
    }

    #[test]
    fn credential_component_is_installed_first() {
        assert_eq!(
            vec![
                Component::Ssm,
                Component::Containerd,
                Component::IamAuthenticator,
                Component::Kubelet
            ],
            components_for(ProviderKind::Ssm)
        );
        assert_eq!(
            Component::IamRolesAnywhere,
            components_for(ProviderKind::IamRolesAnywhere)[0]
        );
    }

    #[tokio::test]
    async fn uninstall_tolerates_missing_units() {
        let h = harness(ssm_config());
        h.manager.units.lock().unwrap().clear();
        let tracker = Tracker::new(&h.config.tracker_file);
        let mut source = Source::embedded("kubelet", b"binary");
        h.provider
            .install(&tracker, Component::Kubelet, &mut source)
            .await
            .unwrap();
        h.provider.uninstall(&tracker).await.unwrap();
        assert!(tracker.components().await.unwrap().is_empty());
    }
}
