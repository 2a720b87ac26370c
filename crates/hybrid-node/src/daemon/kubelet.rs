//! The kubelet.
//!
//! Configuring the kubelet needs the node's name, so for remote activation
//! it can only happen after registration completed.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ensure_running, stop_if_present, DaemonManager};
use crate::api::{NodeConfig, SharedNodeConfig};
use crate::artifact::{install_component, remove_path, write_file, Component, Source};
use crate::config::Config;
use crate::credentials::AwsConfig;
use crate::error::{Error, Result};
use crate::tracker::Tracker;

/// The kubelet service unit.
pub const DAEMON_NAME: &str = "kubelet";

/// Environment variable the unit expands into the kubelet command line.
pub const ARGS_VARIABLE: &str = "NODEADM_KUBELET_ARGS";

const HOSTNAME_OVERRIDE_FLAG: &str = "--hostname-override=";
const HYBRID_NODE_LABEL: &str = "eks.amazonaws.com/compute-type=hybrid";
const CONTAINER_RUNTIME_ENDPOINT: &str = "unix:///run/containerd/containerd.sock";

const UNIT: &[u8] = include_bytes!("units/kubelet.service");

/// Writes the kubelet's configuration and controls its service.
pub struct KubeletDaemon {
    manager: Arc<dyn DaemonManager>,
    node_config: SharedNodeConfig,
    aws_config: AwsConfig,
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl KubeletDaemon {
    /// Creates the daemon.
    pub fn new(
        manager: Arc<dyn DaemonManager>,
        node_config: SharedNodeConfig,
        aws_config: AwsConfig,
        config: Arc<Config>,
        cancel: CancellationToken,
    ) -> Self {
        KubeletDaemon {
            manager,
            node_config,
            aws_config,
            config,
            cancel,
        }
    }

    /// Writes the cluster CA, `config.json`, the kubeconfig and the
    /// environment file carrying the kubelet arguments.
    pub async fn configure(&self) -> Result<()> {
        let node = self.node_config.read().await;
        let node_name = node.node_name().ok_or_else(|| {
            Error::Configuration(
                "node name is unknown, the machine must be registered before configuring the kubelet"
                    .into(),
            )
        })?;
        let paths = &self.config.kubelet;

        let ca = &node.spec.cluster.certificate_authority;
        if !ca.is_empty() {
            let decoded = base64::decode(ca.trim()).map_err(|e| {
                Error::Configuration(format!("cluster.certificateAuthority is not base64: {}", e))
            })?;
            write_file(&paths.ca_file, decoded, 0o644).await?;
        }

        let kubelet_config = kubelet_config(&node, &self.config)?;
        write_file(&paths.config_file, to_json(&kubelet_config)?, 0o644).await?;

        let kubeconfig = kubeconfig(&node, &self.config, &self.aws_config);
        write_file(&paths.kubeconfig, to_json(&kubeconfig)?, 0o600).await?;

        let env = environment_file(&node, node_name, &self.config, &self.aws_config);
        write_file(&paths.env_file, env, 0o644).await?;

        info!(node = node_name, "Configured kubelet");
        Ok(())
    }

    /// Starts the kubelet unless it is already running.
    pub async fn ensure_running(&self) -> Result<()> {
        ensure_running(
            self.manager.as_ref(),
            DAEMON_NAME,
            &self.cancel,
            self.config.daemon_start_timeout,
        )
        .await
    }

    /// Stops the kubelet.
    pub async fn stop(&self) -> Result<()> {
        stop_if_present(self.manager.as_ref(), DAEMON_NAME).await
    }
}

/// Installs the kubelet binary and its unit file.
pub async fn install(
    cancel: &CancellationToken,
    tracker: &Tracker,
    source: &mut Source,
    config: &Config,
) -> Result<()> {
    install_component(
        cancel,
        tracker,
        Component::Kubelet,
        &config.kubelet.binary,
        source,
        0o755,
    )
    .await?;
    // Only a tracked component gets a unit, so uninstall always finds it.
    write_file(config.unit_file(DAEMON_NAME), UNIT, 0o644).await
}

/// Installs the exec credential plugin the kubeconfig points the kubelet at.
pub async fn install_authenticator(
    cancel: &CancellationToken,
    tracker: &Tracker,
    source: &mut Source,
    config: &Config,
) -> Result<()> {
    install_component(
        cancel,
        tracker,
        Component::IamAuthenticator,
        &config.kubelet.authenticator,
        source,
        0o755,
    )
    .await
}

/// Removes the exec credential plugin.
pub async fn uninstall_authenticator(config: &Config) -> Result<()> {
    remove_path(&config.kubelet.authenticator).await
}

/// Removes everything [`install`] and [`KubeletDaemon::configure`] wrote.
pub async fn uninstall(config: &Config) -> Result<()> {
    let paths = &config.kubelet;
    remove_path(config.unit_file(DAEMON_NAME)).await?;
    for path in [
        &paths.env_file,
        &paths.kubeconfig,
        &paths.config_file,
        &paths.ca_file,
        &paths.binary,
    ] {
        remove_path(path).await?;
    }
    Ok(())
}

/// Extracts the node name from the contents of the kubelet environment file.
pub fn hostname_override(env_file: &str) -> Option<String> {
    env_file
        .split(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .find_map(|word| word.strip_prefix(HOSTNAME_OVERRIDE_FLAG))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// The cluster DNS address: the tenth address of the service CIDR, IPv4 or IPv6.
/// The CIDR needs at least four host bits to hold it.
fn cluster_dns(cidr: &str) -> Result<Option<IpAddr>> {
    if cidr.is_empty() {
        return Ok(None);
    }
    let invalid = || Error::Configuration(format!("cluster.cidr {:?} is not a valid CIDR", cidr));
    let (network, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    let dns = match network.parse::<IpAddr>().map_err(|_| invalid())? {
        IpAddr::V4(base) if prefix <= 28 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from((u32::from(base) & mask) + 10))
        }
        IpAddr::V6(base) if prefix <= 124 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from((u128::from(base) & mask) + 10))
        }
        _ => return Err(invalid()),
    };
    Ok(Some(dns))
}

fn kubelet_config(node: &NodeConfig, config: &Config) -> Result<Value> {
    let mut kubelet = json!({
        "kind": "KubeletConfiguration",
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "address": "0.0.0.0",
        "authentication": {
            "anonymous": { "enabled": false },
            "webhook": { "cacheTTL": "2m0s", "enabled": true },
            "x509": { "clientCAFile": config.kubelet.ca_file.display().to_string() }
        },
        "authorization": {
            "mode": "Webhook",
            "webhook": { "cacheAuthorizedTTL": "5m0s", "cacheUnauthorizedTTL": "30s" }
        },
        "cgroupDriver": "systemd",
        "cgroupRoot": "/",
        "clusterDomain": "cluster.local",
        "containerRuntimeEndpoint": CONTAINER_RUNTIME_ENDPOINT,
        "featureGates": { "RotateKubeletServerCertificate": true },
        "hairpinMode": "hairpin-veth",
        "readOnlyPort": 0,
        "serializeImagePulls": false,
        "serverTLSBootstrap": true
    });
    if let Some(dns) = cluster_dns(&node.spec.cluster.cidr)? {
        kubelet["clusterDNS"] = json!([dns.to_string()]);
    }
    if let Value::Object(fields) = &mut kubelet {
        for (key, value) in &node.spec.kubelet.config {
            debug!(%key, "Applying kubelet config override");
            fields.insert(key.clone(), value.clone());
        }
    }
    Ok(kubelet)
}

fn kubeconfig(node: &NodeConfig, config: &Config, aws: &AwsConfig) -> Value {
    let cluster = &node.spec.cluster;
    let env: Vec<Value> = aws
        .environment()
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "kubernetes",
            "cluster": {
                "certificate-authority": config.kubelet.ca_file.display().to_string(),
                "server": cluster.api_server_endpoint
            }
        }],
        "contexts": [{
            "name": "kubelet",
            "context": { "cluster": "kubernetes", "user": "kubelet" }
        }],
        "current-context": "kubelet",
        "users": [{
            "name": "kubelet",
            "user": {
                "exec": {
                    "apiVersion": "client.authentication.k8s.io/v1beta1",
                    "command": config.kubelet.authenticator.display().to_string(),
                    "args": ["token", "-i", cluster.name, "--region", cluster.region],
                    "env": env
                }
            }
        }]
    })
}

fn environment_file(node: &NodeConfig, node_name: &str, config: &Config, aws: &AwsConfig) -> String {
    let paths = &config.kubelet;
    let mut args = vec![
        format!("--config={}", paths.config_file.display()),
        format!("--kubeconfig={}", paths.kubeconfig.display()),
        format!("{}{}", HOSTNAME_OVERRIDE_FLAG, node_name),
        format!("--node-labels={}", HYBRID_NODE_LABEL),
        format!("--container-runtime-endpoint={}", CONTAINER_RUNTIME_ENDPOINT),
    ];
    args.extend(node.spec.kubelet.flags.iter().cloned());

    let mut env = format!("{}=\"{}\"\n", ARGS_VARIABLE, args.join(" "));
    for (key, value) in aws.environment() {
        env.push_str(&format!("{}={}\n", key, value));
    }
    env
}

fn to_json(value: &Value) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| Error::Serialization {
        context: "encoding kubelet configuration".into(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::test::{iam_roles_anywhere_config, ssm_config};
    use crate::daemon::fake::FakeDaemonManager;

    fn daemon(dir: &tempfile::TempDir, node: NodeConfig) -> KubeletDaemon {
        let config = Arc::new(Config::rooted_at(dir.path()));
        let aws = AwsConfig::for_node(&node, &config).unwrap();
        KubeletDaemon::new(
            Arc::new(FakeDaemonManager::with_units(&[DAEMON_NAME])),
            node.into_shared(),
            aws,
            config,
            CancellationToken::new(),
        )
    }

    #[test]
    fn cluster_dns_is_tenth_service_address() {
        assert_eq!(
            Some("172.16.0.10".parse().unwrap()),
            cluster_dns("172.16.0.0/16").unwrap()
        );
        assert_eq!(
            Some("10.100.0.10".parse().unwrap()),
            cluster_dns("10.100.0.0/16").unwrap()
        );
        assert_eq!(
            Some("fd00:10:96::a".parse().unwrap()),
            cluster_dns("fd00:10:96::/108").unwrap()
        );
        assert_eq!(None, cluster_dns("").unwrap());
        assert!(cluster_dns("172.16.0.0").is_err());
        assert!(cluster_dns("not-an-ip/16").is_err());
        assert!(cluster_dns("172.16.0.0/40").is_err());
        assert!(cluster_dns("172.16.0.0/30").is_err());
        assert_eq!(
            Some("192.168.0.10".parse().unwrap()),
            cluster_dns("192.168.0.7/28").unwrap()
        );
    }

    #[test]
    fn hostname_override_is_read_back() {
        let env = "NODEADM_KUBELET_ARGS=\"--config=/c --hostname-override=mi-1234 --node-labels=a=b\"\nAWS_REGION=us-west-2\n";
        assert_eq!(Some("mi-1234".to_string()), hostname_override(env));
        assert_eq!(None, hostname_override("AWS_REGION=us-west-2\n"));
        assert_eq!(None, hostname_override("X=\"--hostname-override=\"\n"));
    }

    #[tokio::test]
    async fn configure_requires_a_node_name() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon(&dir, ssm_config());
        assert!(matches!(
            daemon.configure().await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn configure_writes_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = ssm_config();
        node.status.hybrid.node_name = Some("mi-0123456789abcdef0".into());
        node.spec.kubelet.config.insert("maxPods".into(), json!(58));
        node.spec.kubelet.flags.push("--v=2".into());
        let daemon = daemon(&dir, node);
        daemon.configure().await.unwrap();
        let paths = &daemon.config.kubelet;

        assert_eq!(b"ca-data".to_vec(), tokio::fs::read(&paths.ca_file).await.unwrap());

        let raw = tokio::fs::read(&paths.config_file).await.unwrap();
        let kubelet: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json!(["172.16.0.10"]), kubelet["clusterDNS"]);
        assert_eq!(json!(58), kubelet["maxPods"]);
        assert_eq!(json!("systemd"), kubelet["cgroupDriver"]);

        let raw = tokio::fs::read(&paths.kubeconfig).await.unwrap();
        let kubeconfig: kube::config::Kubeconfig = serde_yaml::from_slice(&raw).unwrap();
        let exec = kubeconfig.auth_infos[0]
            .auth_info
            .exec
            .as_ref()
            .unwrap();
        assert_eq!(paths.authenticator.display().to_string(), exec.command);
        assert_eq!(
            Some(vec![
                "token".to_string(),
                "-i".into(),
                "hybrid-cluster".into(),
                "--region".into(),
                "us-west-2".into()
            ]),
            exec.args
        );

        let env = tokio::fs::read_to_string(&paths.env_file).await.unwrap();
        assert_eq!(Some("mi-0123456789abcdef0".to_string()), hostname_override(&env));
        assert!(env.contains("--node-labels=eks.amazonaws.com/compute-type=hybrid"));
        assert!(env.contains(" --v=2\""));
        assert!(env.contains("AWS_SHARED_CREDENTIALS_FILE="));
    }

    #[tokio::test]
    async fn certificate_nodes_use_configured_name() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon(&dir, iam_roles_anywhere_config());
        daemon.configure().await.unwrap();
        let env = tokio::fs::read_to_string(&daemon.config.kubelet.env_file)
            .await
            .unwrap();
        assert_eq!(Some("hybrid-node-1".to_string()), hostname_override(&env));
        assert!(env.contains("AWS_CONFIG_FILE="));
        assert!(!daemon.config.kubelet.ca_file.exists());
    }

    #[tokio::test]
    async fn install_and_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let tracker = Tracker::new(&config.tracker_file);
        let cancel = CancellationToken::new();
        let mut source = Source::embedded("kubelet", b"kubelet-binary");
        install(&cancel, &tracker, &mut source, &config).await.unwrap();
        assert!(tracker.has(Component::Kubelet).await.unwrap());
        assert!(config.unit_file(DAEMON_NAME).exists());

        uninstall(&config).await.unwrap();
        assert!(!config.kubelet.binary.exists());
        assert!(!config.unit_file(DAEMON_NAME).exists());
    }

    #[tokio::test]
    async fn tampered_artifact_leaves_no_unit_behind() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let tracker = Tracker::new(&config.tracker_file);
        let mut source = Source::from_bytes(
            "kubelet",
            b"tampered".to_vec(),
            crate::artifact::Checksum::sha256_of(b"genuine"),
        );
        let result = install(&CancellationToken::new(), &tracker, &mut source, &config).await;
        assert!(matches!(
            result,
            Err(crate::error::Error::ChecksumMismatch { .. })
        ));
        assert!(!config.unit_file(DAEMON_NAME).exists());
        assert!(!config.kubelet.binary.exists());
        assert!(!tracker.has(Component::Kubelet).await.unwrap());
    }

    #[tokio::test]
    async fn authenticator_is_installed_where_the_kubeconfig_points() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let tracker = Tracker::new(&config.tracker_file);
        let mut source = Source::from_bytes(
            "iam-authenticator",
            b"authenticator".to_vec(),
            crate::artifact::Checksum::sha256_of(b"authenticator"),
        );
        install_authenticator(&CancellationToken::new(), &tracker, &mut source, &config)
            .await
            .unwrap();
        assert!(config.kubelet.authenticator.exists());
        assert!(tracker.has(Component::IamAuthenticator).await.unwrap());

        uninstall_authenticator(&config).await.unwrap();
        assert!(!config.kubelet.authenticator.exists());
    }
}
