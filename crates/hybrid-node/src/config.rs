//! Runtime configuration for the node agent.
//!
//! Every well-known host path lives here instead of in process-wide state, so
//! a whole install can be redirected under another directory with
//! [`Config::rooted_at`]. The best way to build one is [`Config::default_config`]
//! or, with the "cli" feature, [`Config::from_opts`].
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

const TRACKER_FILE: &str = "/opt/nodeadm/tracker";
const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

const CONTAINERD_BINARY: &str = "/usr/bin/containerd";
const CONTAINERD_CONFIG: &str = "/etc/containerd/config.toml";

const KUBELET_BINARY: &str = "/usr/bin/kubelet";
const KUBELET_CONFIG: &str = "/etc/kubernetes/kubelet/config.json";
const KUBELET_KUBECONFIG: &str = "/var/lib/kubelet/kubeconfig";
const KUBELET_ENV_FILE: &str = "/etc/eks/kubelet/environment";
const KUBELET_CA_FILE: &str = "/etc/kubernetes/pki/ca.crt";
const IAM_AUTHENTICATOR_BINARY: &str = "/usr/local/bin/aws-iam-authenticator";

const SSM_AGENT_BINARIES: &[&str] = &[
    "/usr/bin/amazon-ssm-agent",
    "/snap/amazon-ssm-agent/current/amazon-ssm-agent",
];
const SSM_REGISTRATION_FILE: &str = "/var/lib/amazon/ssm/registration";

const SIGNING_HELPER_BINARY: &str = "/usr/local/bin/aws_signing_helper";
const HYBRID_AWS_CONFIG: &str = "/eks-hybrid/.aws/config";
const DEFAULT_CERTIFICATE: &str = "/etc/iam/pki/server.pem";
const DEFAULT_PRIVATE_KEY: &str = "/etc/iam/pki/server.key";

const DEFAULT_DAEMON_START_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_NODE_READY_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Paths and timings used by installers, daemons and providers.
#[derive(Clone, Debug)]
pub struct Config {
    /// The directory every path below is relative to (`/` on a real host).
    pub root: PathBuf,
    /// Where the installation tracker persists its state.
    pub tracker_file: PathBuf,
    /// Where systemd unit files are written.
    pub systemd_unit_dir: PathBuf,
    /// Container runtime paths.
    pub containerd: ContainerdPaths,
    /// Kubelet paths.
    pub kubelet: KubeletPaths,
    /// Remote management agent paths.
    pub ssm: SsmPaths,
    /// Certificate based credential paths.
    pub iam_roles_anywhere: IamRolesAnywherePaths,
    /// How long `ensure_running` waits for a daemon to become active.
    pub daemon_start_timeout: Duration,
    /// How long to wait for the node object to report Ready.
    pub node_ready_timeout: Duration,
    /// Interval between polls of remote state.
    pub poll_interval: Duration,
}

/// Container runtime paths.
#[derive(Clone, Debug)]
pub struct ContainerdPaths {
    /// The containerd binary.
    pub binary: PathBuf,
    /// containerd's `config.toml`.
    pub config_file: PathBuf,
}

/// Kubelet paths.
#[derive(Clone, Debug)]
pub struct KubeletPaths {
    /// The kubelet binary.
    pub binary: PathBuf,
    /// KubeletConfiguration document.
    pub config_file: PathBuf,
    /// kubeconfig the kubelet (and the node validator) talk to the cluster with.
    pub kubeconfig: PathBuf,
    /// Environment file holding the kubelet arguments.
    pub env_file: PathBuf,
    /// Cluster CA bundle.
    pub ca_file: PathBuf,
    /// Exec credential plugin named in the kubeconfig.
    pub authenticator: PathBuf,
}

/// Remote management agent paths.
#[derive(Clone, Debug)]
pub struct SsmPaths {
    /// Ordered list of places the agent binary may be installed to.
    pub agent_binaries: Vec<PathBuf>,
    /// The agent's own registration record.
    pub registration_file: PathBuf,
    /// Shared credentials file the agent keeps refreshed.
    pub credentials_file: PathBuf,
}

/// Certificate based credential paths.
#[derive(Clone, Debug)]
pub struct IamRolesAnywherePaths {
    /// The signing helper binary.
    pub signing_helper: PathBuf,
    /// AWS shared config file with the `credential_process` entry.
    pub aws_config_file: PathBuf,
    /// Node certificate used when the node config does not name one.
    pub default_certificate: PathBuf,
    /// Node private key used when the node config does not name one.
    pub default_private_key: PathBuf,
}

impl Config {
    /// Returns a Config set with the defaults for a real host.
    pub fn default_config() -> Self {
        Self::rooted_at("/")
    }

    /// Returns the default Config with every path rebased under `root`.
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        let at = |p: &str| rebase(root, p);
        Config {
            root: root.to_path_buf(),
            tracker_file: at(TRACKER_FILE),
            systemd_unit_dir: at(SYSTEMD_UNIT_DIR),
            containerd: ContainerdPaths {
                binary: at(CONTAINERD_BINARY),
                config_file: at(CONTAINERD_CONFIG),
            },
            kubelet: KubeletPaths {
                binary: at(KUBELET_BINARY),
                config_file: at(KUBELET_CONFIG),
                kubeconfig: at(KUBELET_KUBECONFIG),
                env_file: at(KUBELET_ENV_FILE),
                ca_file: at(KUBELET_CA_FILE),
                authenticator: at(IAM_AUTHENTICATOR_BINARY),
            },
            ssm: SsmPaths {
                agent_binaries: SSM_AGENT_BINARIES.iter().map(|p| at(p)).collect(),
                registration_file: at(SSM_REGISTRATION_FILE),
                credentials_file: default_ssm_credentials_file(root),
            },
            iam_roles_anywhere: IamRolesAnywherePaths {
                signing_helper: at(SIGNING_HELPER_BINARY),
                aws_config_file: at(HYBRID_AWS_CONFIG),
                default_certificate: at(DEFAULT_CERTIFICATE),
                default_private_key: at(DEFAULT_PRIVATE_KEY),
            },
            daemon_start_timeout: DEFAULT_DAEMON_START_TIMEOUT,
            node_ready_timeout: DEFAULT_NODE_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Path of the systemd unit file for `unit`.
    pub fn unit_file(&self, unit: &str) -> PathBuf {
        self.systemd_unit_dir.join(format!("{}.service", unit))
    }

    /// Path of the drop-in directory for `unit`.
    pub fn unit_drop_in_dir(&self, unit: &str) -> PathBuf {
        self.systemd_unit_dir.join(format!("{}.service.d", unit))
    }

    /// Builds a config from parsed command line options.
    #[cfg(feature = "cli")]
    pub fn from_opts(opts: &Opts) -> Self {
        let mut config = match &opts.root {
            Some(root) => Config::rooted_at(root),
            None => Config::default_config(),
        };
        if let Some(tracker_file) = &opts.tracker_file {
            config.tracker_file = tracker_file.clone();
        }
        config.daemon_start_timeout = Duration::from_secs(opts.daemon_start_timeout);
        config.node_ready_timeout = Duration::from_secs(opts.node_ready_timeout);
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// CLI options that adjust the runtime [`Config`].
#[derive(StructOpt, Clone, Debug)]
#[cfg(feature = "cli")]
pub struct Opts {
    #[structopt(
        long = "root",
        env = "NODEADM_ROOT",
        help = "Directory all host paths are relative to"
    )]
    root: Option<PathBuf>,

    #[structopt(
        long = "tracker-file",
        env = "NODEADM_TRACKER_FILE",
        help = "Where the record of installed components is kept"
    )]
    tracker_file: Option<PathBuf>,

    #[structopt(
        long = "daemon-start-timeout",
        default_value = "60",
        help = "Seconds to wait for a daemon to become active"
    )]
    daemon_start_timeout: u64,

    #[structopt(
        long = "node-ready-timeout",
        default_value = "300",
        help = "Seconds to wait for the node to report Ready"
    )]
    node_ready_timeout: u64,
}

fn rebase(root: &Path, absolute: &str) -> PathBuf {
    root.join(absolute.trim_start_matches('/'))
}

fn default_ssm_credentials_file(root: &Path) -> PathBuf {
    let home = if root == Path::new("/") {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"))
    } else {
        rebase(root, "/root")
    };
    home.join(".aws").join("credentials")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rooted_config_rebases_every_path() {
        let config = Config::rooted_at("/tmp/host");
        assert_eq!(PathBuf::from("/tmp/host/opt/nodeadm/tracker"), config.tracker_file);
        assert_eq!(
            PathBuf::from("/tmp/host/usr/local/bin/aws_signing_helper"),
            config.iam_roles_anywhere.signing_helper
        );
        assert_eq!(
            PathBuf::from("/tmp/host/root/.aws/credentials"),
            config.ssm.credentials_file
        );
        assert!(config
            .ssm
            .agent_binaries
            .iter()
            .all(|p| p.starts_with("/tmp/host")));
    }

    #[test]
    fn agent_paths_keep_their_order() {
        let config = Config::default_config();
        assert_eq!(
            vec![
                PathBuf::from("/usr/bin/amazon-ssm-agent"),
                PathBuf::from("/snap/amazon-ssm-agent/current/amazon-ssm-agent"),
            ],
            config.ssm.agent_binaries
        );
    }

    #[test]
    fn unit_paths() {
        let config = Config::default_config();
        assert_eq!(
            PathBuf::from("/etc/systemd/system/kubelet.service"),
            config.unit_file("kubelet")
        );
        assert_eq!(
            PathBuf::from("/etc/systemd/system/containerd.service.d"),
            config.unit_drop_in_dir("containerd")
        );
    }
}
