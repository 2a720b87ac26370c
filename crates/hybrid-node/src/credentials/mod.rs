//! `credentials` decides how a hybrid node gets its cloud identity.
//!
//! There are exactly two ways: exchanging a one-time activation with the
//! remote management service ([`ssm`]), or trusting a node certificate
//! ([`iam_roles_anywhere`]). Both are variants of [`CredentialProvider`].
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::api::{HybridOptions, IamRolesAnywhere, NodeConfig, Ssm};
use crate::config::Config;
use crate::error::{Error, Result};

pub mod iam_roles_anywhere;
pub mod ssm;

pub use crate::api::ClusterDetails;

/// The AWS profile every generated credential file writes to.
pub const DEFAULT_PROFILE: &str = "default";

/// Identifies a credential provider variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Remote activation through the management agent.
    #[serde(rename = "ssm")]
    Ssm,
    /// Certificate trust through the signing helper.
    #[serde(rename = "iam-ra")]
    IamRolesAnywhere,
}

impl ProviderKind {
    /// The short name used on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ssm => "ssm",
            ProviderKind::IamRolesAnywhere => "iam-ra",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ssm" => Ok(ProviderKind::Ssm),
            "iam-ra" | "iam-roles-anywhere" => Ok(ProviderKind::IamRolesAnywhere),
            other => Err(Error::Configuration(format!(
                "unknown credential provider {:?}, expected ssm or iam-ra",
                other
            ))),
        }
    }
}

/// A source of cloud credentials for the node.
///
/// Each variant holds the out-of-band inputs it needs and can render the
/// node configuration that drives the rest of the lifecycle.
#[derive(Clone, Debug, PartialEq)]
pub enum CredentialProvider {
    /// Remote activation.
    Ssm(Ssm),
    /// Certificate trust.
    IamRolesAnywhere(IamRolesAnywhere),
}

impl CredentialProvider {
    /// Which variant this is.
    pub fn name(&self) -> ProviderKind {
        match self {
            CredentialProvider::Ssm(_) => ProviderKind::Ssm,
            CredentialProvider::IamRolesAnywhere(_) => ProviderKind::IamRolesAnywhere,
        }
    }

    /// Produces the node configuration joining `cluster` with this provider's credentials.
    pub fn nodeadm_config(&self, cluster: &ClusterDetails) -> Result<NodeConfig> {
        let hybrid = match self {
            CredentialProvider::Ssm(ssm) => HybridOptions {
                ssm: Some(ssm.clone()),
                iam_roles_anywhere: None,
            },
            CredentialProvider::IamRolesAnywhere(ira) => HybridOptions {
                ssm: None,
                iam_roles_anywhere: Some(ira.clone()),
            },
        };
        let config = NodeConfig::new(cluster.clone(), hybrid);
        config.validate()?;
        Ok(config)
    }

    /// The provider a node configuration asks for.
    pub fn from_node_config(node: &NodeConfig) -> Result<Self> {
        match node.provider_kind()? {
            ProviderKind::Ssm => node
                .ssm()
                .cloned()
                .map(CredentialProvider::Ssm)
                .ok_or_else(|| Error::Configuration("hybrid.ssm is not set".into())),
            ProviderKind::IamRolesAnywhere => node
                .iam_roles_anywhere()
                .cloned()
                .map(CredentialProvider::IamRolesAnywhere)
                .ok_or_else(|| Error::Configuration("hybrid.iamRolesAnywhere is not set".into())),
        }
    }
}

/// Where the daemons find the cloud credentials once identity is established.
///
/// Exported to containerd and the kubelet as environment variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwsConfig {
    /// Region API calls go to.
    pub region: String,
    /// Profile to read from the files below.
    pub profile: String,
    /// Shared credentials file, refreshed by the management agent.
    pub shared_credentials_file: Option<PathBuf>,
    /// Shared config file, holding a `credential_process` entry.
    pub config_file: Option<PathBuf>,
}

impl AwsConfig {
    /// The credential locations that go with the provider `node` is configured for.
    pub fn for_node(node: &NodeConfig, config: &Config) -> Result<Self> {
        let region = node.spec.cluster.region.clone();
        if region.is_empty() {
            return Err(Error::Configuration("cluster region is required".into()));
        }
        let (shared_credentials_file, config_file) = match node.provider_kind()? {
            ProviderKind::Ssm => (Some(config.ssm.credentials_file.clone()), None),
            ProviderKind::IamRolesAnywhere => {
                (None, Some(config.iam_roles_anywhere.aws_config_file.clone()))
            }
        };
        Ok(AwsConfig {
            region,
            profile: DEFAULT_PROFILE.to_string(),
            shared_credentials_file,
            config_file,
        })
    }

    /// `KEY=value` pairs for a daemon's environment, in a stable order.
    pub fn environment(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("AWS_REGION", self.region.clone()),
            ("AWS_PROFILE", self.profile.clone()),
        ];
        if let Some(path) = &self.shared_credentials_file {
            env.push(("AWS_SHARED_CREDENTIALS_FILE", path.display().to_string()));
        }
        if let Some(path) = &self.config_file {
            env.push(("AWS_CONFIG_FILE", path.display().to_string()));
        }
        env
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::test::{iam_roles_anywhere_config, ssm_config};

    #[test]
    fn provider_kind_round_trips_through_its_name() {
        for kind in [ProviderKind::Ssm, ProviderKind::IamRolesAnywhere] {
            assert_eq!(kind, kind.as_str().parse().unwrap());
        }
        assert!("tpm".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn nodeadm_config_carries_provider_fields() {
        let node = ssm_config();
        let provider = CredentialProvider::from_node_config(&node).unwrap();
        assert_eq!(ProviderKind::Ssm, provider.name());
        let rendered = provider.nodeadm_config(&node.spec.cluster).unwrap();
        assert_eq!(node, rendered);

        let node = iam_roles_anywhere_config();
        let provider = CredentialProvider::from_node_config(&node).unwrap();
        assert_eq!(ProviderKind::IamRolesAnywhere, provider.name());
        let rendered = provider.nodeadm_config(&node.spec.cluster).unwrap();
        assert_eq!(Some("hybrid-node-1"), rendered.node_name());
    }

    #[test]
    fn nodeadm_config_validates() {
        let provider = CredentialProvider::Ssm(Ssm {
            activation_code: String::new(),
            activation_id: "id".into(),
        });
        let cluster = ssm_config().spec.cluster;
        assert!(matches!(
            provider.nodeadm_config(&cluster),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn aws_config_points_at_provider_files() {
        let config = Config::rooted_at("/host");
        let ssm = AwsConfig::for_node(&ssm_config(), &config).unwrap();
        assert_eq!(
            vec![
                ("AWS_REGION", "us-west-2".to_string()),
                ("AWS_PROFILE", "default".to_string()),
                (
                    "AWS_SHARED_CREDENTIALS_FILE",
                    "/host/root/.aws/credentials".to_string()
                ),
            ],
            ssm.environment()
        );

        let ira = AwsConfig::for_node(&iam_roles_anywhere_config(), &config).unwrap();
        assert_eq!(
            Some(PathBuf::from("/host/eks-hybrid/.aws/config")),
            ira.config_file
        );
        assert_eq!(None, ira.shared_credentials_file);
    }
}
