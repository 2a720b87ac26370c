//! `api` holds the desired-state description of a hybrid node.
//!
//! A [`NodeConfig`] is loaded once per invocation, handed to the credential
//! provider and daemons by reference, and written to exactly once: when
//! registration assigns the node its name.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::credentials::ProviderKind;
use crate::error::{Error, Result};

/// The `apiVersion` every node configuration document carries.
pub const API_VERSION: &str = "node.eks.aws/v1alpha1";
/// The `kind` every node configuration document carries.
pub const KIND: &str = "NodeConfig";

/// A node configuration shared between the registration step, which writes
/// the node name, and the daemons, which only read.
pub type SharedNodeConfig = Arc<RwLock<NodeConfig>>;

/// The full desired state of this node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Schema version of the document.
    pub api_version: String,
    /// Document kind.
    pub kind: String,
    /// What the operator asked for.
    pub spec: NodeConfigSpec,
    /// What this agent discovered while acting on the configuration.
    #[serde(default)]
    pub status: NodeConfigStatus,
}

/// Desired state of the node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigSpec {
    /// Control plane the node joins.
    pub cluster: ClusterDetails,
    /// How the node obtains cloud credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hybrid: Option<HybridOptions>,
    /// Kubelet overrides.
    #[serde(default)]
    pub kubelet: KubeletOptions,
    /// Container runtime overrides.
    #[serde(default)]
    pub containerd: ContainerdOptions,
}

/// Connection details of the managed control plane.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetails {
    /// Cluster name.
    pub name: String,
    /// Cloud region the cluster lives in.
    pub region: String,
    /// API server URL.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_server_endpoint: String,
    /// Base64 encoded cluster CA bundle.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate_authority: String,
    /// Service CIDR; the cluster DNS address is derived from it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cidr: String,
}

/// Credential provider sub-configuration. Exactly one field must be set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridOptions {
    /// Remote activation based identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssm: Option<Ssm>,
    /// Certificate based identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_roles_anywhere: Option<IamRolesAnywhere>,
}

/// An activation issued by the remote management service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ssm {
    /// One-time activation code.
    pub activation_code: String,
    /// Activation identifier.
    #[serde(rename = "activationID")]
    pub activation_id: String,
}

/// Trust configuration for certificate based credentials.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamRolesAnywhere {
    /// Name the node registers under; also the role session name.
    pub node_name: String,
    /// ARN of the trust anchor that signed the node certificate.
    #[serde(rename = "trustAnchorARN")]
    pub trust_anchor_arn: String,
    /// ARN of the roles-anywhere profile.
    #[serde(rename = "profileARN")]
    pub profile_arn: String,
    /// ARN of the role to assume.
    #[serde(rename = "roleARN")]
    pub role_arn: String,
    /// Node certificate; defaults to the well-known location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<PathBuf>,
    /// Node private key; defaults to the well-known location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
}

/// Kubelet settings layered over the generated defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeletOptions {
    /// KubeletConfiguration fields merged over the defaults.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Extra command line flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

/// Container runtime settings layered over the generated defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerdOptions {
    /// Raw TOML appended to the generated configuration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config: String,
}

/// Facts recorded while acting on the configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigStatus {
    /// Hybrid specific status.
    #[serde(default)]
    pub hybrid: HybridStatus,
}

/// Status produced by the registration step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridStatus {
    /// Node name assigned by registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl NodeConfig {
    /// Builds a configuration document for `cluster` with the given hybrid options.
    pub fn new(cluster: ClusterDetails, hybrid: HybridOptions) -> Self {
        NodeConfig {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            spec: NodeConfigSpec {
                cluster,
                hybrid: Some(hybrid),
                ..Default::default()
            },
            status: NodeConfigStatus::default(),
        }
    }

    /// Reads a YAML or JSON node configuration from `path` and validates it.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| Error::io("reading node configuration", path, e))?;
        let config: NodeConfig =
            serde_yaml::from_slice(&raw).map_err(|e| Error::Serialization {
                context: format!("parsing node configuration {:?}", path),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Wraps the configuration for sharing with daemons.
    pub fn into_shared(self) -> SharedNodeConfig {
        Arc::new(RwLock::new(self))
    }

    /// Checks required fields and that exactly one credential provider is configured.
    pub fn validate(&self) -> Result<()> {
        if self.api_version != API_VERSION {
            return Err(Error::Configuration(format!(
                "unsupported apiVersion {:?}, expected {}",
                self.api_version, API_VERSION
            )));
        }
        if self.kind != KIND {
            return Err(Error::Configuration(format!(
                "unsupported kind {:?}, expected {}",
                self.kind, KIND
            )));
        }
        let cluster = &self.spec.cluster;
        if cluster.name.is_empty() {
            return Err(Error::Configuration("cluster name is required".into()));
        }
        if cluster.region.is_empty() {
            return Err(Error::Configuration("cluster region is required".into()));
        }
        match self.provider_kind()? {
            ProviderKind::Ssm => {
                let ssm = self.ssm().ok_or_else(missing_provider)?;
                require("ssm.activationCode", &ssm.activation_code)?;
                require("ssm.activationID", &ssm.activation_id)?;
            }
            ProviderKind::IamRolesAnywhere => {
                let ira = self.iam_roles_anywhere().ok_or_else(missing_provider)?;
                require("iamRolesAnywhere.nodeName", &ira.node_name)?;
                require("iamRolesAnywhere.trustAnchorARN", &ira.trust_anchor_arn)?;
                require("iamRolesAnywhere.profileARN", &ira.profile_arn)?;
                require("iamRolesAnywhere.roleARN", &ira.role_arn)?;
            }
        }
        Ok(())
    }

    /// The credential provider this node is configured for.
    pub fn provider_kind(&self) -> Result<ProviderKind> {
        match (self.ssm(), self.iam_roles_anywhere()) {
            (Some(_), None) => Ok(ProviderKind::Ssm),
            (None, Some(_)) => Ok(ProviderKind::IamRolesAnywhere),
            (Some(_), Some(_)) => Err(Error::Configuration(
                "only one of hybrid.ssm and hybrid.iamRolesAnywhere may be set".into(),
            )),
            (None, None) => Err(missing_provider()),
        }
    }

    /// Whether identity is established by the remote management agent.
    pub fn is_ssm(&self) -> bool {
        self.ssm().is_some()
    }

    /// Whether identity is established by certificate trust.
    pub fn is_iam_roles_anywhere(&self) -> bool {
        self.iam_roles_anywhere().is_some()
    }

    /// The SSM activation, if configured.
    pub fn ssm(&self) -> Option<&Ssm> {
        self.spec.hybrid.as_ref()?.ssm.as_ref()
    }

    /// The IAM Roles Anywhere trust configuration, if configured.
    pub fn iam_roles_anywhere(&self) -> Option<&IamRolesAnywhere> {
        self.spec.hybrid.as_ref()?.iam_roles_anywhere.as_ref()
    }

    /// The name the kubelet registers the node under.
    ///
    /// For SSM this is only known after registration.
    pub fn node_name(&self) -> Option<&str> {
        if let Some(ira) = self.iam_roles_anywhere() {
            return Some(ira.node_name.as_str());
        }
        self.status.hybrid.node_name.as_deref()
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Configuration(format!("{} is required", field)));
    }
    Ok(())
}

fn missing_provider() -> Error {
    Error::Configuration(
        "one of hybrid.ssm or hybrid.iamRolesAnywhere must be configured".into(),
    )
}
