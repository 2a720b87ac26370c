//! `artifact` fetches binaries and config files, writes them to the host and
//! checks their integrity.
//!
//! Writing, verifying and tracking are separate steps: a failed write is a
//! local disk or permission fault, a failed verification means the artifact
//! itself is corrupt, and only a component whose files were written *and*
//! verified is handed to the [`Tracker`](crate::tracker::Tracker).
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod install;
mod source;

pub use install::{install_component, install_file, install_verified, remove_path, write_file};
pub use source::{Algorithm, Checksum, Source};

/// A unit the tracker knows how to install and remove.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    /// The container runtime.
    Containerd,
    /// The kubelet.
    Kubelet,
    /// The exec credential plugin the kubelet authenticates with.
    IamAuthenticator,
    /// The remote management agent.
    Ssm,
    /// The certificate based credential signing helper.
    IamRolesAnywhere,
}

impl Component {
    /// The identifier persisted in the tracker file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Containerd => "containerd",
            Component::Kubelet => "kubelet",
            Component::IamAuthenticator => "iam-authenticator",
            Component::Ssm => "ssm",
            Component::IamRolesAnywhere => "iam-roles-anywhere",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "containerd" => Ok(Component::Containerd),
            "kubelet" => Ok(Component::Kubelet),
            "iam-authenticator" | "aws-iam-authenticator" => Ok(Component::IamAuthenticator),
            "ssm" | "amazon-ssm-agent" => Ok(Component::Ssm),
            "iam-roles-anywhere" | "iam-ra" => Ok(Component::IamRolesAnywhere),
            other => Err(crate::error::Error::Configuration(format!(
                "unknown component {:?}",
                other
            ))),
        }
    }
}
