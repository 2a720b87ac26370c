//! The lifecycle core for joining non-cloud ("hybrid") machines to a managed
//! Kubernetes control plane.
//!
//! A run of the node agent loads a [`NodeConfig`], lets the configured
//! credential provider establish the machine's identity, installs and starts
//! the node's daemons through a [`DaemonManager`], and records every
//! installed component in a [`Tracker`] so that uninstall can undo exactly
//! what was done. Before anything destructive, [`NodeValidator`] checks that
//! the node is cordoned and drained.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use hybrid_node::{Config, HostExecutor, HybridNodeProvider, NodeConfig, SystemdManager};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> hybrid_node::Result<()> {
//!     let cancel = CancellationToken::new();
//!     let executor = Arc::new(HostExecutor);
//!     let manager = Arc::new(SystemdManager::new(executor.clone(), cancel.clone()));
//!     let node = NodeConfig::load("/etc/nodeadm/config.yaml").await?;
//!
//!     let mut provider = HybridNodeProvider::new(
//!         node.into_shared(),
//!         manager,
//!         executor,
//!         Arc::new(Config::default_config()),
//!         cancel,
//!     );
//!     provider.pre_process_daemon().await?;
//!     provider.with_aws_config().await?;
//!     provider.start_daemons().await
//! }
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod artifact;
pub mod backoff;
pub mod config;
pub mod credentials;
pub mod daemon;
mod error;
pub mod exec;
pub mod hybrid;
pub mod tracker;
pub mod validation;

pub use self::error::{Error, Result};

#[doc(inline)]
pub use api::NodeConfig;
#[doc(inline)]
pub use artifact::{Component, Source};
#[doc(inline)]
pub use config::Config;
#[doc(inline)]
pub use credentials::{CredentialProvider, ProviderKind};
#[doc(inline)]
pub use daemon::{Daemon, DaemonManager, SystemdManager};
#[doc(inline)]
pub use exec::{CommandExecutor, HostExecutor};
#[doc(inline)]
pub use hybrid::HybridNodeProvider;
#[doc(inline)]
pub use tracker::Tracker;
#[doc(inline)]
pub use validation::NodeValidator;
