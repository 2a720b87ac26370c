//! Errors surfaced by the node lifecycle core.
//!
//! Every variant carries enough context (component, daemon, path, node) to
//! diagnose a failure without the source at hand.
use std::path::PathBuf;

use thiserror::Error;

use crate::artifact::Component;

/// A result whose error is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the installer, tracker, daemon manager, credential
/// providers and node validator.
#[derive(Error, Debug)]
pub enum Error {
    /// A required field is missing or invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A filesystem operation failed.
    #[error("{context} ({path:?}): {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The path being operated on.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The bytes written for an artifact do not match the expected digest.
    #[error("checksum mismatch for {source_name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The expected digest.
        expected: String,
        /// The digest of the bytes actually written.
        actual: String,
        /// Name of the artifact source.
        source_name: String,
    },

    /// Fetching an artifact from the network failed.
    #[error("downloading {url}: {source}")]
    Download {
        /// The artifact URL.
        url: String,
        /// The underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },

    /// The named service unit does not exist on this host.
    #[error("daemon {name} not found")]
    DaemonNotFound {
        /// The service unit name.
        name: String,
    },

    /// The service supervision facility failed to carry out an action.
    #[error("{action} daemon {name} failed: {output}")]
    DaemonControl {
        /// The service unit name.
        name: String,
        /// The action that failed (start, stop, enable, ...).
        action: String,
        /// Captured stdout and stderr.
        output: String,
    },

    /// Registering the machine with the remote activation service failed.
    #[error("registration failed: {message}")]
    Registration {
        /// Description of the failed step, including any captured output.
        message: String,
    },

    /// The remote management agent binary is not present at any known path.
    #[error("remote management agent not found in any of the well known paths {searched:?}")]
    AgentNotInstalled {
        /// The paths that were searched, in order.
        searched: Vec<PathBuf>,
    },

    /// The node is still schedulable.
    #[error("node {node} is schedulable")]
    NodeSchedulable {
        /// The node name.
        node: String,
    },

    /// Pods that block a drain are still on the node.
    #[error("node {node} not drained, remaining pods: {}", remaining_pods.join(", "))]
    NodeNotDrained {
        /// The node name.
        node: String,
        /// `namespace/name` of every blocking pod.
        remaining_pods: Vec<String>,
    },

    /// A pod filter failed while computing the blocking pod set.
    #[error("running pod filter {filter}: {source}")]
    Filter {
        /// The filter that failed.
        filter: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A cluster API call failed.
    #[error("{context}: {source}")]
    Kube {
        /// What was being attempted.
        context: String,
        /// The underlying client error.
        #[source]
        source: kube::Error,
    },

    /// Encoding or decoding persisted state failed.
    #[error("{context}: {message}")]
    Serialization {
        /// What was being encoded or decoded.
        context: String,
        /// The parser or encoder message.
        message: String,
    },

    /// The caller cancelled the operation.
    #[error("{operation} canceled")]
    Canceled {
        /// The operation that was aborted.
        operation: String,
    },

    /// A wait ran past its deadline.
    #[error("timed out after {elapsed:?} waiting for {operation}")]
    Timeout {
        /// The condition being waited on.
        operation: String,
        /// How long was waited.
        elapsed: std::time::Duration,
    },

    /// A waited-on resource reached a terminal failure state.
    #[error("{operation} reached terminal state: {state}")]
    TerminalState {
        /// The condition being waited on.
        operation: String,
        /// The observed failure state.
        state: String,
    },

    /// A component was installed but could not be recorded in the tracker.
    #[error("{component} installed at {path:?} but not tracked: {source}")]
    Untracked {
        /// The installed component.
        component: Component,
        /// Where its artifact was written.
        path: PathBuf,
        /// The persistence failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn io(
        context: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Error::Io {
            context: context.into(),
            path: path.into(),
            source,
        }
    }

    pub(crate) fn kube(context: impl Into<String>, source: kube::Error) -> Self {
        Error::Kube {
            context: context.into(),
            source,
        }
    }
}
