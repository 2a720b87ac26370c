//! `validation` checks the live cluster state of this node before anything
//! destructive happens to it.
//!
//! All checks are read-only and make a single attempt; retrying after an
//! operator cordoned or drained the node is up to the caller.
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::error::ErrorResponse;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backoff::{poll_until, FixedBackoffStrategy, Check};
use crate::config::Config;
use crate::daemon::kubelet::hostname_override;
use crate::error::{Error, Result};

/// Annotation the kubelet puts on the API mirror of a static pod.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Narrows a set of pods down to the ones that still block a drain.
///
/// A filter only ever removes pods. The pipeline rejects a filter that
/// returns more pods than it was given.
#[async_trait]
pub trait PodFilter: Send + Sync {
    /// Name used in logs and in [`Error::Filter`].
    fn name(&self) -> &'static str;

    /// Returns the subset of `pods` this filter considers blocking.
    async fn filter(&self, pods: Vec<Pod>) -> Result<Vec<Pod>>;
}

/// Drops pods that already ran to completion.
#[derive(Clone, Debug, Default)]
pub struct CompletedPodFilter;

#[async_trait]
impl PodFilter for CompletedPodFilter {
    fn name(&self) -> &'static str {
        "completed"
    }

    async fn filter(&self, pods: Vec<Pod>) -> Result<Vec<Pod>> {
        Ok(pods
            .into_iter()
            .filter(|pod| {
                let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
                !matches!(phase, Some("Succeeded") | Some("Failed"))
            })
            .collect())
    }
}

/// Drops pods that are already being deleted.
#[derive(Clone, Debug, Default)]
pub struct TerminatingPodFilter;

#[async_trait]
impl PodFilter for TerminatingPodFilter {
    fn name(&self) -> &'static str {
        "terminating"
    }

    async fn filter(&self, pods: Vec<Pod>) -> Result<Vec<Pod>> {
        Ok(pods
            .into_iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .collect())
    }
}

/// Drops mirror pods of static pods; deleting them through the API does nothing.
#[derive(Clone, Debug, Default)]
pub struct MirrorPodFilter;

#[async_trait]
impl PodFilter for MirrorPodFilter {
    fn name(&self) -> &'static str {
        "mirror"
    }

    async fn filter(&self, pods: Vec<Pod>) -> Result<Vec<Pod>> {
        Ok(pods
            .into_iter()
            .filter(|pod| {
                !pod.metadata
                    .annotations
                    .as_ref()
                    .map(|a| a.contains_key(MIRROR_POD_ANNOTATION))
                    .unwrap_or(false)
            })
            .collect())
    }
}

/// Drops pods owned by a DaemonSet that still exists.
///
/// A pod whose DaemonSet is gone would not be recreated, so it still blocks.
#[derive(Clone)]
pub struct DaemonSetPodFilter {
    client: Client,
}

impl DaemonSetPodFilter {
    /// Looks DaemonSets up through `client`.
    pub fn new(client: Client) -> Self {
        DaemonSetPodFilter { client }
    }

    async fn owned_by_live_daemon_set(&self, pod: &Pod) -> Result<bool> {
        let owner = match pod
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.kind == "DaemonSet"))
        {
            Some(owner) => owner,
            None => return Ok(false),
        };
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let daemon_sets: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        match daemon_sets.get(&owner.name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => {
                debug!(daemon_set = %owner.name, %namespace, "Owning DaemonSet is gone");
                Ok(false)
            }
            Err(e) => Err(Error::kube(
                format!("getting DaemonSet {}/{}", namespace, owner.name),
                e,
            )),
        }
    }
}

#[async_trait]
impl PodFilter for DaemonSetPodFilter {
    fn name(&self) -> &'static str {
        "daemonset"
    }

    async fn filter(&self, pods: Vec<Pod>) -> Result<Vec<Pod>> {
        let mut blocking = Vec::with_capacity(pods.len());
        for pod in pods {
            if !self.owned_by_live_daemon_set(&pod).await? {
                blocking.push(pod);
            }
        }
        Ok(blocking)
    }
}

/// The built-in filters, cheapest first.
pub fn default_filters(client: Client) -> Vec<Box<dyn PodFilter>> {
    vec![
        Box::new(CompletedPodFilter),
        Box::new(TerminatingPodFilter),
        Box::new(MirrorPodFilter),
        Box::new(DaemonSetPodFilter::new(client)),
    ]
}

/// Runs `pods` through `filters` in order.
pub async fn run_filters(filters: &[Box<dyn PodFilter>], mut pods: Vec<Pod>) -> Result<Vec<Pod>> {
    for filter in filters {
        let before = pods.len();
        pods = filter.filter(pods).await.map_err(|e| Error::Filter {
            filter: filter.name(),
            source: Box::new(e),
        })?;
        if pods.len() > before {
            return Err(Error::Filter {
                filter: filter.name(),
                source: Box::new(Error::Configuration(format!(
                    "filter returned {} pods from {}",
                    pods.len(),
                    before
                ))),
            });
        }
        debug!(filter = filter.name(), before, after = pods.len(), "Applied pod filter");
    }
    Ok(pods)
}

/// Read-only checks of this node's state in the cluster.
pub struct NodeValidator {
    client: Client,
    node_name: String,
    filters: Vec<Box<dyn PodFilter>>,
}

impl NodeValidator {
    /// A validator for `node_name` using the built-in pod filters.
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        NodeValidator {
            filters: default_filters(client.clone()),
            client,
            node_name: node_name.into(),
        }
    }

    /// Replaces the pod filter pipeline.
    pub fn with_filters(mut self, filters: Vec<Box<dyn PodFilter>>) -> Self {
        self.filters = filters;
        self
    }

    /// A validator for the node running on this host, talking to the
    /// cluster with the kubelet's own kubeconfig.
    pub async fn for_host(config: &Config) -> Result<Self> {
        let node_name = host_node_name(config).await?;
        let kubeconfig = read_kubeconfig(&config.kubelet.kubeconfig).await?;
        let client_config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::Configuration(format!("loading kubelet kubeconfig: {}", e))
                })?;
        let client = Client::try_from(client_config)
            .map_err(|e| Error::Configuration(format!("creating cluster client: {}", e)))?;
        Ok(NodeValidator::new(client, node_name))
    }

    /// The node being validated.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Succeeds only when the node is cordoned.
    pub async fn is_unscheduled(&self, cancel: &CancellationToken) -> Result<()> {
        let node = self.get_node(cancel).await?;
        let unschedulable = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if !unschedulable {
            return Err(Error::NodeSchedulable {
                node: self.node_name.clone(),
            });
        }
        debug!(node = %self.node_name, "Node is unschedulable");
        Ok(())
    }

    /// Succeeds only when no pod that blocks a drain is left on the node.
    pub async fn is_drained(&self, cancel: &CancellationToken) -> Result<()> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let list = cancellable(cancel, "listing pods on node", pods.list(&params))
            .await?
            .map_err(|e| Error::kube(format!("listing pods on node {}", self.node_name), e))?;

        let remaining = cancellable(
            cancel,
            "filtering pods on node",
            run_filters(&self.filters, list.items),
        )
        .await??;
        if !remaining.is_empty() {
            return Err(Error::NodeNotDrained {
                node: self.node_name.clone(),
                remaining_pods: remaining.iter().map(pod_key).collect(),
            });
        }
        debug!(node = %self.node_name, "Node is drained");
        Ok(())
    }

    /// Waits for the node object to report `Ready=True`.
    pub async fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let operation = format!("node {} to be ready", self.node_name);
        poll_until(
            &operation,
            cancel,
            timeout,
            FixedBackoffStrategy::new(interval),
            move || async move {
                let node = self.get_node(cancel).await?;
                Ok(match ready_condition(&node) {
                    Some("True") => Check::Ready(()),
                    Some(status) => Check::Pending(format!("Ready={}", status)),
                    None => Check::Pending("no Ready condition".to_string()),
                })
            },
        )
        .await?;
        info!(node = %self.node_name, "Node is ready");
        Ok(())
    }

    async fn get_node(&self, cancel: &CancellationToken) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        cancellable(cancel, "getting node", nodes.get(&self.node_name))
            .await?
            .map_err(|e| Error::kube(format!("getting node {}", self.node_name), e))
    }
}

/// The name this host's kubelet registers under.
///
/// Read from the kubelet environment file; falls back to the host name when
/// the kubelet was never configured by this tool.
pub async fn host_node_name(config: &Config) -> Result<String> {
    let env_file = &config.kubelet.env_file;
    match tokio::fs::read_to_string(env_file).await {
        Ok(contents) => {
            if let Some(name) = hostname_override(&contents) {
                return Ok(name);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io("reading kubelet environment", env_file, e)),
    }
    let hostname = hostname::get()
        .map_err(|e| Error::io("reading host name", env_file, e))?
        .to_string_lossy()
        .trim()
        .to_lowercase();
    if hostname.is_empty() {
        return Err(Error::Configuration("host name is empty".into()));
    }
    Ok(hostname)
}

async fn read_kubeconfig(path: &Path) -> Result<Kubeconfig> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| Error::io("reading kubeconfig", path, e))?;
    serde_yaml::from_slice(&raw).map_err(|e| Error::Serialization {
        context: format!("parsing kubeconfig {:?}", path),
        message: e.to_string(),
    })
}

async fn cancellable<F, T>(cancel: &CancellationToken, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        result = fut => Ok(result),
        _ = cancel.cancelled() => Err(Error::Canceled {
            operation: operation.to_string(),
        }),
    }
}

fn ready_condition(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready")
        .map(|c| c.status.as_str())
}

fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}
