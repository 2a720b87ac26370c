//! Machine registration with the remote management service.
//!
//! Activations are single use, so registration always checks the agent's
//! own registration record first and only talks to the service when the
//! machine is not registered yet.
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::SharedNodeConfig;
use crate::config::SsmPaths;
use crate::error::{Error, Result};
use crate::exec::{args, CommandExecutor};

/// The registration record the agent writes once a machine is registered.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct HybridInstanceRegistration {
    /// Managed instance id assigned by the service, e.g. `mi-0123456789abcdef0`.
    #[serde(rename = "ManagedInstanceID")]
    pub managed_instance_id: String,
    /// Region the machine registered in.
    #[serde(rename = "Region", default)]
    pub region: String,
}

/// Read-only view of the agent's registration record.
#[derive(Clone, Debug)]
pub struct RegistrationRecord {
    path: PathBuf,
}

impl RegistrationRecord {
    /// The record at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        RegistrationRecord {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Reads the record. `None` when the machine has never registered.
    pub async fn read(&self) -> Result<Option<HybridInstanceRegistration>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("reading registration record", &self.path, e)),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let registration: HybridInstanceRegistration =
            serde_json::from_slice(&raw).map_err(|e| Error::Registration {
                message: format!("registration record {:?} is corrupt: {}", self.path, e),
            })?;
        if registration.managed_instance_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(registration))
    }

    /// Whether the machine already holds a managed instance identity.
    pub async fn is_registered(&self) -> Result<bool> {
        Ok(self.read().await?.is_some())
    }

    /// The managed instance id. Fails with [`Error::Registration`] when absent.
    pub async fn managed_instance_id(&self) -> Result<String> {
        match self.read().await {
            Ok(Some(registration)) => Ok(registration.managed_instance_id),
            Ok(None) => Err(Error::Registration {
                message: format!("no managed instance id recorded in {:?}", self.path),
            }),
            Err(e) => Err(Error::Registration {
                message: format!("querying managed instance id: {}", e),
            }),
        }
    }
}

/// Returns the first of `candidates` that exists.
pub async fn agent_binary_path(candidates: &[PathBuf]) -> Result<PathBuf> {
    for path in candidates {
        if tokio::fs::metadata(path).await.is_ok() {
            return Ok(path.clone());
        }
    }
    Err(Error::AgentNotInstalled {
        searched: candidates.to_vec(),
    })
}

/// Registers this machine with the remote management service and records
/// the managed instance id as the node name.
///
/// Safe to call repeatedly: once the agent holds a registration record no
/// further registration call is made. The node configuration is only
/// written to after every fallible step succeeded.
pub async fn register_machine(
    node_config: &SharedNodeConfig,
    paths: &SsmPaths,
    executor: &dyn CommandExecutor,
    cancel: &CancellationToken,
) -> Result<String> {
    let record = RegistrationRecord::new(&paths.registration_file);

    if record.is_registered().await? {
        info!("SSM agent already registered, skipping registration");
    } else {
        debug!("Machine not registered yet");
        let agent = agent_binary_path(&paths.agent_binaries).await?;
        let argv = {
            let node = node_config.read().await;
            let ssm = node
                .ssm()
                .ok_or_else(|| Error::Configuration("hybrid.ssm is not set".into()))?;
            args([
                "-register",
                "-y",
                "-region",
                node.spec.cluster.region.as_str(),
                "-code",
                ssm.activation_code.as_str(),
                "-id",
                ssm.activation_id.as_str(),
            ])
        };

        info!(?agent, "Registering machine with SSM agent");
        let output = executor.run(cancel, &agent, &argv).await?;
        if !output.success() {
            return Err(Error::Registration {
                message: format!(
                    "running register machine command (exit code {:?}): {}",
                    output.code,
                    output.combined()
                ),
            });
        }
        info!("Machine registered");
    }

    let instance_id = record.managed_instance_id().await?;
    info!(%instance_id, "Machine registered with SSM, assigning instance ID as node name");
    node_config.write().await.status.hybrid.node_name = Some(instance_id.clone());
    Ok(instance_id)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::test::ssm_config;
    use crate::config::Config;
    use crate::exec::fake::{exit, FakeExecutor};

    const RECORD: &str = r#"{"ManagedInstanceID":"mi-0123456789abcdef0","Region":"us-west-2"}"#;

    /// Agent stand-in that writes the registration record when invoked.
    fn registering_agent(record: PathBuf) -> FakeExecutor {
        FakeExecutor::new(move |_, _| {
            std::fs::create_dir_all(record.parent().unwrap()).unwrap();
            std::fs::write(&record, RECORD).unwrap();
            exit(0, "Successfully registered the instance")
        })
    }

    fn with_agent(config: &Config) -> SsmPaths {
        let agent = &config.ssm.agent_binaries[1];
        std::fs::create_dir_all(agent.parent().unwrap()).unwrap();
        std::fs::write(agent, "").unwrap();
        config.ssm.clone()
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let paths = with_agent(&config);
        let executor = registering_agent(paths.registration_file.clone());
        let cancel = CancellationToken::new();
        let node = ssm_config().into_shared();

        let first = register_machine(&node, &paths, &executor, &cancel).await.unwrap();
        let second = register_machine(&node, &paths, &executor, &cancel).await.unwrap();

        assert_eq!("mi-0123456789abcdef0", first);
        assert_eq!(first, second);
        assert_eq!(Some(first.as_str()), node.read().await.node_name());

        let calls = executor.calls();
        assert_eq!(1, calls.len(), "registration must run exactly once");
        assert_eq!(paths.agent_binaries[1], calls[0].0);
        assert_eq!(
            vec!["-register", "-y", "-region", "us-west-2", "-code", "code", "-id", "id"],
            calls[0].1
        );
    }

    #[tokio::test]
    async fn missing_agent_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let executor = FakeExecutor::succeeding();
        let cancel = CancellationToken::new();
        let node = ssm_config().into_shared();

        let result = register_machine(&node, &config.ssm, &executor, &cancel).await;
        match result {
            Err(Error::AgentNotInstalled { searched }) => {
                assert_eq!(config.ssm.agent_binaries, searched)
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(executor.calls().is_empty());
        assert_eq!(None, node.read().await.status.hybrid.node_name);
    }

    #[tokio::test]
    async fn failed_registration_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let paths = with_agent(&config);
        let executor = FakeExecutor::new(|_, _| exit(1, "ActivationExpired"));
        let cancel = CancellationToken::new();
        let node = ssm_config().into_shared();

        let result = register_machine(&node, &paths, &executor, &cancel).await;
        assert!(matches!(result, Err(Error::Registration { message }) if message.contains("ActivationExpired")));
        assert_eq!(None, node.read().await.status.hybrid.node_name);
    }

    #[tokio::test]
    async fn registered_without_record_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let paths = with_agent(&config);
        let executor = FakeExecutor::succeeding();
        let cancel = CancellationToken::new();
        let node = ssm_config().into_shared();

        let result = register_machine(&node, &paths, &executor, &cancel).await;
        assert!(matches!(result, Err(Error::Registration { .. })));
        assert_eq!(1, executor.calls().len());
    }

    #[tokio::test]
    async fn agent_lookup_prefers_earlier_paths() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::write(&first, "").unwrap();
        std::fs::write(&second, "").unwrap();
        let found = agent_binary_path(&[dir.path().join("missing"), first.clone(), second])
            .await
            .unwrap();
        assert_eq!(first, found);
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registration");
        std::fs::write(&path, "{not json").unwrap();
        let record = RegistrationRecord::new(&path);
        match record.is_registered().await {
            Err(Error::Registration { message }) => assert!(message.contains("corrupt")),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(
            record.read().await,
            Err(Error::Registration { .. })
        ));
    }
}
