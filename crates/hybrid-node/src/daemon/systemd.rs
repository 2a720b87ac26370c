use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DaemonManager, DaemonStatus};
use crate::error::{Error, Result};
use crate::exec::{args, CommandExecutor, Output};

const SYSTEMCTL: &str = "/usr/bin/systemctl";

/// How systemctl reports a missing unit, with `{}` standing for the unit name.
const NOT_FOUND_TEMPLATES: &[&str] = &[
    "unit {} not found",
    "unit {} not loaded",
    "unit file {} does not exist",
];

/// A [`DaemonManager`] that drives systemd through `systemctl`.
#[derive(Clone)]
pub struct SystemdManager {
    executor: Arc<dyn CommandExecutor>,
    systemctl: PathBuf,
    cancel: CancellationToken,
}

impl SystemdManager {
    /// Creates a manager invoking the host's `systemctl`.
    pub fn new(executor: Arc<dyn CommandExecutor>, cancel: CancellationToken) -> Self {
        SystemdManager {
            executor,
            systemctl: PathBuf::from(SYSTEMCTL),
            cancel,
        }
    }

    /// Uses a different `systemctl` binary.
    pub fn with_systemctl(mut self, systemctl: impl Into<PathBuf>) -> Self {
        self.systemctl = systemctl.into();
        self
    }

    async fn systemctl(&self, action: &str, unit: Option<&str>, extra: &[&str]) -> Result<Output> {
        let mut argv = vec![action];
        argv.extend(unit);
        argv.extend_from_slice(extra);
        debug!(?argv, "Invoking systemctl");
        self.executor
            .run(&self.cancel, &self.systemctl, &args(argv))
            .await
    }

    async fn control(&self, action: &str, name: &str) -> Result<()> {
        let unit = unit_name(name);
        let output = self.systemctl(action, Some(unit.as_str()), &[]).await?;
        check(action, name, output)
    }
}

#[async_trait]
impl DaemonManager for SystemdManager {
    async fn start(&self, name: &str) -> Result<()> {
        self.control("start", name).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.control("stop", name).await
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.control("restart", name).await
    }

    async fn enable(&self, name: &str) -> Result<()> {
        self.control("enable", name).await
    }

    async fn disable(&self, name: &str) -> Result<()> {
        self.control("disable", name).await
    }

    async fn status(&self, name: &str) -> Result<DaemonStatus> {
        let unit = unit_name(name);
        let output = self
            .systemctl("show", Some(unit.as_str()), &["--property=LoadState,ActiveState"])
            .await?;
        let output = check_output("show", name, output)?;

        let mut load_state = "";
        let mut active_state = "";
        for line in output.stdout.lines() {
            match line.split_once('=') {
                Some(("LoadState", v)) => load_state = v.trim(),
                Some(("ActiveState", v)) => active_state = v.trim(),
                _ => {}
            }
        }
        if load_state == "not-found" {
            return Err(Error::DaemonNotFound {
                name: name.to_string(),
            });
        }
        Ok(parse_active_state(active_state))
    }

    async fn reload(&self) -> Result<()> {
        let output = self.systemctl("daemon-reload", None, &[]).await?;
        check("daemon-reload", "systemd", output)
    }
}

fn unit_name(name: &str) -> String {
    if name.ends_with(".service") {
        name.to_string()
    } else {
        format!("{}.service", name)
    }
}

fn parse_active_state(state: &str) -> DaemonStatus {
    match state {
        "active" => DaemonStatus::Running,
        "activating" | "reloading" => DaemonStatus::Activating,
        "inactive" | "deactivating" => DaemonStatus::Stopped,
        "failed" => DaemonStatus::Failed,
        _ => DaemonStatus::Unknown,
    }
}

fn check(action: &str, name: &str, output: Output) -> Result<()> {
    check_output(action, name, output).map(|_| ())
}

fn check_output(action: &str, name: &str, output: Output) -> Result<Output> {
    if output.success() {
        return Ok(output);
    }
    let combined = output.combined();
    if reports_missing_unit(&combined, name) {
        return Err(Error::DaemonNotFound {
            name: name.to_string(),
        });
    }
    Err(Error::DaemonControl {
        name: name.to_string(),
        action: action.to_string(),
        output: combined,
    })
}

/// Only messages naming this unit count, so a unit whose own process
/// reports "not found" is still a control failure.
fn reports_missing_unit(output: &str, name: &str) -> bool {
    let lowered = output.to_lowercase();
    let unit = unit_name(name).to_lowercase();
    NOT_FOUND_TEMPLATES
        .iter()
        .any(|t| lowered.contains(&t.replace("{}", &unit)))
}
