use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hybrid_node::config::Opts;
use hybrid_node::hybrid::{self, components_for};
use hybrid_node::{
    Config, HostExecutor, HybridNodeProvider, NodeConfig, NodeValidator, ProviderKind,
    Source, SystemdManager, Tracker,
};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "nodeadm",
    about = "Joins this machine to a managed Kubernetes cluster as a hybrid node"
)]
struct Cli {
    #[structopt(flatten)]
    opts: Opts,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Install the node's components and record them for uninstall
    Install {
        #[structopt(
            short = "p",
            long = "credential-provider",
            help = "Credential provider: ssm or iam-ra"
        )]
        credential_provider: ProviderKind,

        #[structopt(
            long = "source-dir",
            help = "Directory holding <component> artifacts with <component>.sha256 sidecars",
            conflicts_with = "url"
        )]
        source_dir: Option<PathBuf>,

        #[structopt(
            long = "url",
            help = "Base URL serving <component> artifacts with <component>.sha256 sidecars"
        )]
        url: Option<url::Url>,
    },
    /// Establish node credentials and start the node's daemons
    Init {
        #[structopt(short = "c", long = "config-source", help = "Path to the NodeConfig document")]
        config_source: PathBuf,

        #[structopt(long = "wait-for-ready", help = "Wait for the node to report Ready")]
        wait_for_ready: bool,
    },
    /// Stop and remove everything `install` put on this host
    Uninstall {
        #[structopt(
            long = "skip",
            use_delimiter = true,
            possible_values = &["node-validation", "pod-validation"],
            help = "Validations to skip before uninstalling"
        )]
        skip: Vec<String>,
    },
    /// Check that the node is cordoned and drained
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::from_args();
    let config = Arc::new(Config::from_opts(&cli.opts));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Install {
            credential_provider,
            source_dir,
            url,
        } => install(&cancel, &config, credential_provider, source_dir, url).await,
        Command::Init {
            config_source,
            wait_for_ready,
        } => init(&cancel, config, config_source, wait_for_ready).await,
        Command::Uninstall { skip } => uninstall(&cancel, &config, &skip).await,
        Command::Validate => {
            let validator = NodeValidator::for_host(&config).await?;
            validator.is_unscheduled(&cancel).await?;
            validator.is_drained(&cancel).await?;
            info!(node = validator.node_name(), "Node is cordoned and drained");
            Ok(())
        }
    }
}

async fn install(
    cancel: &CancellationToken,
    config: &Config,
    provider: ProviderKind,
    source_dir: Option<PathBuf>,
    url: Option<url::Url>,
) -> anyhow::Result<()> {
    let tracker = Tracker::new(&config.tracker_file);
    let client = reqwest::Client::new();
    for component in components_for(provider) {
        let mut source = match (&source_dir, &url) {
            (Some(dir), _) => Source::open_with_sidecar(dir.join(component.as_str())).await?,
            (None, Some(base)) => {
                let url = base
                    .join(component.as_str())
                    .with_context(|| format!("building artifact URL for {}", component))?;
                Source::download(&client, &url, None).await?
            }
            (None, None) => anyhow::bail!("one of --source-dir or --url is required"),
        };
        hybrid::install(cancel, &tracker, component, &mut source, config)
            .await
            .with_context(|| format!("installing {}", component))?;
    }
    info!(provider = %provider, "Install complete");
    Ok(())
}

async fn init(
    cancel: &CancellationToken,
    config: Arc<Config>,
    config_source: PathBuf,
    wait_for_ready: bool,
) -> anyhow::Result<()> {
    let node = NodeConfig::load(&config_source)
        .await
        .with_context(|| format!("loading node config from {:?}", config_source))?;
    let executor = Arc::new(HostExecutor);
    let manager = Arc::new(SystemdManager::new(executor.clone(), cancel.clone()));
    let mut provider = HybridNodeProvider::new(
        node.into_shared(),
        manager,
        executor,
        config.clone(),
        cancel.clone(),
    );

    provider
        .pre_process_daemon()
        .await
        .context("establishing node identity")?;
    provider.with_aws_config().await?;
    provider.start_daemons().await.context("starting daemons")?;

    if wait_for_ready {
        let validator = NodeValidator::for_host(&config).await?;
        validator
            .wait_until_ready(cancel, config.node_ready_timeout, config.poll_interval)
            .await?;
    }
    info!("Node initialised");
    Ok(())
}

async fn uninstall(
    cancel: &CancellationToken,
    config: &Config,
    skip: &[String],
) -> anyhow::Result<()> {
    let skip_node = skip.iter().any(|s| s == "node-validation");
    let skip_pods = skip.iter().any(|s| s == "pod-validation");
    if !(skip_node && skip_pods) {
        let validator = NodeValidator::for_host(config).await?;
        if !skip_node {
            validator
                .is_unscheduled(cancel)
                .await
                .context("node must be cordoned before uninstall")?;
        }
        if !skip_pods {
            validator
                .is_drained(cancel)
                .await
                .context("node must be drained before uninstall")?;
        }
    }

    let executor = Arc::new(HostExecutor);
    let manager = SystemdManager::new(executor, cancel.clone());
    let tracker = Tracker::new(&config.tracker_file);
    hybrid::uninstall(&manager, &tracker, config).await?;
    info!("Uninstall complete");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uninstall_accepts_comma_separated_skips() {
        let cli = Cli::from_iter([
            "nodeadm",
            "uninstall",
            "--skip",
            "node-validation,pod-validation",
        ]);
        match cli.command {
            Command::Uninstall { skip } => {
                assert_eq!(vec!["node-validation", "pod-validation"], skip)
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn install_parses_provider() {
        let cli = Cli::from_iter(["nodeadm", "install", "-p", "iam-ra", "--source-dir", "/tmp"]);
        match cli.command {
            Command::Install {
                credential_provider,
                ..
            } => assert_eq!(ProviderKind::IamRolesAnywhere, credential_provider),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
