//! Certificate based credentials.
//!
//! The signing helper binary exchanges the node certificate for temporary
//! credentials. The AWS credential chain finds it through a
//! `credential_process` entry in a dedicated shared config file.
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{IamRolesAnywhere, NodeConfig};
use crate::artifact::{install_component, remove_path, write_file, Component, Source};
use crate::config::Config;
use crate::credentials::DEFAULT_PROFILE;
use crate::error::{Error, Result};
use crate::tracker::Tracker;

/// Installs the signing helper and tracks it once its checksum verified.
pub async fn install(
    cancel: &CancellationToken,
    tracker: &Tracker,
    source: &mut Source,
    config: &Config,
) -> Result<()> {
    install_component(
        cancel,
        tracker,
        Component::IamRolesAnywhere,
        &config.iam_roles_anywhere.signing_helper,
        source,
        0o755,
    )
    .await
}

/// Removes the signing helper and the directory holding its credential
/// config. Anything already gone is skipped.
pub async fn uninstall(config: &Config) -> Result<()> {
    let paths = &config.iam_roles_anywhere;
    if let Some(dir) = paths.aws_config_file.parent() {
        remove_path(dir).await?;
    }
    remove_path(&paths.signing_helper).await
}

/// Writes the shared config file pointing the credential chain at the signing helper.
pub async fn write_credential_config(node: &NodeConfig, config: &Config) -> Result<PathBuf> {
    let ira = node.iam_roles_anywhere().ok_or_else(|| {
        Error::Configuration("hybrid.iamRolesAnywhere is not set".into())
    })?;
    let path = config.iam_roles_anywhere.aws_config_file.clone();
    let contents = credential_config(ira, &node.spec.cluster.region, config);
    write_file(&path, contents, 0o644).await?;
    info!(?path, "Wrote credential helper config");
    Ok(path)
}

fn credential_config(ira: &IamRolesAnywhere, region: &str, config: &Config) -> String {
    let paths = &config.iam_roles_anywhere;
    let certificate = ira
        .certificate_path
        .as_deref()
        .unwrap_or(paths.default_certificate.as_path());
    let private_key = ira
        .private_key_path
        .as_deref()
        .unwrap_or(paths.default_private_key.as_path());
    format!(
        "[{profile}]\n\
         region = {region}\n\
         credential_process = {helper} credential-process \
         --certificate {certificate} \
         --private-key {private_key} \
         --trust-anchor-arn {trust_anchor} \
         --profile-arn {profile_arn} \
         --role-arn {role_arn} \
         --role-session-name {session}\n",
        profile = DEFAULT_PROFILE,
        region = region,
        helper = display(&paths.signing_helper),
        certificate = display(certificate),
        private_key = display(private_key),
        trust_anchor = ira.trust_anchor_arn,
        profile_arn = ira.profile_arn,
        role_arn = ira.role_arn,
        session = ira.node_name,
    )
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
