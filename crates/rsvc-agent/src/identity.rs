//! Local identity commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Subcommand};
use serde::Serialize;
use tracing::info;

use rsvc_core::config::AuthConfig;
use rsvc_core::registry::AuthorizationRegistry;
use rsvc_core::store::{FileKeyStore, InMemoryRuleStore};
use rsvc_crypto::identity::Identity;

use crate::output::{OutputFormat, OutputFormatter};
use crate::ExitCode;

/// Public identity details for display.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityInfo {
    pub id: String,
    pub name: String,
    pub public_key_pem: String,
}

impl IdentityInfo {
    pub fn from_identity(identity: &Identity) -> anyhow::Result<Self> {
        Ok(Self {
            id: identity.id().to_string(),
            name: identity.name().to_string(),
            public_key_pem: identity.public_key_pem()?,
        })
    }
}

/// Load the local identity from the configured key directory, creating it on
/// first use. Returns the public part.
pub async fn load_local(config: &AuthConfig) -> anyhow::Result<Identity> {
    let keystore = FileKeyStore::new(&config.identity.key_dir);
    let (registry, _events) = AuthorizationRegistry::new(Arc::new(InMemoryRuleStore::new()));
    let identity = registry
        .load_local_identity(&keystore, &config.identity.name)
        .await
        .with_context(|| {
            format!(
                "loading identity from {}",
                config.identity.key_dir.display()
            )
        })?;
    info!(id = identity.id(), "Local identity loaded");
    Ok(identity)
}

#[derive(Args, Debug)]
pub struct IdentityArgs {
    #[command(subcommand)]
    pub action: IdentityAction,
}

#[derive(Subcommand, Debug)]
pub enum IdentityAction {
    /// Show the local identity, creating it if needed
    Show,
    /// Write the public key as PEM
    Export {
        /// Output file (stdout when omitted)
        #[arg(long)]
        output_file: Option<PathBuf>,
    },
}

impl IdentityArgs {
    pub async fn execute(
        self,
        config: &AuthConfig,
        output: OutputFormat,
        verbose: bool,
    ) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(output, verbose);
        formatter.progress("Loading identity...");
        let identity = load_local(config).await?;

        match self.action {
            IdentityAction::Show => {
                let info = IdentityInfo::from_identity(&identity)?;
                println!("{}", formatter.format_identity(&info));
            }
            IdentityAction::Export { output_file } => {
                let pem = identity.public_key_pem()?;
                match output_file {
                    Some(path) => {
                        std::fs::write(&path, &pem)
                            .with_context(|| format!("writing {}", path.display()))?;
                        formatter.success(&format!("Public key written to {}", path.display()));
                    }
                    None => print!("{pem}"),
                }
            }
        }
        Ok(ExitCode::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_local_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AuthConfig::default();
        config.identity.name = "bench".into();
        config.identity.key_dir = dir.path().to_path_buf();

        let first = load_local(&config).await.unwrap();
        let second = load_local(&config).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.name(), "bench");
        assert!(!first.has_private_key());

        let info = IdentityInfo::from_identity(&first).unwrap();
        assert!(info.public_key_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }
}
