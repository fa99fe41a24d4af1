//! In-process smoke test: a provider publishing the clock service and a
//! session client calling it over a loopback transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use tokio::time::timeout;
use tracing::info;

use rsvc_core::client::{ClientConfig, SessionClient};
use rsvc_core::harness::{clock_service, spawn_pin_answerer};
use rsvc_core::pipeline::AuthorizationPipeline;
use rsvc_core::policy::{PinPrompter, PolicyStrategy, TrustLevel};
use rsvc_core::registry::AuthorizationRegistry;
use rsvc_core::store::InMemoryRuleStore;
use rsvc_crypto::identity::Identity;
use rsvc_transport::{LoopbackTransport, RpcTransport};

use crate::output::{OutputFormat, OutputFormatter};
use crate::ExitCode;

const DESTINATION: &str = "clock";

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub destination: String,
    pub strategy: String,
    pub operations_description: String,
    pub enabled_operations: Vec<String>,
    pub time: u64,
    pub echo: String,
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Pair with this PIN instead of trusting the client
    #[arg(long)]
    pub pin: Option<String>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,
}

impl DemoArgs {
    pub async fn execute(self, output: OutputFormat, verbose: bool) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(output, verbose);
        formatter.progress("Starting provider and client...");
        let report = timeout(Duration::from_secs(self.timeout_secs), run(self.pin))
            .await
            .context("demo timed out")??;
        println!("{}", formatter.format_demo(&report));
        Ok(ExitCode::Success)
    }
}

/// Run one session against a fresh provider.
pub async fn run(pin: Option<String>) -> anyhow::Result<DemoReport> {
    let local = Identity::generate("demo-client");
    let strategy = match pin {
        Some(_) => PolicyStrategy::PinPairing,
        None => PolicyStrategy::TrustedOnly,
    };

    // Provider
    let (provider, events) = AuthorizationRegistry::new(Arc::new(InMemoryRuleStore::new()));
    provider.set_policy(strategy.clone());
    match &pin {
        Some(pin) => {
            let (prompter, prompts) = PinPrompter::channel();
            provider.set_pin_prompter(prompter);
            spawn_pin_answerer(prompts, pin.clone());
        }
        None => provider.set_trust_level(local.id(), TrustLevel::UserTrusted),
    }
    let mut pipeline = AuthorizationPipeline::new(provider, events);
    pipeline.publish(Arc::new(clock_service()));
    let (transport, calls) = LoopbackTransport::pair(16);
    tokio::spawn(pipeline.run(calls));

    // Client
    let (registry, _events) = AuthorizationRegistry::new(Arc::new(InMemoryRuleStore::new()));
    registry.set_policy(strategy.clone());
    if let Some(pin) = &pin {
        let (prompter, prompts) = PinPrompter::channel();
        registry.set_pin_prompter(prompter);
        spawn_pin_answerer(prompts, pin.clone());
    }
    registry.set_local_identity(local)?;

    let transport: Arc<dyn RpcTransport> = Arc::new(transport);
    let config = ClientConfig::new(DESTINATION).with_refresh_interval(Duration::from_millis(100));
    let (client, _task) = SessionClient::spawn(registry, transport, config);
    client.wait_ready().await?;
    info!(destination = DESTINATION, "Demo session ready");

    let time = client.call("time", b"").await?;
    let time = <[u8; 8]>::try_from(time.as_slice())
        .map(u64::from_be_bytes)
        .context("time() returned a malformed value")?;
    let echo = client.call("echo", b"hello from rsvc").await?;

    // Let one refresh land
    while client.enabled_operations().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let report = DemoReport {
        destination: DESTINATION.to_string(),
        strategy: strategy.name().to_string(),
        operations_description: String::from_utf8_lossy(
            &client.operations_description().unwrap_or_default(),
        )
        .into_owned(),
        enabled_operations: client.enabled_operations(),
        time,
        echo: String::from_utf8_lossy(&echo).into_owned(),
    };
    client.shutdown();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_trusted() {
        let report = run(None).await.unwrap();
        assert_eq!(report.strategy, "trusted_only");
        assert_eq!(report.echo, "hello from rsvc");
        assert_eq!(report.time, 1_700_000_000);
        assert_eq!(report.enabled_operations, vec!["echo", "fail", "time"]);
    }

    #[tokio::test]
    async fn test_demo_pin_pairing() {
        let report = run(Some("4271".into())).await.unwrap();
        assert_eq!(report.strategy, "pin_pairing");
        assert!(report.operations_description.contains("echo"));
    }
}
