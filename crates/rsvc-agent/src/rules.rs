//! Persisted rule administration and authorization checks.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use rsvc_core::config::AuthConfig;
use rsvc_core::registry::AuthorizationRegistry;
use rsvc_core::rule::{targets, Persistence, Rule, RuleId, RulePolicy, WILDCARD_IDENTITY};
use rsvc_core::store::TomlRuleStore;

use crate::output::{OutputFormat, OutputFormatter};
use crate::ExitCode;

/// One rule as displayed.
#[derive(Debug, Clone, Serialize)]
pub struct RuleRow {
    pub id: RuleId,
    pub service: String,
    pub identity: String,
    pub policy: String,
    pub targets: String,
    pub persistence: String,
}

impl RuleRow {
    pub fn new(id: RuleId, rule: &Rule) -> Self {
        Self {
            id,
            service: rule.service().to_string(),
            identity: rule.identity().to_string(),
            policy: rule.policy().to_string(),
            targets: targets_label(rule.targets()),
            persistence: match rule.persistence() {
                Persistence::Transient => "transient".to_string(),
                Persistence::Persistent => "persistent".to_string(),
            },
        }
    }
}

fn targets_label(flags: u32) -> String {
    let mut labels = Vec::new();
    if flags & targets::ALL_USERS != 0 {
        labels.push("all_users");
    }
    if flags & targets::ALL_SERVICES != 0 {
        labels.push("all_services");
    }
    if labels.is_empty() {
        "-".to_string()
    } else {
        labels.join(",")
    }
}

/// How a request would be decided right now.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub service: String,
    pub identity: String,
    pub decision: String,
    pub source: String,
    pub rule_id: Option<RuleId>,
}

/// Registry holding the persisted rules plus everything from config.
pub async fn open_registry(config: &AuthConfig) -> anyhow::Result<Arc<AuthorizationRegistry>> {
    let store = TomlRuleStore::new(&config.rules.path);
    let (registry, _events) = AuthorizationRegistry::new(Arc::new(store));
    registry
        .load_rules()
        .await
        .with_context(|| format!("loading rules from {}", config.rules.path.display()))?;
    config.configure(&registry);
    Ok(registry)
}

/// Decide `(service, identity)` the way the pipeline's rule checks would,
/// without running the policy strategy.
pub fn check(registry: &Arc<AuthorizationRegistry>, service: &str, identity: &str) -> CheckOutcome {
    let mut outcome = CheckOutcome {
        service: service.to_string(),
        identity: identity.to_string(),
        decision: String::new(),
        source: String::new(),
        rule_id: None,
    };

    if let Some(handle) = registry.find_matching_rule(service, WILDCARD_IDENTITY) {
        if let Some(rule) = handle.snapshot() {
            if matches!(rule.policy(), RulePolicy::Allow | RulePolicy::Deny) {
                outcome.decision = rule.policy().to_string();
                outcome.source = "open rule".to_string();
                outcome.rule_id = Some(handle.id());
                return outcome;
            }
        }
    }

    match registry
        .find_matching_rule(service, identity)
        .and_then(|h| h.snapshot().map(|r| (h.id(), r)))
    {
        Some((id, rule)) => {
            outcome.decision = rule.policy().to_string();
            outcome.source = "caller rule".to_string();
            outcome.rule_id = Some(id);
        }
        None => {
            let strategy = registry
                .policy()
                .map(|p| p.name().to_string())
                .unwrap_or_else(|| "none".to_string());
            outcome.decision = "undecided".to_string();
            outcome.source = format!("policy {strategy} on first request");
        }
    }
    outcome
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Allow,
    Deny,
    PinRequired,
}

impl From<PolicyArg> for RulePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Allow => RulePolicy::Allow,
            PolicyArg::Deny => RulePolicy::Deny,
            PolicyArg::PinRequired => RulePolicy::PinRequired,
        }
    }
}

#[derive(Args, Debug)]
pub struct RulesArgs {
    #[command(subcommand)]
    pub action: RulesAction,
}

#[derive(Subcommand, Debug)]
pub enum RulesAction {
    /// List persisted and configured rules
    List,
    /// Add a persistent rule
    Add {
        /// Service name
        #[arg(long)]
        service: String,
        /// Caller identity id ("*" with --all-users)
        #[arg(long)]
        identity: String,
        #[arg(long, value_enum)]
        policy: PolicyArg,
        /// Apply to every caller of the service
        #[arg(long)]
        all_users: bool,
        /// Apply to every service for the caller
        #[arg(long)]
        all_services: bool,
    },
    /// Remove persistent rules for a (service, identity) pair
    Revoke {
        #[arg(long)]
        service: String,
        #[arg(long)]
        identity: String,
    },
}

impl RulesArgs {
    pub async fn execute(
        self,
        config: &AuthConfig,
        output: OutputFormat,
        verbose: bool,
    ) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(output, verbose);
        formatter.progress("Loading rules...");
        let registry = open_registry(config).await?;

        match self.action {
            RulesAction::List => {
                let rows: Vec<RuleRow> = registry
                    .rules()
                    .iter()
                    .map(|(id, rule)| RuleRow::new(*id, rule))
                    .collect();
                println!("{}", formatter.format_rules(&rows));
                Ok(ExitCode::Success)
            }
            RulesAction::Add {
                service,
                identity,
                policy,
                all_users,
                all_services,
            } => {
                let rule = build_rule(&service, &identity, policy, all_users, all_services)?;
                let handle = registry.add_rule(rule);
                registry.flush().await?;
                info!(rule_id = handle.id(), service = %service, "Rule added");
                formatter.success(&format!("Rule added for {service} / {identity}"));
                Ok(ExitCode::Success)
            }
            RulesAction::Revoke { service, identity } => {
                let removed = revoke(&registry, &service, &identity);
                if removed == 0 {
                    formatter.success("No matching persistent rule");
                    return Ok(ExitCode::NotFound);
                }
                registry.flush().await?;
                formatter.success(&format!("Removed {removed} rule(s)"));
                Ok(ExitCode::Success)
            }
        }
    }
}

fn build_rule(
    service: &str,
    identity: &str,
    policy: PolicyArg,
    all_users: bool,
    all_services: bool,
) -> anyhow::Result<Rule> {
    if service.is_empty() || identity.is_empty() {
        bail!("service and identity must not be empty");
    }
    if identity == WILDCARD_IDENTITY && !all_users {
        bail!("identity \"*\" needs --all-users");
    }
    let mut flags = targets::NONE;
    if all_users {
        flags |= targets::ALL_USERS;
    }
    if all_services {
        flags |= targets::ALL_SERVICES;
    }
    Ok(Rule::new(service, identity)
        .with_policy(policy.into())
        .with_targets(flags)
        .with_persistence(Persistence::Persistent))
}

/// Remove persistent rules for exactly this pair. Returns how many went.
fn revoke(registry: &AuthorizationRegistry, service: &str, identity: &str) -> usize {
    registry
        .rules()
        .into_iter()
        .filter(|(_, r)| r.is_persistent() && r.service() == service && r.identity() == identity)
        .filter_map(|(id, _)| registry.remove_rule(id))
        .count()
}

/// Arguments for the check command
#[derive(Args, Debug)]
pub struct CheckArgs {
    #[arg(long)]
    pub service: String,
    #[arg(long)]
    pub identity: String,
}

impl CheckArgs {
    pub async fn execute(
        self,
        config: &AuthConfig,
        output: OutputFormat,
        verbose: bool,
    ) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(output, verbose);
        let registry = open_registry(config).await?;
        let outcome = check(&registry, &self.service, &self.identity);
        println!("{}", formatter.format_check(&outcome));
        Ok(match outcome.decision.as_str() {
            "deny" => ExitCode::AccessDenied,
            _ => ExitCode::Success,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsvc_core::config::OpenRule;

    fn config_in(dir: &std::path::Path) -> AuthConfig {
        let mut config = AuthConfig::default();
        config.rules.path = dir.join("rules.toml");
        config
    }

    #[tokio::test]
    async fn test_add_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let registry = open_registry(&config).await.unwrap();
        let rule = build_rule("clock", "alice", PolicyArg::Allow, false, true).unwrap();
        registry.add_rule(rule);
        assert!(registry.flush().await.unwrap());

        let reloaded = open_registry(&config).await.unwrap();
        let rows: Vec<RuleRow> = reloaded
            .rules()
            .iter()
            .map(|(id, r)| RuleRow::new(*id, r))
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].policy, "allow");
        assert_eq!(rows[0].targets, "all_services");
        assert_eq!(rows[0].persistence, "persistent");
    }

    #[tokio::test]
    async fn test_revoke_removes_only_exact_pair() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let registry = open_registry(&config).await.unwrap();
        registry.add_rule(build_rule("clock", "alice", PolicyArg::Allow, false, false).unwrap());
        registry.add_rule(build_rule("clock", "bob", PolicyArg::Deny, false, false).unwrap());
        registry.flush().await.unwrap();

        assert_eq!(revoke(&registry, "clock", "alice"), 1);
        assert_eq!(revoke(&registry, "clock", "alice"), 0);
        registry.flush().await.unwrap();

        let reloaded = open_registry(&config).await.unwrap();
        assert_eq!(reloaded.rules().len(), 1);
        assert_eq!(reloaded.rules()[0].1.identity(), "bob");
    }

    #[test]
    fn test_build_rule_rejects_bare_wildcard() {
        assert!(build_rule("clock", "*", PolicyArg::Allow, false, false).is_err());
        assert!(build_rule("clock", "*", PolicyArg::Allow, true, false).is_ok());
        assert!(build_rule("", "alice", PolicyArg::Allow, false, false).is_err());
    }

    #[tokio::test]
    async fn test_check_prefers_open_rule() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.rules.open.push(OpenRule {
            service: "clock".into(),
            policy: RulePolicy::Deny,
        });
        let registry = open_registry(&config).await.unwrap();
        registry.add_rule(Rule::new("clock", "alice").with_policy(RulePolicy::Allow));

        let outcome = check(&registry, "clock", "alice");
        assert_eq!(outcome.decision, "deny");
        assert_eq!(outcome.source, "open rule");

        let outcome = check(&registry, "printer", "alice");
        assert_eq!(outcome.decision, "undecided");
        assert_eq!(outcome.source, "policy deny_all on first request");
    }
}
