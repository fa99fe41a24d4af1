//! Provider configuration loaded from TOML.
//!
//! ```toml
//! [identity]
//! name = "workstation"
//! key_dir = "/var/lib/rsvc/keys"
//!
//! [policy]
//! strategy = "pin_pairing"
//! trusted = ["3f1c..."]
//!
//! [rules]
//! path = "/var/lib/rsvc/rules.toml"
//!
//! [[rules.open]]
//! service = "clock"
//! policy = "allow"
//!
//! [client]
//! refresh_interval_secs = 5
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::policy::{PolicyStrategy, TrustLevel};
use crate::registry::AuthorizationRegistry;
use crate::rule::{Rule, RulePolicy};

const ENV_PREFIX: &str = "RSVC_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Strategy names accepted in `[policy] strategy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    #[default]
    DenyAll,
    TrustedOnly,
    PinPairing,
}

impl StrategyName {
    pub fn to_strategy(self) -> PolicyStrategy {
        match self {
            StrategyName::DenyAll => PolicyStrategy::DenyAll,
            StrategyName::TrustedOnly => PolicyStrategy::TrustedOnly,
            StrategyName::PinPairing => PolicyStrategy::PinPairing,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "deny_all" => Some(StrategyName::DenyAll),
            "trusted_only" => Some(StrategyName::TrustedOnly),
            "pin_pairing" => Some(StrategyName::PinPairing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub name: String,
    pub key_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub strategy: StrategyName,
    /// Identity ids treated as user trusted
    pub trusted: Vec<String>,
}

/// A rule that applies to every caller of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRule {
    pub service: String,
    pub policy: RulePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesSection {
    pub path: PathBuf,
    pub open: Vec<OpenRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub identity: IdentitySection,
    pub policy: PolicySection,
    pub rules: RulesSection,
    pub client: ClientSection,
    pub logging: LoggingSection,
}

fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "rsvc")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".rsvc"))
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            name: "rsvc".to_string(),
            key_dir: data_dir().join("keys"),
        }
    }
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            path: data_dir().join("rules.toml"),
            open: Vec::new(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 5,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AuthConfig {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "rsvc")
            .map(|dirs| dirs.config_dir().join("rsvc.toml"))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AuthConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default location if it exists, else defaults.
    /// Environment overrides are applied last.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => {
                    debug!(path = %path.display(), "Loading default config");
                    Self::load_from_file(&path)?
                }
                None => Self::default(),
            },
        };
        config.apply_env(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Apply `RSVC_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "IDENTITY_NAME" => self.identity.name = value,
                "KEY_DIR" => self.identity.key_dir = PathBuf::from(value),
                "RULES_PATH" => self.rules.path = PathBuf::from(value),
                "LOG_LEVEL" => self.logging.level = value,
                "POLICY" => match StrategyName::parse(&value) {
                    Some(strategy) => self.policy.strategy = strategy,
                    None => warn!(value = %value, "Ignoring unknown RSVC_POLICY"),
                },
                "REFRESH_INTERVAL_SECS" => match value.parse() {
                    Ok(secs) => self.client.refresh_interval_secs = secs,
                    Err(_) => warn!(value = %value, "Ignoring invalid RSVC_REFRESH_INTERVAL_SECS"),
                },
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "identity.name must not be empty".to_string(),
            ));
        }
        if self.client.refresh_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "client.refresh_interval_secs must be at least 1".to_string(),
            ));
        }
        for open in &self.rules.open {
            if open.service.is_empty() {
                return Err(ConfigError::ValidationError(
                    "rules.open entries need a service".to_string(),
                ));
            }
            if !matches!(open.policy, RulePolicy::Allow | RulePolicy::Deny) {
                return Err(ConfigError::ValidationError(format!(
                    "open rule for '{}' must be allow or deny",
                    open.service
                )));
            }
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.client.refresh_interval_secs)
    }

    /// Install strategy, trust table and open rules into `registry`.
    pub fn configure(&self, registry: &Arc<AuthorizationRegistry>) {
        if !registry.set_policy(self.policy.strategy.to_strategy()) {
            warn!("Policy strategy already set; config strategy ignored");
        }
        for id in &self.policy.trusted {
            registry.set_trust_level(id, TrustLevel::UserTrusted);
        }
        for open in &self.rules.open {
            registry.add_rule(Rule::open(&open.service, open.policy));
        }
        info!(
            strategy = ?self.policy.strategy,
            trusted = self.policy.trusted.len(),
            open_rules = self.rules.open.len(),
            "Applied configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRuleStore;
    use crate::rule::WILDCARD_IDENTITY;

    const SAMPLE: &str = r#"
        [identity]
        name = "workstation"
        key_dir = "/tmp/keys"

        [policy]
        strategy = "trusted_only"
        trusted = ["abc"]

        [rules]
        path = "/tmp/rules.toml"

        [[rules.open]]
        service = "clock"
        policy = "allow"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = AuthConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.identity.name, "workstation");
        assert_eq!(config.policy.strategy, StrategyName::TrustedOnly);
        assert_eq!(config.policy.trusted, vec!["abc"]);
        assert_eq!(config.rules.open.len(), 1);
        assert_eq!(config.rules.open[0].policy, RulePolicy::Allow);
        // missing sections fall back to defaults
        assert_eq!(config.client.refresh_interval_secs, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = AuthConfig::from_toml("").unwrap();
        assert_eq!(config.policy.strategy, StrategyName::DenyAll);
        assert!(config.rules.open.is_empty());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = AuthConfig::from_toml("[client]\nrefresh_interval_secs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = AuthConfig::from_toml(
            "[[rules.open]]\nservice = \"clock\"\npolicy = \"pin_required\"",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = AuthConfig::from_toml("[policy]\nstrategy = \"everyone\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AuthConfig::default();
        config.apply_env(vec![
            ("RSVC_POLICY".to_string(), "pin_pairing".to_string()),
            ("RSVC_IDENTITY_NAME".to_string(), "laptop".to_string()),
            ("RSVC_REFRESH_INTERVAL_SECS".to_string(), "soon".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);
        assert_eq!(config.policy.strategy, StrategyName::PinPairing);
        assert_eq!(config.identity.name, "laptop");
        assert_eq!(config.client.refresh_interval_secs, 5);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AuthConfig::load_from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_configure_registry() {
        let config = AuthConfig::from_toml(SAMPLE).unwrap();
        let (registry, _events) = AuthorizationRegistry::new(Arc::new(InMemoryRuleStore::new()));
        config.configure(&registry);

        assert_eq!(registry.policy().map(|p| p.name()), Some("trusted_only"));
        assert_eq!(registry.trust_level("abc"), TrustLevel::UserTrusted);
        let rules = registry.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].1.service(), "clock");
        assert_eq!(rules[0].1.identity(), WILDCARD_IDENTITY);
    }
}
