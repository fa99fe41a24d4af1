//! Authorization rules.
//!
//! A rule grants or refuses a (service, identity) pair. The `AllUsers` and
//! `AllServices` target flags widen a rule to every caller of one service or to
//! every service for one caller. Narrower rules win over wider ones.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::RegistryError;

/// Registry-assigned rule identifier.
pub type RuleId = u64;

/// Identity pattern matching every caller.
pub const WILDCARD_IDENTITY: &str = "*";

/// Target flags (bitset).
pub mod targets {
    pub const NONE: u32 = 0;
    /// The rule applies to every caller of its service.
    pub const ALL_USERS: u32 = 1;
    /// The rule applies to every service for its caller.
    pub const ALL_SERVICES: u32 = 2;
    /// Every known flag.
    pub const MASK: u32 = ALL_USERS | ALL_SERVICES;
}

/// Decision recorded on a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePolicy {
    /// Undecided; requests matching it wait for a decision.
    #[default]
    Unspecified,
    Deny,
    Allow,
    /// Allowed once the caller presents the PIN stored on the rule.
    PinRequired,
}

impl RulePolicy {
    pub fn as_i32(self) -> i32 {
        match self {
            RulePolicy::Unspecified => 0,
            RulePolicy::Deny => 1,
            RulePolicy::Allow => 2,
            RulePolicy::PinRequired => 3,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(RulePolicy::Unspecified),
            1 => Some(RulePolicy::Deny),
            2 => Some(RulePolicy::Allow),
            3 => Some(RulePolicy::PinRequired),
            _ => None,
        }
    }
}

impl fmt::Display for RulePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RulePolicy::Unspecified => "unspecified",
            RulePolicy::Deny => "deny",
            RulePolicy::Allow => "allow",
            RulePolicy::PinRequired => "pin_required",
        };
        f.write_str(s)
    }
}

/// Whether a rule survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    #[default]
    Transient,
    Persistent,
}

impl Persistence {
    pub fn as_i32(self) -> i32 {
        match self {
            Persistence::Transient => 0,
            Persistence::Persistent => 1,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Persistence::Transient),
            1 => Some(Persistence::Persistent),
            _ => None,
        }
    }
}

/// An authorization rule.
#[derive(Clone, PartialEq, Eq)]
pub struct Rule {
    service: String,
    identity: String,
    policy: RulePolicy,
    targets: u32,
    persistence: Persistence,
    pin: Option<String>,
}

impl Rule {
    /// Unspecified, transient rule for one (service, identity) pair.
    pub fn new(service: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            identity: identity.into(),
            policy: RulePolicy::Unspecified,
            targets: targets::NONE,
            persistence: Persistence::Transient,
            pin: None,
        }
    }

    /// Rule matching every caller of `service`.
    pub fn open(service: impl Into<String>, policy: RulePolicy) -> Self {
        Self::new(service, WILDCARD_IDENTITY)
            .with_policy(policy)
            .with_targets(targets::ALL_USERS)
    }

    pub fn with_policy(mut self, policy: RulePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_targets(mut self, targets: u32) -> Self {
        self.targets = targets & targets::MASK;
        self
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Some(pin.into());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn policy(&self) -> RulePolicy {
        self.policy
    }

    pub fn targets(&self) -> u32 {
        self.targets
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// PIN set by the local user, if any.
    pub fn pin(&self) -> Option<&str> {
        self.pin.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence == Persistence::Persistent
    }

    pub(crate) fn set_policy(&mut self, policy: RulePolicy) {
        self.policy = policy;
        if policy != RulePolicy::PinRequired {
            self.pin = None;
        }
    }

    pub(crate) fn set_targets(&mut self, targets: u32) {
        self.targets = targets & targets::MASK;
    }

    pub(crate) fn set_persistence(&mut self, persistence: Persistence) {
        self.persistence = persistence;
    }

    pub(crate) fn set_pin(&mut self, pin: String) {
        self.pin = Some(pin);
    }

    /// Whether this rule applies to `identity_id` calling `service`.
    pub fn matches(&self, service: &str, identity_id: &str) -> bool {
        (self.service == service && self.identity == identity_id)
            || (self.targets & targets::ALL_USERS != 0 && self.service == service)
            || (self.targets & targets::ALL_SERVICES != 0 && self.identity == identity_id)
    }

    /// Number of widening flags; lower is more specific.
    pub fn breadth(&self) -> u32 {
        self.targets.count_ones()
    }

    // ========================================================================
    // Persistence records
    // ========================================================================

    pub fn to_record(&self) -> RuleRecord {
        RuleRecord {
            credentials_id: self.identity.clone(),
            service_name: self.service.clone(),
            policy: self.policy.as_i32(),
            targets: self.targets,
            persistence: self.persistence.as_i32(),
        }
    }

    pub fn from_record(record: &RuleRecord) -> Result<Self, RegistryError> {
        if record.service_name.is_empty() {
            return Err(RegistryError::InvalidRule("empty service name".into()));
        }
        if record.credentials_id.is_empty() {
            return Err(RegistryError::InvalidRule("empty credentials id".into()));
        }
        let policy = RulePolicy::from_i32(record.policy)
            .ok_or_else(|| RegistryError::InvalidRule(format!("unknown policy {}", record.policy)))?;
        let persistence = Persistence::from_i32(record.persistence).ok_or_else(|| {
            RegistryError::InvalidRule(format!("unknown persistence {}", record.persistence))
        })?;
        if record.targets & !targets::MASK != 0 {
            return Err(RegistryError::InvalidRule(format!(
                "unknown target flags {:#x}",
                record.targets
            )));
        }
        Ok(Rule::new(record.service_name.clone(), record.credentials_id.clone())
            .with_policy(policy)
            .with_targets(record.targets)
            .with_persistence(persistence))
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("service", &self.service)
            .field("identity", &self.identity)
            .field("policy", &self.policy)
            .field("targets", &self.targets)
            .field("persistence", &self.persistence)
            .field("pin_set", &self.pin.is_some())
            .finish()
    }
}

/// One persisted rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    #[serde(rename = "CredentialsID")]
    pub credentials_id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(rename = "Policy")]
    pub policy: i32,
    #[serde(rename = "Targets")]
    pub targets: u32,
    #[serde(rename = "Persistence")]
    pub persistence: i32,
}

/// Versioned document holding persisted rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFile {
    pub version: u32,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleRecord>,
}

impl RuleFile {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(rules: Vec<RuleRecord>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            rules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let rule = Rule::new("clock", "alice");
        assert!(rule.matches("clock", "alice"));
        assert!(!rule.matches("clock", "bob"));
        assert!(!rule.matches("camera", "alice"));
    }

    #[test]
    fn test_target_flags_widen() {
        let all_users = Rule::new("clock", "alice").with_targets(targets::ALL_USERS);
        assert!(all_users.matches("clock", "bob"));
        assert!(!all_users.matches("camera", "alice"));

        let all_services = Rule::new("clock", "alice").with_targets(targets::ALL_SERVICES);
        assert!(all_services.matches("camera", "alice"));
        assert!(!all_services.matches("camera", "bob"));

        let open = Rule::open("clock", RulePolicy::Allow);
        assert!(open.matches("clock", WILDCARD_IDENTITY));
        assert!(open.matches("clock", "anyone"));
    }

    #[test]
    fn test_breadth() {
        assert_eq!(Rule::new("s", "i").breadth(), 0);
        assert_eq!(Rule::new("s", "i").with_targets(targets::ALL_USERS).breadth(), 1);
        assert_eq!(Rule::new("s", "i").with_targets(targets::MASK).breadth(), 2);
        // Unknown bits are dropped
        assert_eq!(Rule::new("s", "i").with_targets(0xff).targets(), targets::MASK);
    }

    #[test]
    fn test_leaving_pin_required_clears_pin() {
        let mut rule = Rule::new("clock", "alice")
            .with_policy(RulePolicy::PinRequired)
            .with_pin("4271");
        assert_eq!(rule.pin(), Some("4271"));

        rule.set_policy(RulePolicy::Allow);
        assert_eq!(rule.pin(), None);
        assert!(!format!("{:?}", rule).contains("4271"));
    }

    #[test]
    fn test_record_conversion() {
        let rule = Rule::new("clock", "alice")
            .with_policy(RulePolicy::Allow)
            .with_targets(targets::ALL_SERVICES)
            .with_persistence(Persistence::Persistent);
        let record = rule.to_record();
        assert_eq!(record.policy, 2);
        assert_eq!(record.targets, 2);
        assert_eq!(record.persistence, 1);
        assert_eq!(Rule::from_record(&record).unwrap(), rule);
    }

    #[test]
    fn test_malformed_records_rejected() {
        let good = Rule::new("clock", "alice").to_record();

        let mut empty_service = good.clone();
        empty_service.service_name.clear();
        assert!(Rule::from_record(&empty_service).is_err());

        let mut bad_policy = good.clone();
        bad_policy.policy = 9;
        assert!(Rule::from_record(&bad_policy).is_err());

        let mut bad_targets = good;
        bad_targets.targets = 8;
        assert!(Rule::from_record(&bad_targets).is_err());
    }

    #[test]
    fn test_rule_file_toml_shape() {
        let file = RuleFile::new(vec![Rule::new("clock", "alice")
            .with_policy(RulePolicy::Deny)
            .to_record()]);
        let text = toml::to_string(&file).unwrap();
        assert!(text.contains("version = 1"));
        assert!(text.contains("[[rule]]"));
        assert!(text.contains("CredentialsID = \"alice\""));
        assert!(text.contains("serviceName = \"clock\""));

        let parsed: RuleFile = toml::from_str(&text).unwrap();
        assert_eq!(parsed, file);
    }
}
