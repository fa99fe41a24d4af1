//! Authorization registry.
//!
//! The registry owns the rule list, the table of known identities and their
//! trust levels, the selected policy strategy and the local identity.
//! Everything else refers to rules through [`RuleHandle`]s.
//!
//! Rule mutations are reported on an unbounded channel as [`RuleEvent`]s and
//! are picked up on the owner's next tick, never synchronously. Persistent
//! rule changes mark the registry dirty; [`AuthorizationRegistry::flush`]
//! writes them out in one save.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use rsvc_crypto::identity::{Identity, SignatureScheme};

use crate::errors::{AuthError, RegistryError};
use crate::policy::{PinPrompter, PolicyStrategy, TrustLevel};
use crate::rule::{Persistence, Rule, RuleId, RulePolicy};
use crate::store::{IdentityRecord, KeyStore, RuleStore};

/// Key under which the local identity record is kept.
pub const LOCAL_IDENTITY_KEY: &str = "local_identity";

/// Rule change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEvent {
    Changed(RuleId),
    Removed(RuleId),
}

/// Receiving side of rule notifications.
pub type RuleEvents = mpsc::UnboundedReceiver<RuleEvent>;

struct RegistryState {
    rules: Vec<(RuleId, Rule)>,
    next_rule_id: RuleId,
    identities: HashMap<String, Identity>,
    trust: HashMap<String, TrustLevel>,
    strategy: Option<PolicyStrategy>,
    prompter: Option<PinPrompter>,
    dirty: bool,
}

pub struct AuthorizationRegistry {
    state: Mutex<RegistryState>,
    events: mpsc::UnboundedSender<RuleEvent>,
    rule_store: Arc<dyn RuleStore>,
    local: OnceLock<Identity>,
    ready: watch::Sender<bool>,
}

impl AuthorizationRegistry {
    /// Create a registry and the receiver its rule notifications arrive on.
    pub fn new(rule_store: Arc<dyn RuleStore>) -> (Arc<Self>, RuleEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(false);
        let registry = Arc::new(Self {
            state: Mutex::new(RegistryState {
                rules: Vec::new(),
                next_rule_id: 1,
                identities: HashMap::new(),
                trust: HashMap::new(),
                strategy: None,
                prompter: None,
                dirty: false,
            }),
            events,
            rule_store,
            local: OnceLock::new(),
            ready,
        });
        (registry, rx)
    }

    // ========================================================================
    // Policy
    // ========================================================================

    /// Select the policy strategy. The first call wins; later calls are
    /// ignored and return false.
    pub fn set_policy(&self, strategy: PolicyStrategy) -> bool {
        let mut state = self.state.lock();
        if let Some(current) = &state.strategy {
            warn!(
                current = current.name(),
                requested = strategy.name(),
                "Policy strategy already locked; ignoring"
            );
            return false;
        }
        info!(strategy = strategy.name(), "Policy strategy selected");
        state.strategy = Some(strategy);
        true
    }

    pub fn policy(&self) -> Option<PolicyStrategy> {
        self.state.lock().strategy.clone()
    }

    pub fn set_pin_prompter(&self, prompter: PinPrompter) {
        self.state.lock().prompter = Some(prompter);
    }

    pub fn pin_prompter(&self) -> Option<PinPrompter> {
        self.state.lock().prompter.clone()
    }

    // ========================================================================
    // Identities and trust
    // ========================================================================

    pub fn identity(&self, id: &str) -> Option<Identity> {
        self.state.lock().identities.get(id).cloned()
    }

    /// Remember a remote identity. Invalid or already known identities are
    /// ignored. Private keys are never stored.
    pub fn add_identity(&self, identity: &Identity) -> bool {
        if !identity.is_valid() {
            warn!(id = identity.id(), "Rejecting identity whose id does not match its key");
            return false;
        }
        let mut state = self.state.lock();
        if state.identities.contains_key(identity.id()) {
            return false;
        }
        debug!(id = identity.id(), name = identity.name(), "Identity added");
        state
            .identities
            .insert(identity.id().to_string(), identity.strip_private());
        true
    }

    pub fn trust_level(&self, id: &str) -> TrustLevel {
        if self.local.get().is_some_and(|local| local.id() == id) {
            return TrustLevel::SelfTrusted;
        }
        self.state
            .lock()
            .trust
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_trust_level(&self, id: &str, level: TrustLevel) {
        self.state.lock().trust.insert(id.to_string(), level);
    }

    // ========================================================================
    // Rules
    // ========================================================================

    pub fn add_rule(self: &Arc<Self>, rule: Rule) -> RuleHandle {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_rule_id;
            state.next_rule_id += 1;
            if rule.is_persistent() {
                state.dirty = true;
            }
            debug!(rule_id = id, service = rule.service(), identity = rule.identity(), "Rule added");
            state.rules.push((id, rule));
            id
        };
        self.handle(id)
    }

    /// Most specific rule matching (service, identity). Among equally
    /// specific rules the first added wins.
    pub fn find_matching_rule(self: &Arc<Self>, service: &str, identity_id: &str) -> Option<RuleHandle> {
        let id = {
            let state = self.state.lock();
            let mut best: Option<(RuleId, u32)> = None;
            for (id, rule) in &state.rules {
                if !rule.matches(service, identity_id) {
                    continue;
                }
                let breadth = rule.breadth();
                if best.map_or(true, |(_, b)| breadth < b) {
                    best = Some((*id, breadth));
                }
            }
            best?.0
        };
        Some(self.handle(id))
    }

    pub fn rule(&self, id: RuleId) -> Option<Rule> {
        self.state
            .lock()
            .rules
            .iter()
            .find(|(rid, _)| *rid == id)
            .map(|(_, r)| r.clone())
    }

    /// Snapshot of every rule.
    pub fn rules(&self) -> Vec<(RuleId, Rule)> {
        self.state.lock().rules.clone()
    }

    fn handle(self: &Arc<Self>, id: RuleId) -> RuleHandle {
        RuleHandle {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Apply `f` to a rule and schedule a change notification.
    pub(crate) fn update_rule(&self, id: RuleId, f: impl FnOnce(&mut Rule)) -> bool {
        {
            let mut state = self.state.lock();
            let Some((_, rule)) = state.rules.iter_mut().find(|(rid, _)| *rid == id) else {
                return false;
            };
            let was_persistent = rule.is_persistent();
            f(rule);
            if was_persistent || rule.is_persistent() {
                state.dirty = true;
            }
        }
        let _ = self.events.send(RuleEvent::Changed(id));
        true
    }

    pub fn remove_rule(&self, id: RuleId) -> Option<Rule> {
        let removed = {
            let mut state = self.state.lock();
            let index = state.rules.iter().position(|(rid, _)| *rid == id)?;
            let (_, rule) = state.rules.remove(index);
            if rule.is_persistent() {
                state.dirty = true;
            }
            rule
        };
        info!(rule_id = id, service = removed.service(), "Rule removed");
        let _ = self.events.send(RuleEvent::Removed(id));
        Some(removed)
    }

    /// Load persisted rules, skipping malformed records.
    pub async fn load_rules(self: &Arc<Self>) -> Result<usize, RegistryError> {
        let records = self.rule_store.load_rules().await?;
        let mut loaded = 0;
        for record in &records {
            match Rule::from_record(record) {
                Ok(rule) => {
                    let mut state = self.state.lock();
                    let id = state.next_rule_id;
                    state.next_rule_id += 1;
                    state
                        .rules
                        .push((id, rule.with_persistence(Persistence::Persistent)));
                    loaded += 1;
                }
                Err(e) => warn!(
                    service = %record.service_name,
                    identity = %record.credentials_id,
                    error = %e,
                    "Skipping malformed persisted rule"
                ),
            }
        }
        info!(loaded, skipped = records.len() - loaded, "Persisted rules loaded");
        Ok(loaded)
    }

    /// Write Persistent rules if anything changed since the last save.
    /// Returns whether a save happened.
    pub async fn flush(&self) -> Result<bool, RegistryError> {
        let records = {
            let mut state = self.state.lock();
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            state
                .rules
                .iter()
                .filter(|(_, r)| r.is_persistent())
                .map(|(_, r)| r.to_record())
                .collect::<Vec<_>>()
        };
        let count = records.len();
        if let Err(e) = self.rule_store.save_rules(records).await {
            self.state.lock().dirty = true;
            return Err(e.into());
        }
        debug!(count, "Persistent rules saved");
        Ok(true)
    }

    // ========================================================================
    // Local identity
    // ========================================================================

    /// Load the local identity from `keystore`, generating and storing a new
    /// one on first run. Fires the ready notification.
    pub async fn load_local_identity(
        &self,
        keystore: &dyn KeyStore,
        name: &str,
    ) -> Result<Identity, RegistryError> {
        let identity = if keystore.key_exists(LOCAL_IDENTITY_KEY).await {
            info!("Loading existing local identity");
            let data = keystore.load_key(LOCAL_IDENTITY_KEY).await?;
            IdentityRecord::from_json(&data)?.to_identity()?
        } else {
            info!(name, "Generating new local identity");
            let identity = Identity::generate(name);
            let record = IdentityRecord::from_identity(&identity)?;
            keystore
                .store_key(LOCAL_IDENTITY_KEY, &record.to_json()?)
                .await?;
            identity
        };
        let public = identity.strip_private();
        self.set_local_identity(identity)?;
        Ok(public)
    }

    /// Install the local identity directly. Only the first call succeeds.
    pub fn set_local_identity(&self, identity: Identity) -> Result<(), RegistryError> {
        if !identity.has_private_key() {
            return Err(RegistryError::Identity("local identity needs a private key".into()));
        }
        let public = identity.strip_private();
        self.local
            .set(identity)
            .map_err(|_| RegistryError::Identity("local identity already loaded".into()))?;
        self.state
            .lock()
            .identities
            .insert(public.id().to_string(), public.clone());
        info!(id = public.id(), name = public.name(), "Local identity ready");
        self.ready.send_replace(true);
        Ok(())
    }

    /// Public part of the local identity.
    pub fn local_identity(&self) -> Result<Identity, AuthError> {
        self.local
            .get()
            .map(Identity::strip_private)
            .ok_or(AuthError::IdentityNotReady)
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolve once the local identity is available.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as self
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn sign_local(&self, scheme: SignatureScheme, payload: &[u8]) -> Result<Vec<u8>, AuthError> {
        let local = self.local.get().ok_or(AuthError::IdentityNotReady)?;
        local
            .sign_with(scheme, payload)
            .map_err(|_| AuthError::SigningUnavailable)
    }
}

impl fmt::Debug for AuthorizationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AuthorizationRegistry")
            .field("rules", &state.rules.len())
            .field("identities", &state.identities.len())
            .field("strategy", &state.strategy)
            .field("ready", &self.local.get().is_some())
            .finish()
    }
}

impl From<rsvc_crypto::identity::IdentityError> for RegistryError {
    fn from(err: rsvc_crypto::identity::IdentityError) -> Self {
        RegistryError::Identity(err.to_string())
    }
}

// ============================================================================
// Rule handles
// ============================================================================

/// Reference to a rule owned by a registry.
///
/// Handles stay valid after the rule is removed; operations on a removed rule
/// return `None` or `false`.
#[derive(Clone)]
pub struct RuleHandle {
    id: RuleId,
    registry: Arc<AuthorizationRegistry>,
}

impl RuleHandle {
    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn registry(&self) -> &Arc<AuthorizationRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> Option<Rule> {
        self.registry.rule(self.id)
    }

    pub fn exists(&self) -> bool {
        self.snapshot().is_some()
    }

    pub fn set_policy(&self, policy: RulePolicy) -> bool {
        self.registry.update_rule(self.id, |r| r.set_policy(policy))
    }

    pub fn set_targets(&self, targets: u32) -> bool {
        self.registry.update_rule(self.id, |r| r.set_targets(targets))
    }

    pub fn set_persistence(&self, persistence: Persistence) -> bool {
        self.registry.update_rule(self.id, |r| r.set_persistence(persistence))
    }

    /// Record the PIN callers must present.
    pub fn set_pin(&self, pin: String) -> bool {
        self.registry.update_rule(self.id, |r| r.set_pin(pin))
    }

    /// Apply several changes under one notification.
    pub(crate) fn update(&self, f: impl FnOnce(&mut Rule)) -> bool {
        self.registry.update_rule(self.id, f)
    }

    /// Delete the rule.
    pub fn revoke(&self) -> Option<Rule> {
        self.registry.remove_rule(self.id)
    }

    /// Trust level of the identity this rule names.
    pub fn trust_level(&self) -> TrustLevel {
        match self.snapshot() {
            Some(rule) => self.registry.trust_level(rule.identity()),
            None => TrustLevel::default(),
        }
    }
}

impl fmt::Debug for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{targets, RuleRecord};
    use crate::store::{InMemoryRuleStore, MemoryKeyStore};

    fn registry() -> (Arc<AuthorizationRegistry>, RuleEvents, Arc<InMemoryRuleStore>) {
        let store = Arc::new(InMemoryRuleStore::new());
        let (registry, events) = AuthorizationRegistry::new(store.clone());
        (registry, events, store)
    }

    #[test]
    fn test_set_policy_locks() {
        let (registry, _events, _store) = registry();
        assert!(registry.policy().is_none());
        assert!(registry.set_policy(PolicyStrategy::DenyAll));
        assert!(!registry.set_policy(PolicyStrategy::PinPairing));
        assert_eq!(registry.policy().map(|p| p.name()), Some("deny_all"));
    }

    #[test]
    fn test_add_identity_dedups_and_strips() {
        let (registry, _events, _store) = registry();
        let alice = Identity::generate("alice");

        assert!(registry.add_identity(&alice));
        assert!(!registry.add_identity(&alice));

        let stored = registry.identity(alice.id()).unwrap();
        assert!(!stored.has_private_key());
        assert!(registry.identity("nobody").is_none());
    }

    #[test]
    fn test_add_identity_rejects_invalid() {
        let (registry, _events, _store) = registry();
        let alice = Identity::generate("alice");
        let mut creds = alice.to_credentials();
        creds.id = "f".repeat(64);
        let forged = Identity::from_credentials(&creds).unwrap();

        assert!(!registry.add_identity(&forged));
        assert!(registry.identity(&creds.id).is_none());
    }

    #[test]
    fn test_specific_rule_beats_wide_rule_regardless_of_order() {
        let (registry, _events, _store) = registry();
        let wide = registry.add_rule(
            Rule::new("clock", "*")
                .with_policy(RulePolicy::Deny)
                .with_targets(targets::ALL_USERS),
        );
        let exact = registry.add_rule(Rule::new("clock", "alice").with_policy(RulePolicy::Allow));

        assert_eq!(registry.find_matching_rule("clock", "alice").unwrap().id(), exact.id());
        assert_eq!(registry.find_matching_rule("clock", "bob").unwrap().id(), wide.id());
        assert!(registry.find_matching_rule("camera", "bob").is_none());

        let (registry, _events, _store) = self::registry();
        let exact = registry.add_rule(Rule::new("clock", "alice").with_policy(RulePolicy::Allow));
        registry.add_rule(
            Rule::new("clock", "*")
                .with_policy(RulePolicy::Deny)
                .with_targets(targets::ALL_USERS),
        );
        assert_eq!(registry.find_matching_rule("clock", "alice").unwrap().id(), exact.id());
    }

    #[test]
    fn test_equal_specificity_first_added_wins() {
        let (registry, _events, _store) = registry();
        let first = registry.add_rule(Rule::new("clock", "*").with_targets(targets::ALL_USERS));
        registry.add_rule(Rule::new("clock", "alice").with_targets(targets::ALL_SERVICES));
        assert_eq!(registry.find_matching_rule("clock", "alice").unwrap().id(), first.id());
    }

    #[test]
    fn test_mutations_are_notified_not_applied_inline() {
        let (registry, mut events, _store) = registry();
        let rule = registry.add_rule(Rule::new("clock", "alice"));
        assert!(events.try_recv().is_err());

        assert!(rule.set_policy(RulePolicy::Allow));
        assert_eq!(events.try_recv().unwrap(), RuleEvent::Changed(rule.id()));

        assert!(rule.revoke().is_some());
        assert_eq!(events.try_recv().unwrap(), RuleEvent::Removed(rule.id()));
        assert!(!rule.set_policy(RulePolicy::Deny));
        assert!(!rule.exists());
    }

    #[tokio::test]
    async fn test_flush_debounces_saves() {
        let (registry, _events, store) = registry();
        let rule = registry.add_rule(
            Rule::new("clock", "alice").with_persistence(Persistence::Persistent),
        );
        rule.set_policy(RulePolicy::PinRequired);
        rule.set_pin("1234".into());
        rule.set_policy(RulePolicy::Allow);
        rule.set_targets(targets::ALL_SERVICES);

        assert!(registry.flush().await.unwrap());
        assert!(!registry.flush().await.unwrap());
        assert_eq!(store.save_count(), 1);

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].policy, RulePolicy::Allow.as_i32());
    }

    #[tokio::test]
    async fn test_transient_rules_never_saved() {
        let (registry, _events, store) = registry();
        let rule = registry.add_rule(Rule::new("clock", "alice"));
        rule.set_policy(RulePolicy::Allow);

        assert!(!registry.flush().await.unwrap());
        assert_eq!(store.save_count(), 0);

        // Turning persistent later makes it savable
        rule.set_persistence(Persistence::Persistent);
        assert!(registry.flush().await.unwrap());
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_load_rules_skips_malformed() {
        let good = Rule::new("clock", "alice")
            .with_policy(RulePolicy::Allow)
            .with_persistence(Persistence::Persistent)
            .to_record();
        let empty_service = RuleRecord {
            service_name: String::new(),
            ..good.clone()
        };
        let store = Arc::new(InMemoryRuleStore::with_records(vec![empty_service, good]));
        let (registry, _events) = AuthorizationRegistry::new(store);

        assert_eq!(registry.load_rules().await.unwrap(), 1);
        let rules = registry.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].1.service(), "clock");
        assert!(rules[0].1.is_persistent());
        assert!(registry.find_matching_rule("clock", "alice").is_some());
    }

    #[tokio::test]
    async fn test_local_identity_readiness() {
        let (registry, _events, _store) = registry();
        assert_eq!(
            registry.sign_local(SignatureScheme::Ed25519, b"x"),
            Err(AuthError::IdentityNotReady)
        );
        assert_eq!(registry.local_identity(), Err(AuthError::IdentityNotReady));

        let mut ready = registry.subscribe_ready();
        assert!(!*ready.borrow());

        let keystore = MemoryKeyStore::new();
        let local = registry.load_local_identity(&keystore, "workstation").await.unwrap();
        assert!(!local.has_private_key());
        assert!(registry.is_ready());
        ready.changed().await.unwrap();
        assert!(*ready.borrow());
        registry.wait_ready().await;

        let sig = registry.sign_local(SignatureScheme::Ed25519, b"x").unwrap();
        assert!(local.verify(&sig, b"x"));
        assert_eq!(registry.trust_level(local.id()), TrustLevel::SelfTrusted);

        // Ready fires once; a second load is refused
        assert!(registry.load_local_identity(&keystore, "workstation").await.is_err());
        assert!(!ready.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_local_identity_persists_across_registries() {
        let keystore = MemoryKeyStore::new();

        let (first, _events, _store) = registry();
        let id = first.load_local_identity(&keystore, "ws").await.unwrap().id().to_string();

        let (second, _events, _store) = registry();
        let again = second.load_local_identity(&keystore, "ignored").await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.name(), "ws");
    }

    #[test]
    fn test_trust_table() {
        let (registry, _events, _store) = registry();
        assert_eq!(registry.trust_level("alice"), TrustLevel::Unknown);
        registry.set_trust_level("alice", TrustLevel::FullyTrusted);
        assert_eq!(registry.trust_level("alice"), TrustLevel::FullyTrusted);

        let rule = registry.add_rule(Rule::new("clock", "alice"));
        assert_eq!(rule.trust_level(), TrustLevel::FullyTrusted);
    }
}
