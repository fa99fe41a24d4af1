//! Policy strategies for undecided authorization requests.
//!
//! When an inbound request matches no rule, the pipeline creates an Unspecified
//! rule and hands it to the active [`PolicyStrategy`]. The strategy decides by
//! mutating the rule through its [`RuleHandle`]. The same strategy answers the
//! outbound side when a provider asks this process for a pairing PIN.
//!
//! Interactive prompts never block: they are queued as [`PinRequest`]s on a
//! [`PinPrompter`] channel and completed whenever the user answers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::registry::RuleHandle;
use crate::rule::{targets, RulePolicy};

// ============================================================================
// Trust levels
// ============================================================================

/// How much an identity is trusted, from least to most.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Unverifiable,
    CompletelyUntrusted,
    /// Default for identities nobody has vouched for.
    #[default]
    Unknown,
    UserTrusted,
    /// The local identity.
    SelfTrusted,
    FullyTrusted,
    Ultimate,
}

/// Trust must exceed this level for the trusted shortcut.
pub const TRUST_THRESHOLD: TrustLevel = TrustLevel::Unknown;

impl TrustLevel {
    pub fn is_trusted(self) -> bool {
        self > TRUST_THRESHOLD
    }
}

// ============================================================================
// PIN prompts
// ============================================================================

/// What a PIN prompt is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinContext {
    /// A remote caller wants to pair with a local service.
    Inbound {
        service: String,
        identity_id: String,
        identity_name: String,
    },
    /// A remote provider asked this process for the PIN it displays.
    Outbound { destination: String },
}

enum PinResponder {
    Rule(RuleHandle),
    Client(oneshot::Sender<String>),
}

/// A pending interactive PIN prompt.
///
/// Answer with [`PinRequest::set_answer`]; dropping the request cancels it.
pub struct PinRequest {
    context: PinContext,
    responder: PinResponder,
}

impl PinRequest {
    pub fn context(&self) -> &PinContext {
        &self.context
    }

    /// Complete the prompt. Returns false if nobody is waiting any more.
    pub fn set_answer(self, pin: impl Into<String>) -> bool {
        let pin = pin.into();
        match self.responder {
            PinResponder::Rule(rule) => rule.set_pin(pin),
            PinResponder::Client(tx) => tx.send(pin).is_ok(),
        }
    }

    /// Give up on the prompt.
    pub fn cancel(self) {
        debug!(context = ?self.context, "PIN prompt cancelled");
    }
}

impl fmt::Debug for PinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinRequest")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Sending side of the PIN prompt queue; the UI owns the receiver.
#[derive(Debug, Clone)]
pub struct PinPrompter {
    tx: mpsc::UnboundedSender<PinRequest>,
}

impl PinPrompter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PinRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Ask the local user for the PIN a caller must present to `rule`.
    pub fn prompt_inbound(&self, rule: RuleHandle, identity_name: String) -> bool {
        let Some(snapshot) = rule.snapshot() else {
            return false;
        };
        let request = PinRequest {
            context: PinContext::Inbound {
                service: snapshot.service().to_string(),
                identity_id: snapshot.identity().to_string(),
                identity_name,
            },
            responder: PinResponder::Rule(rule),
        };
        self.tx.send(request).is_ok()
    }

    /// Ask the local user for the PIN shown by `destination`.
    pub fn prompt_outbound(&self, destination: &str) -> Option<oneshot::Receiver<String>> {
        let (tx, rx) = oneshot::channel();
        let request = PinRequest {
            context: PinContext::Outbound {
                destination: destination.to_string(),
            },
            responder: PinResponder::Client(tx),
        };
        self.tx.send(request).ok()?;
        Some(rx)
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// Outbound PIN request raised by a session client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPinRequest {
    pub destination: String,
    pub local_identity_id: String,
}

/// Externally supplied decision logic.
#[async_trait]
pub trait AuthorizationInterface: Send + Sync {
    /// A new Unspecified rule needs a decision. Decide by mutating `rule`,
    /// now or later.
    fn authorization_request(&self, rule: RuleHandle);

    /// A provider asked for a PIN. `None` aborts the connection.
    async fn client_pin_request(&self, request: ClientPinRequest) -> Option<String>;
}

/// How undecided requests are resolved.
#[derive(Clone)]
pub enum PolicyStrategy {
    /// Refuse everything without asking.
    DenyAll,
    /// Allow trusted callers to every service; leave the rest undecided.
    TrustedOnly,
    /// Trusted callers as above; everyone else pairs with a PIN.
    PinPairing,
    /// Delegate to an external implementation.
    Custom(Arc<dyn AuthorizationInterface>),
}

impl PolicyStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyStrategy::DenyAll => "deny_all",
            PolicyStrategy::TrustedOnly => "trusted_only",
            PolicyStrategy::PinPairing => "pin_pairing",
            PolicyStrategy::Custom(_) => "custom",
        }
    }

    /// Decide a freshly created Unspecified rule.
    pub fn decide_inbound(&self, rule: RuleHandle) {
        match self {
            PolicyStrategy::DenyAll => {
                info!(rule_id = rule.id(), "Denying unmatched request");
                rule.set_policy(RulePolicy::Deny);
            }
            PolicyStrategy::TrustedOnly => {
                if !grant_if_trusted(&rule) {
                    info!(rule_id = rule.id(), "Caller not trusted; request stays undecided");
                }
            }
            PolicyStrategy::PinPairing => {
                if grant_if_trusted(&rule) {
                    return;
                }
                rule.set_policy(RulePolicy::PinRequired);
                prompt_for_pin(&rule);
            }
            PolicyStrategy::Custom(iface) => iface.authorization_request(rule),
        }
    }

    /// Obtain the PIN a remote provider requires.
    pub async fn outbound_pin(
        &self,
        prompter: Option<PinPrompter>,
        request: ClientPinRequest,
    ) -> Option<String> {
        match self {
            PolicyStrategy::DenyAll => None,
            PolicyStrategy::TrustedOnly | PolicyStrategy::PinPairing => {
                let rx = prompter?.prompt_outbound(&request.destination)?;
                rx.await.ok()
            }
            PolicyStrategy::Custom(iface) => iface.client_pin_request(request).await,
        }
    }
}

impl fmt::Debug for PolicyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ask the local user, through the registry's prompter, for the PIN callers
/// of `rule` must present. Returns whether a prompt was queued.
pub(crate) fn prompt_for_pin(rule: &RuleHandle) -> bool {
    let registry = rule.registry();
    let name = rule
        .snapshot()
        .and_then(|r| registry.identity(r.identity()))
        .map(|i| i.name().to_string())
        .unwrap_or_default();
    match registry.pin_prompter() {
        Some(prompter) => {
            let queued = prompter.prompt_inbound(rule.clone(), name);
            if !queued {
                warn!(rule_id = rule.id(), "PIN prompt receiver closed");
            }
            queued
        }
        None => {
            warn!(rule_id = rule.id(), "No PIN prompter installed");
            false
        }
    }
}

fn grant_if_trusted(rule: &RuleHandle) -> bool {
    let level = rule.trust_level();
    if !level.is_trusted() {
        return false;
    }
    debug!(rule_id = rule.id(), ?level, "Trusted caller; allowing all services");
    rule.update(|r| {
        r.set_policy(RulePolicy::Allow);
        r.set_targets(targets::ALL_SERVICES);
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_ordering() {
        assert!(TrustLevel::Unverifiable < TrustLevel::CompletelyUntrusted);
        assert!(TrustLevel::UserTrusted > TrustLevel::Unknown);
        assert!(TrustLevel::Ultimate > TrustLevel::FullyTrusted);
        assert!(!TrustLevel::Unknown.is_trusted());
        assert!(!TrustLevel::CompletelyUntrusted.is_trusted());
        assert!(TrustLevel::UserTrusted.is_trusted());
        assert!(TrustLevel::SelfTrusted.is_trusted());
        assert_eq!(TrustLevel::default(), TrustLevel::Unknown);
    }

    #[tokio::test]
    async fn test_outbound_prompt_answer() {
        let (prompter, mut prompts) = PinPrompter::channel();
        let request = ClientPinRequest {
            destination: "clock".into(),
            local_identity_id: "me".into(),
        };

        let answer = tokio::spawn(async move {
            let prompt = prompts.recv().await.unwrap();
            assert_eq!(
                prompt.context(),
                &PinContext::Outbound { destination: "clock".into() }
            );
            assert!(prompt.set_answer("4271"));
        });

        let pin = PolicyStrategy::PinPairing
            .outbound_pin(Some(prompter), request)
            .await;
        assert_eq!(pin.as_deref(), Some("4271"));
        answer.await.unwrap();
    }

    #[tokio::test]
    async fn test_outbound_without_prompt() {
        let request = ClientPinRequest {
            destination: "clock".into(),
            local_identity_id: "me".into(),
        };
        let (prompter, mut prompts) = PinPrompter::channel();

        // DenyAll never prompts
        assert_eq!(
            PolicyStrategy::DenyAll
                .outbound_pin(Some(prompter.clone()), request.clone())
                .await,
            None
        );
        assert!(prompts.try_recv().is_err());

        // No prompter installed
        assert_eq!(PolicyStrategy::TrustedOnly.outbound_pin(None, request.clone()).await, None);

        // Cancelled prompt
        let cancel = tokio::spawn(async move {
            prompts.recv().await.unwrap().cancel();
        });
        assert_eq!(PolicyStrategy::TrustedOnly.outbound_pin(Some(prompter), request).await, None);
        cancel.await.unwrap();
    }

    struct FixedPin;

    #[async_trait]
    impl AuthorizationInterface for FixedPin {
        fn authorization_request(&self, rule: RuleHandle) {
            rule.set_policy(RulePolicy::Allow);
        }

        async fn client_pin_request(&self, _request: ClientPinRequest) -> Option<String> {
            Some("1234".into())
        }
    }

    #[tokio::test]
    async fn test_custom_strategy_delegates() {
        let strategy = PolicyStrategy::Custom(Arc::new(FixedPin));
        assert_eq!(format!("{:?}", strategy), "custom");
        let pin = strategy
            .outbound_pin(
                None,
                ClientPinRequest {
                    destination: "clock".into(),
                    local_identity_id: "me".into(),
                },
            )
            .await;
        assert_eq!(pin.as_deref(), Some("1234"));
    }
}
