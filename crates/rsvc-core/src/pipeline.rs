//! Inbound authorization pipeline.
//!
//! Every request addressed to a published service passes through here. A
//! handshake (`startConnection`) registers the caller's identity and mints a
//! session token. Any other request goes through, in order:
//!
//! 1. the open rule for `(service, "*")`,
//! 2. the session token check,
//! 3. signature verification against the registered identity,
//! 4. rule resolution for the verified caller.
//!
//! Requests that cannot be decided yet wait as pending entries on their rule.
//! When the rule changes, the next [`AuthorizationPipeline::tick`] runs step 4
//! again for the first entry waiting on it.
//!
//! Only one reply channel is kept per `(identity, connection)` pair. A second
//! request on the same pair before the first is answered takes over the
//! channel and the first caller never gets a reply.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use constant_time_eq::constant_time_eq;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rsvc_crypto::identity::{Identity, SignatureScheme};
use rsvc_proto::v1::{methods, signed_payload_v1, RpcMessageV1};
use rsvc_proto::validation::Validate;
use rsvc_transport::{InboundCall, ReplySender};

use crate::errors::AuthError;
use crate::policy::prompt_for_pin;
use crate::registry::{AuthorizationRegistry, RuleEvent, RuleEvents};
use crate::rule::{Rule, RuleId, RulePolicy, WILDCARD_IDENTITY};
use crate::service::Service;

/// (caller identity id, connection instance id)
pub type SessionKey = (String, String);

/// A request waiting for its rule to be decided.
#[derive(Debug)]
struct PendingAuthorization {
    rule_id: RuleId,
    key: SessionKey,
    identity: Identity,
    message: RpcMessageV1,
}

#[derive(Debug)]
struct JobOutcome {
    job_id: u64,
    result: Result<Vec<u8>, String>,
}

/// Result of running rule resolution for one request.
enum Resolution {
    Reply(RpcMessageV1),
    /// An operation job was started; it replies when done.
    Deferred,
    Wait(PendingAuthorization),
}

enum Wake {
    Call(InboundCall),
    Event(RuleEvent),
    Job(JobOutcome),
    Closed,
}

pub struct AuthorizationPipeline {
    registry: Arc<AuthorizationRegistry>,
    rule_events: RuleEvents,
    services: HashMap<String, Arc<dyn Service>>,
    tokens: HashMap<SessionKey, String>,
    reply_channels: HashMap<SessionKey, ReplySender>,
    pending: Vec<PendingAuthorization>,
    pin_prompted: HashSet<RuleId>,
    jobs: HashMap<u64, SessionKey>,
    next_job_id: u64,
    job_tx: mpsc::UnboundedSender<JobOutcome>,
    job_rx: mpsc::UnboundedReceiver<JobOutcome>,
    queued_events: Vec<RuleEvent>,
    queued_jobs: Vec<JobOutcome>,
    scheme: SignatureScheme,
}

impl AuthorizationPipeline {
    pub fn new(registry: Arc<AuthorizationRegistry>, rule_events: RuleEvents) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            rule_events,
            services: HashMap::new(),
            tokens: HashMap::new(),
            reply_channels: HashMap::new(),
            pending: Vec::new(),
            pin_prompted: HashSet::new(),
            jobs: HashMap::new(),
            next_job_id: 1,
            job_tx,
            job_rx,
            queued_events: Vec::new(),
            queued_jobs: Vec::new(),
            scheme: SignatureScheme::default(),
        }
    }

    /// Verify request signatures with `scheme` instead of the default.
    pub fn with_signature_scheme(mut self, scheme: SignatureScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn registry(&self) -> &Arc<AuthorizationRegistry> {
        &self.registry
    }

    /// Make a service reachable under its name.
    pub fn publish(&mut self, service: Arc<dyn Service>) {
        info!(service = service.name(), "Service published");
        self.services.insert(service.name().to_string(), service);
    }

    /// Number of requests waiting for a rule decision.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ========================================================================
    // Entry point
    // ========================================================================

    /// Process one inbound request. Replies are sent now or later from
    /// [`AuthorizationPipeline::tick`].
    pub fn handle(&mut self, call: InboundCall) {
        let InboundCall { message, reply } = call;

        if let Err(e) = message.validate() {
            debug!(method = %message.method, error = %e, "Rejecting malformed request");
            let mut fault = AuthError::AccessDenied.to_fault(&message.method);
            fault.fault_text = e.to_string();
            reply.send(fault);
            return;
        }

        if message.method == methods::START_CONNECTION {
            let response = match self.start_connection(&message) {
                Ok(token) => {
                    let mut r = RpcMessageV1::reply(&message.method);
                    r.token = token;
                    r.uuid = message.uuid.clone();
                    r
                }
                Err(e) => e.to_fault(&message.method),
            };
            reply.send(response);
            return;
        }

        let key = (message.credentials_id.clone(), message.uuid.clone());
        if self.reply_channels.insert(key.clone(), reply).is_some() {
            warn!(
                identity = %key.0,
                connection = %key.1,
                "Second request before reply; earlier caller loses its reply"
            );
        }

        if let Some(response) = self.process(key.clone(), message) {
            self.send_reply(&key, response);
        }
    }

    fn start_connection(&mut self, message: &RpcMessageV1) -> Result<String, AuthError> {
        let identity = Identity::from_credentials_bytes(&message.credentials).map_err(|e| {
            debug!(error = %e, "Undecodable credentials");
            AuthError::AccessDenied
        })?;
        if !identity.is_valid() || identity.id() != message.credentials_id {
            warn!(claimed = %message.credentials_id, "Credentials id does not match key");
            return Err(AuthError::AccessDenied);
        }
        if !identity.verify_with(self.scheme, &message.signature, &signed_payload_v1(message)) {
            warn!(identity = identity.id(), "Handshake signature invalid");
            return Err(AuthError::AccessDenied);
        }

        self.registry.add_identity(&identity);
        let token = mint_token()?;
        self.tokens.insert(
            (identity.id().to_string(), message.uuid.clone()),
            token.clone(),
        );
        info!(identity = identity.id(), name = identity.name(), connection = %message.uuid, "Session token issued");
        Ok(token)
    }

    /// Steps 1 to 4 for a non-handshake request. `None` means the reply is
    /// deferred.
    fn process(&mut self, key: SessionKey, message: RpcMessageV1) -> Option<RpcMessageV1> {
        let service = message.destination.clone();

        // Open rule
        if let Some(open) = self
            .registry
            .find_matching_rule(&service, WILDCARD_IDENTITY)
            .and_then(|h| h.snapshot())
        {
            match open.policy() {
                RulePolicy::Allow => {
                    debug!(service = %service, "Open rule allows request");
                    return self.dispatch(&key, &message);
                }
                RulePolicy::Deny => {
                    debug!(service = %service, "Open rule denies request");
                    return Some(AuthError::AccessDenied.to_fault(&message.method));
                }
                _ => {}
            }
        }

        // Token
        if let Some(expected) = self.tokens.get(&key) {
            if !expected.is_empty() && !constant_time_eq(expected.as_bytes(), message.token.as_bytes()) {
                debug!(identity = %key.0, "Stale or foreign session token");
                return Some(AuthError::InvalidToken.to_fault(&message.method));
            }
        }

        // Signature
        let Some(identity) = self.registry.identity(&message.credentials_id) else {
            debug!(identity = %message.credentials_id, "Unknown caller");
            return Some(AuthError::AccessDenied.to_fault(&message.method));
        };
        if !identity.verify_with(self.scheme, &message.signature, &signed_payload_v1(&message)) {
            warn!(identity = identity.id(), "Request signature invalid");
            return Some(AuthError::AccessDenied.to_fault(&message.method));
        }

        let method = message.method.clone();
        match self.resolve(key, identity, message) {
            Resolution::Reply(reply) => Some(reply),
            Resolution::Deferred => None,
            Resolution::Wait(entry) => {
                debug!(rule_id = entry.rule_id, method = %method, "Request pending rule decision");
                self.pending.push(entry);
                None
            }
        }
    }

    /// Rule resolution for a verified caller.
    fn resolve(&mut self, key: SessionKey, identity: Identity, message: RpcMessageV1) -> Resolution {
        let service = message.destination.clone();
        let matched = self
            .registry
            .find_matching_rule(&service, identity.id())
            .and_then(|h| h.snapshot().map(|r| (h, r)));

        let Some((handle, rule)) = matched else {
            let handle = self.registry.add_rule(Rule::new(service.clone(), identity.id()));
            info!(
                rule_id = handle.id(),
                service = %service,
                identity = identity.id(),
                "No rule for caller; asking policy"
            );
            let rule_id = handle.id();
            // The strategy owns prompting for rules it decides
            self.pin_prompted.insert(rule_id);
            match self.registry.policy() {
                Some(strategy) => strategy.decide_inbound(handle),
                None => warn!(rule_id, "No policy strategy selected; request stays pending"),
            }
            return Resolution::Wait(PendingAuthorization {
                rule_id,
                key,
                identity,
                message,
            });
        };

        match rule.policy() {
            RulePolicy::Allow => match self.dispatch(&key, &message) {
                Some(reply) => Resolution::Reply(reply),
                None => Resolution::Deferred,
            },
            RulePolicy::Deny => Resolution::Reply(AuthError::AccessDenied.to_fault(&message.method)),
            RulePolicy::PinRequired => {
                if message.pin.is_empty() {
                    return Resolution::Reply(AuthError::RequirePin.to_fault(&message.method));
                }
                let Some(expected) = rule.pin() else {
                    // Local user has not entered the PIN yet. Rules loaded from
                    // the store never carry one, so ask once per rule.
                    if self.pin_prompted.insert(handle.id()) {
                        info!(rule_id = handle.id(), identity = identity.id(), "Asking local user for PIN");
                        prompt_for_pin(&handle);
                    }
                    return Resolution::Wait(PendingAuthorization {
                        rule_id: handle.id(),
                        key,
                        identity,
                        message,
                    });
                };
                if constant_time_eq(expected.as_bytes(), message.pin.as_bytes()) {
                    info!(rule_id = handle.id(), identity = identity.id(), "PIN accepted; rule now allows");
                    handle.set_policy(RulePolicy::Allow);
                    match self.dispatch(&key, &message) {
                        Some(reply) => Resolution::Reply(reply),
                        None => Resolution::Deferred,
                    }
                } else {
                    warn!(rule_id = handle.id(), identity = identity.id(), "Wrong PIN; revoking rule");
                    handle.revoke();
                    Resolution::Reply(AuthError::AccessDenied.to_fault(&message.method))
                }
            }
            RulePolicy::Unspecified => Resolution::Wait(PendingAuthorization {
                rule_id: handle.id(),
                key,
                identity,
                message,
            }),
        }
    }

    /// Run an authorized request against its service. `None` means an
    /// operation job was started.
    fn dispatch(&mut self, key: &SessionKey, message: &RpcMessageV1) -> Option<RpcMessageV1> {
        let method = message.method.as_str();
        let Some(service) = self.services.get(&message.destination).cloned() else {
            debug!(destination = %message.destination, "Unknown destination");
            let err = if method == methods::START_OPERATION_CALL {
                AuthError::OperationFailed(format!("unknown destination '{}'", message.destination))
            } else {
                AuthError::NoOperationsDescription
            };
            return Some(err.to_fault(method));
        };

        let mut reply = RpcMessageV1::reply(method);
        reply.uuid = message.uuid.clone();
        match method {
            methods::GET_OPERATIONS => match service.operations_description() {
                Some(description) => reply.operations_description = description,
                None => return Some(AuthError::NoOperationsDescription.to_fault(method)),
            },
            methods::GET_ENABLED_OPERATIONS => reply.enabled_operations = service.enabled_operations(),
            methods::START_OPERATION_CALL => {
                if !service.enabled_operations().contains(&message.operation) {
                    let err = AuthError::OperationFailed(format!(
                        "operation '{}' is not enabled",
                        message.operation
                    ));
                    return Some(err.to_fault(method));
                }
                let job_id = self.next_job_id;
                self.next_job_id += 1;
                self.jobs.insert(job_id, key.clone());
                debug!(job_id, service = service.name(), operation = %message.operation, "Starting operation");

                let job = service.start_operation(&message.operation, &message.parameters);
                let tx = self.job_tx.clone();
                tokio::spawn(async move {
                    let result = job.await;
                    let _ = tx.send(JobOutcome { job_id, result });
                });
                return None;
            }
            // Validation only lets known methods through
            other => {
                return Some(AuthError::AccessDenied.to_fault(other));
            }
        }
        Some(reply)
    }

    fn send_reply(&mut self, key: &SessionKey, reply: RpcMessageV1) {
        match self.reply_channels.remove(key) {
            Some(channel) => {
                if !channel.send(reply) {
                    debug!(identity = %key.0, connection = %key.1, "Caller went away before reply");
                }
            }
            None => warn!(
                identity = %key.0,
                connection = %key.1,
                method = %reply.method,
                "No reply channel for deferred reply; dropping"
            ),
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Apply everything that happened since the last tick: job completions,
    /// rule notifications, one registry save, then pending re-evaluation.
    pub async fn tick(&mut self) {
        let mut events = std::mem::take(&mut self.queued_events);
        while let Ok(event) = self.rule_events.try_recv() {
            events.push(event);
        }
        let mut outcomes = std::mem::take(&mut self.queued_jobs);
        while let Ok(outcome) = self.job_rx.try_recv() {
            outcomes.push(outcome);
        }

        for outcome in outcomes {
            self.finish_job(outcome);
        }

        if let Err(e) = self.registry.flush().await {
            warn!(error = %e, "Failed to save persistent rules");
        }

        // Notifications for the same rule within one tick count once
        let mut changed: Vec<RuleId> = Vec::new();
        for event in events {
            match event {
                RuleEvent::Changed(id) => {
                    if !changed.contains(&id) {
                        changed.push(id);
                    }
                }
                RuleEvent::Removed(id) => {
                    changed.retain(|c| *c != id);
                    self.pin_prompted.remove(&id);
                    let (dropped, kept): (Vec<_>, Vec<_>) =
                        std::mem::take(&mut self.pending).into_iter().partition(|p| p.rule_id == id);
                    self.pending = kept;
                    for entry in &dropped {
                        // Keep the channel if a later request on the same key still owns it
                        let in_use = self.pending.iter().any(|p| p.key == entry.key)
                            || self.jobs.values().any(|k| *k == entry.key);
                        if !in_use {
                            self.reply_channels.remove(&entry.key);
                        }
                    }
                    if !dropped.is_empty() {
                        info!(rule_id = id, dropped = dropped.len(), "Rule revoked; dropping pending requests");
                    }
                }
            }
        }

        for rule_id in changed {
            self.reevaluate(rule_id);
        }
    }

    /// Re-run rule resolution for the first request waiting on `rule_id`.
    fn reevaluate(&mut self, rule_id: RuleId) {
        // TODO: decide whether one change should release every request waiting
        // on the rule instead of only the oldest.
        let Some(index) = self.pending.iter().position(|p| p.rule_id == rule_id) else {
            return;
        };
        let entry = self.pending.remove(index);
        debug!(rule_id, identity = entry.identity.id(), "Re-evaluating pending request");

        let key = entry.key.clone();
        match self.resolve(entry.key, entry.identity, entry.message) {
            Resolution::Reply(reply) => self.send_reply(&key, reply),
            Resolution::Deferred => {}
            Resolution::Wait(entry) => self.pending.insert(index, entry),
        }
    }

    fn finish_job(&mut self, outcome: JobOutcome) {
        let Some(key) = self.jobs.remove(&outcome.job_id) else {
            warn!(job_id = outcome.job_id, "Completion for unknown job");
            return;
        };
        let reply = match outcome.result {
            Ok(result) => {
                let mut reply = RpcMessageV1::reply(methods::START_OPERATION_CALL);
                reply.result = result;
                reply.uuid = key.1.clone();
                reply
            }
            Err(text) => {
                debug!(job_id = outcome.job_id, error = %text, "Operation failed");
                AuthError::OperationFailed(text).to_fault(methods::START_OPERATION_CALL)
            }
        };
        self.send_reply(&key, reply);
    }

    /// Serve calls until the inbound channel closes.
    pub async fn run(mut self, mut calls: mpsc::Receiver<InboundCall>) {
        info!(services = self.services.len(), "Authorization pipeline running");
        loop {
            let wake = tokio::select! {
                call = calls.recv() => call.map_or(Wake::Closed, Wake::Call),
                Some(event) = self.rule_events.recv() => Wake::Event(event),
                Some(outcome) = self.job_rx.recv() => Wake::Job(outcome),
            };
            match wake {
                Wake::Call(call) => self.handle(call),
                Wake::Event(event) => self.queued_events.push(event),
                Wake::Job(outcome) => self.queued_jobs.push(outcome),
                Wake::Closed => break,
            }
            self.tick().await;
        }
        info!("Authorization pipeline stopped");
    }
}

/// Fresh session token: 32 random bytes, hex encoded.
fn mint_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| AuthError::OperationFailed(format!("token generation failed: {e}")))?;
    Ok(hex::encode(bytes))
}
