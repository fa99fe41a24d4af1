//! Outbound session client.
//!
//! A [`SessionClient`] connects to one destination service on a provider:
//!
//! ```text
//! NotConnected -> AwaitingToken -> AwaitingOperations -> Ready
//!                                        |  ^
//!                                        v  |
//!                                     AwaitingPin
//! ```
//!
//! Any step can end in `Failed`. The connection runs in a spawned worker task;
//! the handle only sends commands to it. Calls made before the session is
//! ready are queued and sent in order once it is. While ready, the worker
//! periodically refreshes the list of enabled operations; a call made during
//! a refresh waits for it, so the session never has two requests in flight.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use rsvc_crypto::identity::SignatureScheme;
use rsvc_proto::v1::{methods, signed_payload_v1, RpcMessageV1};
use rsvc_transport::RpcTransport;

use crate::errors::{AuthError, ClientError};
use crate::policy::ClientPinRequest;
use crate::registry::AuthorizationRegistry;

/// Default interval between enabled-operation refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Session client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service to connect to
    pub destination: String,
    pub refresh_interval: Duration,
    pub scheme: SignatureScheme,
    /// Connection instance id; a random UUID when unset
    pub connection_id: Option<String>,
}

impl ClientConfig {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            scheme: SignatureScheme::default(),
            connection_id: None,
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_signature_scheme(mut self, scheme: SignatureScheme) -> Self {
        self.scheme = scheme;
        self
    }
}

/// Connection state of a session client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NotConnected,
    AwaitingToken,
    AwaitingOperations,
    AwaitingPin,
    Ready,
    Failed(ClientError),
}

/// What the client has learned about the destination.
#[derive(Debug, Default)]
struct SessionView {
    operations_description: Option<Vec<u8>>,
    enabled: BTreeMap<String, bool>,
}

type CallReply = oneshot::Sender<Result<Vec<u8>, ClientError>>;

enum Command {
    Call {
        operation: String,
        parameters: Vec<u8>,
        reply: CallReply,
    },
    Shutdown,
}

/// Handle to a session worker. Cheap to clone.
#[derive(Clone)]
pub struct SessionClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    view: Arc<Mutex<SessionView>>,
}

impl SessionClient {
    /// Start a session worker for `config.destination`.
    pub fn spawn(
        registry: Arc<AuthorizationRegistry>,
        transport: Arc<dyn RpcTransport>,
        config: ClientConfig,
    ) -> (SessionClient, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::NotConnected);
        let view = Arc::new(Mutex::new(SessionView::default()));
        let connection_id = config
            .connection_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let worker = SessionWorker {
            registry,
            transport,
            config,
            connection_id,
            token: String::new(),
            state: state_tx,
            view: view.clone(),
            commands: command_rx,
        };
        let task = tokio::spawn(worker.run());

        (
            SessionClient {
                commands,
                state,
                view,
            },
            task,
        )
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Wait until the session is ready or has failed.
    pub async fn wait_ready(&self) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        let current = state
            .wait_for(|s| matches!(s, SessionState::Ready | SessionState::Failed(_)))
            .await
            .map_err(|_| ClientError::Closed)?
            .clone();
        match current {
            SessionState::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Invoke an operation and wait for its result.
    pub async fn call(&self, operation: &str, parameters: &[u8]) -> Result<Vec<u8>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                operation: operation.to_string(),
                parameters: parameters.to_vec(),
                reply,
            })
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Whether the last refresh reported `operation` as enabled.
    pub fn is_operation_enabled(&self, operation: &str) -> bool {
        self.view.lock().enabled.get(operation).copied().unwrap_or(false)
    }

    pub fn enabled_operations(&self) -> Vec<String> {
        self.view
            .lock()
            .enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(op, _)| op.clone())
            .collect()
    }

    pub fn operations_description(&self) -> Option<Vec<u8>> {
        self.view.lock().operations_description.clone()
    }

    /// Ask the worker to stop. Queued calls fail with `Closed`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

// ============================================================================
// Worker
// ============================================================================

struct SessionWorker {
    registry: Arc<AuthorizationRegistry>,
    transport: Arc<dyn RpcTransport>,
    config: ClientConfig,
    connection_id: String,
    token: String,
    state: watch::Sender<SessionState>,
    view: Arc<Mutex<SessionView>>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SessionWorker {
    async fn run(mut self) {
        self.registry.wait_ready().await;

        if let Err(err) = self.connect().await {
            warn!(destination = %self.config.destination, error = %err, "Session failed");
            self.set_state(SessionState::Failed(err.clone()));
            while let Some(command) = self.commands.recv().await {
                match command {
                    Command::Call { reply, .. } => {
                        let _ = reply.send(Err(err.clone()));
                    }
                    Command::Shutdown => break,
                }
            }
            return;
        }

        info!(destination = %self.config.destination, connection = %self.connection_id, "Session ready");
        self.set_state(SessionState::Ready);
        self.serve().await;
        debug!(destination = %self.config.destination, "Session worker stopped");
    }

    fn set_state(&self, state: SessionState) {
        debug!(destination = %self.config.destination, ?state, "Session state");
        self.state.send_replace(state);
    }

    /// Handshake and operations fetch, with one PIN retry.
    async fn connect(&mut self) -> Result<(), ClientError> {
        self.set_state(SessionState::AwaitingToken);
        let local = self.registry.local_identity()?;
        let mut handshake = RpcMessageV1::request(methods::START_CONNECTION);
        handshake.credentials = local.credentials_bytes();
        let reply = self.send(self.sign(handshake)?).await?;
        if reply.token.is_empty() {
            return Err(ClientError::Protocol("handshake reply without token".into()));
        }
        self.token = reply.token;

        self.set_state(SessionState::AwaitingOperations);
        let request = self.sign(RpcMessageV1::request(methods::GET_OPERATIONS))?;
        let reply = match self.send(request).await {
            Err(ClientError::Auth(AuthError::RequirePin)) => {
                self.set_state(SessionState::AwaitingPin);
                let pin = self.request_pin(local.id()).await?;
                self.set_state(SessionState::AwaitingOperations);
                let mut retry = RpcMessageV1::request(methods::GET_OPERATIONS);
                retry.pin = pin;
                self.send(self.sign(retry)?).await?
            }
            other => other?,
        };
        self.view.lock().operations_description = Some(reply.operations_description);
        Ok(())
    }

    async fn request_pin(&self, local_id: &str) -> Result<String, ClientError> {
        let Some(strategy) = self.registry.policy() else {
            warn!("PIN requested but no policy strategy selected");
            return Err(AuthError::RequirePin.into());
        };
        let request = ClientPinRequest {
            destination: self.config.destination.clone(),
            local_identity_id: local_id.to_string(),
        };
        info!(destination = %self.config.destination, "Provider requires a PIN");
        strategy
            .outbound_pin(self.registry.pin_prompter(), request)
            .await
            .ok_or(ClientError::Auth(AuthError::RequirePin))
    }

    async fn serve(&mut self) {
        let mut interval = tokio::time::interval(self.config.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let (refresh_tx, mut refresh_rx) = mpsc::channel(1);
        let mut refreshing = false;
        let mut held: VecDeque<(String, Vec<u8>, CallReply)> = VecDeque::new();

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Call { operation, parameters, reply }) => {
                        if refreshing {
                            held.push_back((operation, parameters, reply));
                        } else {
                            let result = self.execute(&operation, &parameters).await;
                            let _ = reply.send(result);
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(result) = refresh_rx.recv() => {
                    refreshing = false;
                    self.reconcile(result);
                    while let Some((operation, parameters, reply)) = held.pop_front() {
                        let result = self.execute(&operation, &parameters).await;
                        let _ = reply.send(result);
                    }
                }
                _ = interval.tick() => {
                    if refreshing {
                        debug!("Refresh still in flight; skipping tick");
                        continue;
                    }
                    match self.sign(RpcMessageV1::request(methods::GET_ENABLED_OPERATIONS)) {
                        Ok(request) => {
                            refreshing = true;
                            let transport = self.transport.clone();
                            let tx = refresh_tx.clone();
                            tokio::spawn(async move {
                                let result = exchange(transport.as_ref(), request).await;
                                let _ = tx.send(result).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "Cannot sign refresh request"),
                    }
                }
            }
        }

        for (_, _, reply) in held {
            let _ = reply.send(Err(ClientError::Closed));
        }
    }

    fn reconcile(&self, result: Result<RpcMessageV1, ClientError>) {
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(destination = %self.config.destination, error = %e, "Enabled operations refresh failed");
                return;
            }
        };
        let mut view = self.view.lock();
        for (operation, enabled) in view.enabled.iter_mut() {
            let now = reply.enabled_operations.contains(operation);
            if *enabled != now {
                debug!(operation = %operation, enabled = now, "Operation availability changed");
                *enabled = now;
            }
        }
        for operation in &reply.enabled_operations {
            view.enabled.entry(operation.clone()).or_insert(true);
        }
    }

    async fn execute(&self, operation: &str, parameters: &[u8]) -> Result<Vec<u8>, ClientError> {
        let mut request = RpcMessageV1::request(methods::START_OPERATION_CALL);
        request.operation = operation.to_string();
        request.parameters = parameters.to_vec();
        let reply = self.send(self.sign(request)?).await?;
        Ok(reply.result)
    }

    /// Fill in session fields and sign.
    fn sign(&self, mut request: RpcMessageV1) -> Result<RpcMessageV1, ClientError> {
        let local = self.registry.local_identity()?;
        request.destination = self.config.destination.clone();
        request.uuid = self.connection_id.clone();
        request.credentials_id = local.id().to_string();
        request.token = self.token.clone();
        request.signature = self
            .registry
            .sign_local(self.config.scheme, &signed_payload_v1(&request))?;
        Ok(request)
    }

    async fn send(&self, request: RpcMessageV1) -> Result<RpcMessageV1, ClientError> {
        exchange(self.transport.as_ref(), request).await
    }
}

async fn exchange(
    transport: &dyn RpcTransport,
    request: RpcMessageV1,
) -> Result<RpcMessageV1, ClientError> {
    let reply = transport.call(request).await?;
    if reply.is_fault() {
        return Err(ClientError::from_fault_reply(&reply));
    }
    Ok(reply)
}
