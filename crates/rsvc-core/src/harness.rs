//! Test harness for rsvc core.
//!
//! Helpers shared by unit and integration tests: a provider wrapping a
//! registry and pipeline, a request signer, and a loop that drives the
//! pipeline until spawned jobs and rule notifications have settled.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use rsvc_crypto::identity::Identity;
use rsvc_proto::v1::{methods, signed_payload_v1, RpcMessageV1};
use rsvc_transport::InboundCall;

use crate::pipeline::AuthorizationPipeline;
use crate::policy::{PinRequest, PolicyStrategy};
use crate::registry::AuthorizationRegistry;
use crate::service::FnService;
use crate::store::InMemoryRuleStore;

/// Operations description published by [`clock_service`].
pub const CLOCK_DESCRIPTION: &[u8] = b"time() -> u64; echo(bytes) -> bytes; fail()";

/// A service named "clock" with a working, an echoing and a failing operation.
pub fn clock_service() -> FnService {
    FnService::new("clock")
        .with_description(CLOCK_DESCRIPTION.to_vec())
        .with_operation("time", |_| async move { Ok(1_700_000_000u64.to_be_bytes().to_vec()) })
        .with_operation("echo", |params| async move { Ok(params) })
        .with_operation("fail", |_| async move { Err("clock is broken".to_string()) })
}

/// Build a request from `identity` and sign it.
pub fn signed_request(
    identity: &Identity,
    method: &str,
    destination: &str,
    uuid: &str,
    token: &str,
    pin: &str,
) -> RpcMessageV1 {
    let mut msg = RpcMessageV1::request(method);
    msg.destination = destination.to_string();
    msg.uuid = uuid.to_string();
    msg.token = token.to_string();
    msg.pin = pin.to_string();
    msg.credentials_id = identity.id().to_string();
    if method == methods::START_CONNECTION {
        msg.credentials = identity.credentials_bytes();
    }
    msg.signature = identity.sign(&signed_payload_v1(&msg)).expect("identity can sign");
    msg
}

/// Drive the pipeline until spawned jobs and notifications have been handled.
pub async fn settle(pipeline: &mut AuthorizationPipeline) {
    for _ in 0..16 {
        pipeline.tick().await;
        tokio::task::yield_now().await;
    }
}

/// Answer every PIN prompt with `pin`.
pub fn spawn_pin_answerer(
    mut prompts: mpsc::UnboundedReceiver<PinRequest>,
    pin: impl Into<String>,
) -> JoinHandle<()> {
    let pin = pin.into();
    tokio::spawn(async move {
        while let Some(prompt) = prompts.recv().await {
            prompt.set_answer(pin.clone());
        }
    })
}

/// Service provider under test: registry plus pipeline with "clock" published.
pub struct TestProvider {
    registry: Arc<AuthorizationRegistry>,
    store: Arc<InMemoryRuleStore>,
    pipeline: AuthorizationPipeline,
}

impl TestProvider {
    pub fn new(strategy: PolicyStrategy) -> Self {
        Self::with_store(strategy, Arc::new(InMemoryRuleStore::new()))
    }

    pub fn with_store(strategy: PolicyStrategy, store: Arc<InMemoryRuleStore>) -> Self {
        let (registry, events) = AuthorizationRegistry::new(store.clone());
        registry.set_policy(strategy);
        let mut pipeline = AuthorizationPipeline::new(registry.clone(), events);
        pipeline.publish(Arc::new(clock_service()));
        Self {
            registry,
            store,
            pipeline,
        }
    }

    pub fn registry(&self) -> &Arc<AuthorizationRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<InMemoryRuleStore> {
        &self.store
    }

    pub fn pipeline_mut(&mut self) -> &mut AuthorizationPipeline {
        &mut self.pipeline
    }

    /// Hand a request to the pipeline without waiting for its reply.
    pub fn submit(&mut self, message: RpcMessageV1) -> oneshot::Receiver<RpcMessageV1> {
        let (call, rx) = InboundCall::new(message);
        self.pipeline.handle(call);
        rx
    }

    /// Submit, settle, and return the reply, which must have arrived.
    pub async fn request(&mut self, message: RpcMessageV1) -> RpcMessageV1 {
        let mut rx = self.submit(message);
        settle(&mut self.pipeline).await;
        rx.try_recv().expect("reply should have been sent")
    }

    /// Perform the handshake for `identity` and return the issued token.
    pub async fn handshake(&mut self, identity: &Identity, uuid: &str) -> String {
        let msg = signed_request(identity, methods::START_CONNECTION, "", uuid, "", "");
        let reply = self.request(msg).await;
        assert!(!reply.is_fault(), "handshake failed: {}", reply.fault);
        reply.token
    }

    pub async fn call_operation(
        &mut self,
        identity: &Identity,
        destination: &str,
        uuid: &str,
        token: &str,
        operation: &str,
        parameters: &[u8],
    ) -> RpcMessageV1 {
        let mut msg = RpcMessageV1::request(methods::START_OPERATION_CALL);
        msg.destination = destination.to_string();
        msg.uuid = uuid.to_string();
        msg.token = token.to_string();
        msg.operation = operation.to_string();
        msg.parameters = parameters.to_vec();
        msg.credentials_id = identity.id().to_string();
        msg.signature = identity.sign(&signed_payload_v1(&msg)).expect("identity can sign");
        self.request(msg).await
    }
}
