//! Testing utilities for transport implementations.

use crate::traits::{InboundCall, RpcTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rsvc_proto::v1::RpcMessageV1;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// In-process transport that hands requests straight to a provider's inbound
/// queue and waits for the reply.
pub struct LoopbackTransport {
    inbound: mpsc::Sender<InboundCall>,
    sent: Mutex<Vec<RpcMessageV1>>,
    connected: AtomicBool,
    latency: Duration,
    reply_timeout: Option<Duration>,
}

impl LoopbackTransport {
    /// Create a transport and the receiver a provider reads calls from.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<InboundCall>) {
        let (inbound, rx) = mpsc::channel(capacity.max(1));
        let transport = Self {
            inbound,
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            latency: Duration::ZERO,
            reply_timeout: None,
        };
        (transport, rx)
    }

    /// Configure simulated latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail calls whose reply takes longer than `timeout`.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// Get sent requests
    pub fn get_sent(&self) -> Vec<RpcMessageV1> {
        self.sent.lock().clone()
    }

    /// Clear sent requests
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Simulate disconnect
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Simulate connect
    pub fn connect(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl RpcTransport for LoopbackTransport {
    async fn call(&self, request: RpcMessageV1) -> Result<RpcMessageV1, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        self.sent.lock().push(request.clone());
        let (call, reply_rx) = InboundCall::new(request);
        self.inbound
            .send(call)
            .await
            .map_err(|_| TransportError::Disconnected)?;

        let reply = match self.reply_timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => reply_rx.await,
        };
        reply.map_err(|_| TransportError::ReplyLost)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
