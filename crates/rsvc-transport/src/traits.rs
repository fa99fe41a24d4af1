//! Transport traits for request/reply exchange.

use async_trait::async_trait;
use tokio::sync::oneshot;

use rsvc_proto::v1::RpcMessageV1;

/// Client side of a connection to a service provider.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send a request and wait for its reply or fault.
    async fn call(&self, request: RpcMessageV1) -> Result<RpcMessageV1, TransportError>;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;
}

/// A request delivered to a service provider together with its reply path.
#[derive(Debug)]
pub struct InboundCall {
    pub message: RpcMessageV1,
    pub reply: ReplySender,
}

impl InboundCall {
    /// Wrap a request, returning the receiver its reply will arrive on.
    pub fn new(message: RpcMessageV1) -> (Self, oneshot::Receiver<RpcMessageV1>) {
        let (reply, rx) = ReplySender::channel();
        (Self { message, reply }, rx)
    }
}

/// One-shot reply channel for a single inbound request.
#[derive(Debug)]
pub struct ReplySender(oneshot::Sender<RpcMessageV1>);

impl ReplySender {
    pub fn channel() -> (Self, oneshot::Receiver<RpcMessageV1>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Deliver the reply. Returns false if the caller has gone away.
    pub fn send(self, message: RpcMessageV1) -> bool {
        self.0.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Common transport error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("Reply channel dropped before a reply was sent")]
    ReplyLost,

    #[error("Other error: {0}")]
    Other(String),
}
