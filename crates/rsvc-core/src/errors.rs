//! Error types for rsvc core.
//!
//! [`AuthError`] is the one family that crosses the wire: each variant that a
//! provider can report maps to a fault code, and a client maps fault replies
//! back into it.

use thiserror::Error;

use rsvc_proto::v1::{FaultCodeV1, RpcMessageV1};
use rsvc_transport::TransportError;

// ============================================================================
// Authorization errors
// ============================================================================

/// Authorization outcome errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Session token does not match the one issued for this connection
    #[error("invalid session token")]
    InvalidToken,

    /// A pairing PIN is required
    #[error("PIN required")]
    RequirePin,

    /// Unknown identity, bad signature, deny rule or wrong PIN
    #[error("access denied")]
    AccessDenied,

    /// The destination publishes no operations description
    #[error("no operations description")]
    NoOperationsDescription,

    /// The local identity has no private key
    #[error("signing unavailable: identity has no private key")]
    SigningUnavailable,

    /// The local identity has not been loaded yet
    #[error("local identity not ready")]
    IdentityNotReady,

    /// The operation itself reported an error
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl AuthError {
    /// Wire fault code for errors a provider reports to callers.
    pub fn fault_code(&self) -> Option<FaultCodeV1> {
        match self {
            AuthError::InvalidToken => Some(FaultCodeV1::InvalidToken),
            AuthError::RequirePin => Some(FaultCodeV1::RequirePin),
            AuthError::AccessDenied => Some(FaultCodeV1::AccessDenied),
            AuthError::NoOperationsDescription => Some(FaultCodeV1::NoOperationsDescription),
            AuthError::OperationFailed(_) => Some(FaultCodeV1::OperationFailed),
            AuthError::SigningUnavailable | AuthError::IdentityNotReady => None,
        }
    }

    pub fn from_fault(code: FaultCodeV1, text: &str) -> Self {
        match code {
            FaultCodeV1::InvalidToken => AuthError::InvalidToken,
            FaultCodeV1::RequirePin => AuthError::RequirePin,
            FaultCodeV1::AccessDenied => AuthError::AccessDenied,
            FaultCodeV1::NoOperationsDescription => AuthError::NoOperationsDescription,
            FaultCodeV1::OperationFailed => AuthError::OperationFailed(text.to_string()),
        }
    }

    /// Build the fault reply for `method`.
    ///
    /// Local-only errors never reach a caller as themselves; they are reported
    /// as `AccessDenied`.
    pub fn to_fault(&self, method: &str) -> RpcMessageV1 {
        let code = self.fault_code().unwrap_or(FaultCodeV1::AccessDenied);
        let text = match self {
            AuthError::OperationFailed(text) => text.clone(),
            _ => String::new(),
        };
        RpcMessageV1::fault(method, code, text)
    }
}

// ============================================================================
// Storage and registry errors
// ============================================================================

/// Storage errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying I/O failed
    #[error("io error: {0}")]
    Io(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persisted document has a version this build does not read
    #[error("unsupported document version {0}")]
    UnsupportedVersion(u32),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("rule not found: {0}")]
    RuleNotFound(u64),

    #[error("invalid rule: {0}")]
    InvalidRule(String),
}

// ============================================================================
// Client errors
// ============================================================================

/// Errors surfaced by an outbound session client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The provider answered with something the client cannot use
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session worker has stopped
    #[error("session closed")]
    Closed,
}

impl ClientError {
    /// Convert a fault reply into a client error.
    pub fn from_fault_reply(reply: &RpcMessageV1) -> Self {
        match reply.fault_code() {
            Some(code) => ClientError::Auth(AuthError::from_fault(code, &reply.fault_text)),
            None => ClientError::Protocol(format!("unknown fault '{}'", reply.fault)),
        }
    }
}
