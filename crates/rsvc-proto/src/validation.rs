//! Structural checks for inbound RPC messages.
//!
//! These run before any authorization work. They only look at field presence
//! and sizes; cryptographic checks happen later in the pipeline.

use crate::v1::{methods, MessageKindV1, RpcMessageV1};

/// Validation error types for RPC messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Message kind is not a request
    NotARequest { kind: i32 },
    /// Method name is not one a provider dispatches
    UnknownMethod { method: String },
    /// Required field is empty
    EmptyField { field: &'static str },
    /// Field size is out of allowed range
    SizeOutOfRange { field: &'static str, min: usize, max: usize, actual: usize },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotARequest { kind } => write!(f, "message kind {} is not a request", kind),
            Self::UnknownMethod { method } => write!(f, "unknown method '{}'", method),
            Self::EmptyField { field } => write!(f, "required field '{}' is empty", field),
            Self::SizeOutOfRange { field, min, max, actual } => {
                write!(f, "field '{}' size {} is out of range [{}, {}]", field, actual, min, max)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Field size limits.
pub mod sizes {
    /// Hex encoded SHA-256 identity id.
    pub const ID_HEX_LEN: usize = 64;
    /// Size of Ed25519 signatures.
    pub const ED25519_SIG_SIZE: usize = 64;
    /// Longest service or operation name accepted.
    pub const MAX_NAME_LEN: usize = 256;
    /// Longest connection instance id accepted.
    pub const MAX_UUID_LEN: usize = 128;
}

fn validate_not_empty(field: &'static str, data: &[u8]) -> ValidationResult<()> {
    if data.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(())
}

fn validate_size_range(field: &'static str, data: &[u8], min: usize, max: usize) -> ValidationResult<()> {
    if data.len() < min || data.len() > max {
        return Err(ValidationError::SizeOutOfRange {
            field,
            min,
            max,
            actual: data.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Validation trait and implementations
// ============================================================================

/// Trait for validating protocol messages.
pub trait Validate {
    /// Validate the message fields.
    fn validate(&self) -> ValidationResult<()>;
}

impl Validate for RpcMessageV1 {
    fn validate(&self) -> ValidationResult<()> {
        if self.kind != MessageKindV1::Request as i32 {
            return Err(ValidationError::NotARequest { kind: self.kind });
        }
        if !methods::ALL.contains(&self.method.as_str()) {
            return Err(ValidationError::UnknownMethod {
                method: self.method.clone(),
            });
        }
        validate_size_range("uuid", self.uuid.as_bytes(), 1, sizes::MAX_UUID_LEN)?;

        if self.method == methods::START_CONNECTION {
            validate_not_empty("credentials", &self.credentials)?;
            validate_size_range(
                "credentials_id",
                self.credentials_id.as_bytes(),
                sizes::ID_HEX_LEN,
                sizes::ID_HEX_LEN,
            )?;
            validate_not_empty("signature", &self.signature)?;
            return Ok(());
        }

        // Callers relying on an open rule may be anonymous, so identity fields
        // are checked later during authorization.
        validate_size_range("destination", self.destination.as_bytes(), 1, sizes::MAX_NAME_LEN)?;
        if self.method == methods::START_OPERATION_CALL {
            validate_size_range("operation", self.operation.as_bytes(), 1, sizes::MAX_NAME_LEN)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> RpcMessageV1 {
        let mut msg = RpcMessageV1::request(methods::START_CONNECTION);
        msg.uuid = "conn-1".into();
        msg.credentials = vec![1, 2, 3];
        msg.credentials_id = "a".repeat(sizes::ID_HEX_LEN);
        msg.signature = vec![0u8; sizes::ED25519_SIG_SIZE];
        msg
    }

    #[test]
    fn test_handshake_validation() {
        assert!(handshake().validate().is_ok());

        let mut missing = handshake();
        missing.credentials.clear();
        assert_eq!(
            missing.validate(),
            Err(ValidationError::EmptyField { field: "credentials" })
        );

        let mut short_id = handshake();
        short_id.credentials_id = "abc".into();
        assert!(matches!(
            short_id.validate(),
            Err(ValidationError::SizeOutOfRange { field: "credentials_id", .. })
        ));
    }

    #[test]
    fn test_call_validation() {
        let mut msg = RpcMessageV1::request(methods::START_OPERATION_CALL);
        msg.uuid = "conn-1".into();
        msg.destination = "clock".into();
        assert!(matches!(
            msg.validate(),
            Err(ValidationError::SizeOutOfRange { field: "operation", .. })
        ));

        msg.operation = "time".into();
        assert!(msg.validate().is_ok());

        msg.destination.clear();
        assert!(matches!(
            msg.validate(),
            Err(ValidationError::SizeOutOfRange { field: "destination", .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_method_and_replies() {
        let mut msg = RpcMessageV1::request("shutdown");
        msg.uuid = "conn-1".into();
        assert!(matches!(msg.validate(), Err(ValidationError::UnknownMethod { .. })));

        let mut reply = RpcMessageV1::reply(methods::GET_OPERATIONS);
        reply.uuid = "conn-1".into();
        assert!(matches!(reply.validate(), Err(ValidationError::NotARequest { .. })));
    }
}
