//! Version 1 wire messages.
//!
//! A single envelope type, [`RpcMessageV1`], carries requests, replies and
//! faults. Field names follow the protocol vocabulary: `Destination`,
//! `Operation`, `Parameters`, `Credentials`, `CredentialsID`, `PIN`, `Result`,
//! `Signature`, `Token`, `UUID`, `EnabledOperations`, `OperationsDescription`.

use std::fmt;
use std::str::FromStr;

/// RPC method names understood by a service provider.
pub mod methods {
    /// Handshake: presents credentials and obtains a session token.
    pub const START_CONNECTION: &str = "startConnection";
    /// Fetch the service's operations description.
    pub const GET_OPERATIONS: &str = "getOperations";
    /// Fetch the names of currently enabled operations.
    pub const GET_ENABLED_OPERATIONS: &str = "getEnabledOperations";
    /// Invoke one operation of the service.
    pub const START_OPERATION_CALL: &str = "startOperationCall";

    /// Every method a provider dispatches.
    pub const ALL: [&str; 4] = [
        START_CONNECTION,
        GET_OPERATIONS,
        GET_ENABLED_OPERATIONS,
        START_OPERATION_CALL,
    ];
}

/// Kind of envelope on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageKindV1 {
    Request = 0,
    Reply = 1,
    Fault = 2,
}

/// Public part of an identity as transmitted in the `Credentials` field.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CredentialsV1 {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    /// Ed25519 public key bytes (32 bytes)
    #[prost(bytes = "vec", tag = "3")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
}

/// Request, reply or fault exchanged between a client and a service provider.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcMessageV1 {
    #[prost(enumeration = "MessageKindV1", tag = "1")]
    pub kind: i32,
    /// RPC method, one of [`methods`]
    #[prost(string, tag = "2")]
    pub method: ::prost::alloc::string::String,
    /// Name of the published service
    #[prost(string, tag = "3")]
    pub destination: ::prost::alloc::string::String,
    /// Service operation for `startOperationCall`
    #[prost(string, tag = "4")]
    pub operation: ::prost::alloc::string::String,
    /// Serialized call arguments
    #[prost(bytes = "vec", tag = "5")]
    pub parameters: ::prost::alloc::vec::Vec<u8>,
    /// Encoded [`CredentialsV1`] of the caller (handshake only)
    #[prost(bytes = "vec", tag = "6")]
    pub credentials: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "7")]
    pub credentials_id: ::prost::alloc::string::String,
    #[prost(string, tag = "8")]
    pub pin: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "9")]
    pub result: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "10")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "11")]
    pub token: ::prost::alloc::string::String,
    /// Connection instance id
    #[prost(string, tag = "12")]
    pub uuid: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "13")]
    pub enabled_operations: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(bytes = "vec", tag = "14")]
    pub operations_description: ::prost::alloc::vec::Vec<u8>,
    /// Fault code, see [`FaultCodeV1`]
    #[prost(string, tag = "15")]
    pub fault: ::prost::alloc::string::String,
    /// Human readable detail accompanying a fault
    #[prost(string, tag = "16")]
    pub fault_text: ::prost::alloc::string::String,
}

impl RpcMessageV1 {
    /// Start a request for the given method.
    pub fn request(method: &str) -> Self {
        Self {
            kind: MessageKindV1::Request as i32,
            method: method.to_string(),
            ..Default::default()
        }
    }

    /// Build an empty reply for the given method.
    pub fn reply(method: &str) -> Self {
        Self {
            kind: MessageKindV1::Reply as i32,
            method: method.to_string(),
            ..Default::default()
        }
    }

    /// Build a fault reply.
    pub fn fault(method: &str, code: FaultCodeV1, text: impl Into<String>) -> Self {
        Self {
            kind: MessageKindV1::Fault as i32,
            method: method.to_string(),
            fault: code.as_str().to_string(),
            fault_text: text.into(),
            ..Default::default()
        }
    }

    pub fn is_fault(&self) -> bool {
        self.kind() == MessageKindV1::Fault
    }

    /// Parsed fault code, if this is a fault carrying a known code.
    pub fn fault_code(&self) -> Option<FaultCodeV1> {
        if !self.is_fault() {
            return None;
        }
        self.fault.parse().ok()
    }
}

/// Fault codes returned in place of a successful reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCodeV1 {
    /// Session token does not match the one issued for this connection
    InvalidToken,
    /// The caller must supply a pairing PIN
    RequirePin,
    /// Authorization refused
    AccessDenied,
    /// The service has no operations description
    NoOperationsDescription,
    /// The invoked operation reported an error
    OperationFailed,
}

impl FaultCodeV1 {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCodeV1::InvalidToken => "InvalidToken",
            FaultCodeV1::RequirePin => "RequirePIN",
            FaultCodeV1::AccessDenied => "AccessDenied",
            FaultCodeV1::NoOperationsDescription => "NoOperationsDescription",
            FaultCodeV1::OperationFailed => "OperationFailed",
        }
    }
}

impl fmt::Display for FaultCodeV1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultCodeV1 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InvalidToken" => Ok(FaultCodeV1::InvalidToken),
            "RequirePIN" => Ok(FaultCodeV1::RequirePin),
            "AccessDenied" => Ok(FaultCodeV1::AccessDenied),
            "NoOperationsDescription" => Ok(FaultCodeV1::NoOperationsDescription),
            "OperationFailed" => Ok(FaultCodeV1::OperationFailed),
            other => Err(format!("unknown fault code: {other}")),
        }
    }
}

/// Bytes covered by a request signature.
///
/// Plain concatenation, in this exact order: method, Parameters, Credentials,
/// CredentialsID, Operation, OperationsDescription, PIN, Token. Existing signers
/// depend on the order; do not change it.
pub fn signed_payload_v1(msg: &RpcMessageV1) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        msg.method.len()
            + msg.parameters.len()
            + msg.credentials.len()
            + msg.credentials_id.len()
            + msg.operation.len()
            + msg.operations_description.len()
            + msg.pin.len()
            + msg.token.len(),
    );
    out.extend_from_slice(msg.method.as_bytes());
    out.extend_from_slice(&msg.parameters);
    out.extend_from_slice(&msg.credentials);
    out.extend_from_slice(msg.credentials_id.as_bytes());
    out.extend_from_slice(msg.operation.as_bytes());
    out.extend_from_slice(&msg.operations_description);
    out.extend_from_slice(msg.pin.as_bytes());
    out.extend_from_slice(msg.token.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_signed_payload_field_order() {
        let msg = RpcMessageV1 {
            method: "M".into(),
            parameters: b"P".to_vec(),
            credentials: b"C".to_vec(),
            credentials_id: "I".into(),
            operation: "O".into(),
            operations_description: b"D".to_vec(),
            pin: "N".into(),
            token: "T".into(),
            // Not covered by the signature
            destination: "ignored".into(),
            uuid: "ignored".into(),
            signature: b"ignored".to_vec(),
            ..Default::default()
        };

        assert_eq!(signed_payload_v1(&msg), b"MPCIODNT".to_vec());
    }

    #[test]
    fn test_fault_code_wire_names() {
        for code in [
            FaultCodeV1::InvalidToken,
            FaultCodeV1::RequirePin,
            FaultCodeV1::AccessDenied,
            FaultCodeV1::NoOperationsDescription,
            FaultCodeV1::OperationFailed,
        ] {
            assert_eq!(code.as_str().parse::<FaultCodeV1>(), Ok(code));
        }
        assert_eq!(FaultCodeV1::RequirePin.as_str(), "RequirePIN");
        assert!("Nope".parse::<FaultCodeV1>().is_err());
    }

    #[test]
    fn test_fault_message() {
        let msg = RpcMessageV1::fault(methods::GET_OPERATIONS, FaultCodeV1::RequirePin, "");
        assert!(msg.is_fault());
        assert_eq!(msg.fault_code(), Some(FaultCodeV1::RequirePin));

        let reply = RpcMessageV1::reply(methods::GET_OPERATIONS);
        assert!(!reply.is_fault());
        assert_eq!(reply.fault_code(), None);
    }

    #[test]
    fn test_message_encodes() {
        let mut msg = RpcMessageV1::request(methods::START_OPERATION_CALL);
        msg.destination = "clock".into();
        msg.enabled_operations = vec!["time".into(), "alarm".into()];

        let bytes = msg.encode_to_vec();
        let decoded = RpcMessageV1::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.kind(), MessageKindV1::Request);
        assert_eq!(decoded, msg);
    }
}
