//! rsvc core - authorization for remotely callable services.
//!
//! This crate implements:
//! - Authorization rules and their persistence
//! - Policy strategies for undecided requests
//! - The authorization registry (rules, identities, local identity)
//! - The inbound authorization pipeline for published services
//! - The outbound session client
//! - Provider configuration

#![forbid(unsafe_code)]

// Authorization state
pub mod rule;
pub mod policy;
pub mod registry;

// Request handling
pub mod service;
pub mod pipeline;
pub mod client;

// Infrastructure
pub mod store;
pub mod config;

// Supporting modules
pub mod errors;
pub mod harness;

pub use client::{ClientConfig, SessionClient, SessionState};
pub use errors::{AuthError, ClientError, RegistryError, StoreError};
pub use pipeline::AuthorizationPipeline;
pub use policy::{PolicyStrategy, TrustLevel};
pub use registry::{AuthorizationRegistry, RuleHandle};
pub use rule::{Rule, RulePolicy};
