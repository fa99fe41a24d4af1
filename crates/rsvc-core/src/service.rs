//! Published services.
//!
//! A service is a named set of operations. The pipeline asks it for its
//! operations description, for the names of the operations currently enabled,
//! and to start an operation. Starting returns a future that the pipeline runs
//! as a job; its outcome is sent back to the caller as the deferred reply.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

/// Outcome of one operation: result bytes or an error text for the caller.
pub type ServiceJob = Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>>;

/// A capability reachable by remote callers.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Opaque description of the operations, if the service publishes one.
    fn operations_description(&self) -> Option<Vec<u8>>;

    fn enabled_operations(&self) -> Vec<String>;

    /// Start `operation`. Only called for enabled operations.
    fn start_operation(&self, operation: &str, parameters: &[u8]) -> ServiceJob;
}

type Handler = Arc<dyn Fn(Vec<u8>) -> ServiceJob + Send + Sync>;

struct Operation {
    enabled: bool,
    handler: Handler,
}

/// Service built from closures, one per operation.
pub struct FnService {
    name: String,
    description: Option<Vec<u8>>,
    operations: RwLock<BTreeMap<String, Operation>>,
}

impl FnService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            operations: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_description(mut self, description: impl Into<Vec<u8>>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add an enabled operation.
    pub fn with_operation<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| -> ServiceJob { Box::pin(f(params)) });
        self.operations.write().insert(
            name.into(),
            Operation {
                enabled: true,
                handler,
            },
        );
        self
    }

    /// Enable or disable an operation. Returns false for unknown operations.
    pub fn set_enabled(&self, operation: &str, enabled: bool) -> bool {
        match self.operations.write().get_mut(operation) {
            Some(op) => {
                op.enabled = enabled;
                true
            }
            None => false,
        }
    }
}

impl Service for FnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations_description(&self) -> Option<Vec<u8>> {
        self.description.clone()
    }

    fn enabled_operations(&self) -> Vec<String> {
        self.operations
            .read()
            .iter()
            .filter(|(_, op)| op.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn start_operation(&self, operation: &str, parameters: &[u8]) -> ServiceJob {
        let handler = self
            .operations
            .read()
            .get(operation)
            .filter(|op| op.enabled)
            .map(|op| Arc::clone(&op.handler));
        match handler {
            Some(handler) => handler(parameters.to_vec()),
            None => {
                let operation = operation.to_string();
                Box::pin(async move { Err(format!("operation '{}' is not enabled", operation)) })
            }
        }
    }
}
