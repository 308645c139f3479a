//! Process-local callable registry
//!
//! Jobs reference their entry points by a symbolic `namespace.function`
//! identifier. The registry is populated once at startup; there is no
//! runtime reflection, and an unknown identifier is a permanent failure
//! the worker surfaces with exit code 2.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::EngineResult;

/// Context handed to every callable invocation
#[derive(Clone)]
pub struct JobContext {
    /// The run the worker opened for this invocation
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    /// Cooperative shutdown signal; long callables may poll it
    pub cancellation: CancellationToken,
}

/// Invocation payload: the stored arguments plus the run context
pub struct CallableInvocation {
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub context: JobContext,
}

pub type CallableFuture = Pin<Box<dyn Future<Output = EngineResult<String>> + Send>>;

pub type Callable = Arc<dyn Fn(CallableInvocation) -> CallableFuture + Send + Sync>;

/// Registry mapping symbolic identifiers to entry points
#[derive(Default)]
pub struct CallableRegistry {
    entries: RwLock<HashMap<String, Callable>>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `namespace.function` to an entry point; replaces any previous
    /// binding for the same identifier
    pub fn register<F>(&self, identifier: &str, callable: F)
    where
        F: Fn(CallableInvocation) -> CallableFuture + Send + Sync + 'static,
    {
        debug_assert!(
            identifier.contains('.'),
            "callable identifiers are namespace.function"
        );
        self.entries
            .write()
            .expect("callable registry lock poisoned")
            .insert(identifier.to_string(), Arc::new(callable));
    }

    pub fn resolve(&self, identifier: &str) -> Option<Callable> {
        self.entries
            .read()
            .expect("callable registry lock poisoned")
            .get(identifier)
            .cloned()
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .expect("callable registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
