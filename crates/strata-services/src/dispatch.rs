//! Routes inbound requests to the handler registered for their type.

use std::collections::HashMap;
use std::sync::Arc;

use strata_core::RequestType;

use crate::handler::RequestHandler;

/// Maps request types to handlers. Built once at startup, read-only after.
#[derive(Default)]
pub struct RequestDispatchTable {
    handlers: HashMap<RequestType, Arc<dyn RequestHandler>>,
}

impl RequestDispatchTable {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own request type, replacing any
    /// earlier handler for that type.
    pub fn register(&mut self, handler: Arc<dyn RequestHandler>) {
        let request_type = handler.request_type();
        if self.handlers.insert(request_type, handler).is_some() {
            tracing::warn!(%request_type, "replaced request handler");
        }
    }

    pub fn resolve(&self, request_type: RequestType) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(&request_type).cloned()
    }

    /// Resolve by wire name. Unknown names and known-but-unserved types
    /// both return `None`.
    pub fn resolve_name(&self, name: &str) -> Option<Arc<dyn RequestHandler>> {
        let request_type = name.parse::<RequestType>().ok()?;
        self.resolve(request_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
