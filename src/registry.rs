use crate::transport::MessageHandler;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub const LOCAL_SCHEME: &str = "local://";

pub fn local_endpoint(identity: &str) -> String {
    format!("{}{}", LOCAL_SCHEME, identity)
}

#[derive(Default)]
pub struct AgentRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let endpoint = endpoint.into();
        info!(endpoint = %endpoint, "handler registered");
        self.handlers.write().insert(endpoint, handler);
    }

    pub fn deregister(&self, endpoint: &str) -> bool {
        self.handlers.write().remove(endpoint).is_some()
    }

    pub fn resolve(&self, endpoint: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(endpoint).cloned()
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.handlers.read().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Drops every handler. Later exchanges to these endpoints fail as unavailable.
    pub fn shutdown(&self) {
        let removed = {
            let mut handlers = self.handlers.write();
            let count = handlers.len();
            handlers.clear();
            count
        };
        info!(removed, "agent registry shut down");
    }
}
