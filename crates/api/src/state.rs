//! Shared application state for the Axum API server.

use std::sync::Arc;

use courier_engine::audit::AuditEmitter;
use courier_engine::store::NotificationStore;
use courier_engine::worker::WorkQueue;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn NotificationStore>,
    /// Present when the API runs inside the controller process.
    pub queue: Option<WorkQueue>,
    pub audit: Option<AuditEmitter>,
}

impl AppState {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self {
            store,
            queue: None,
            audit: None,
        }
    }

    pub fn with_queue(mut self, queue: WorkQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_audit(mut self, audit: AuditEmitter) -> Self {
        self.audit = Some(audit);
        self
    }
}
