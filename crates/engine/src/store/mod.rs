//! Durable storage for notification objects.
//!
//! Every stored object carries a `resource_version` that the store bumps on
//! each write. Status writes are conditional on the version the writer read,
//! which is what makes concurrent reconciles safe.

mod memory;
mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{NotificationRequest, NotificationStatus, Phase};

pub use memory::MemoryStore;
pub use postgres::PgNotificationStore;

/// A notification together with its version token.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNotification {
    pub request: NotificationRequest,
    pub resource_version: u64,
}

impl StoredNotification {
    pub fn id(&self) -> Uuid {
        self.request.id
    }

    pub fn status(&self) -> &NotificationStatus {
        &self.request.status
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub phase: Option<Phase>,
    pub limit: Option<usize>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("notification {0} not found")]
    NotFound(Uuid),

    #[error("notification {0} already exists")]
    AlreadyExists(Uuid),

    #[error("notification {id} was modified concurrently (expected version {expected})")]
    Conflict { id: Uuid, expected: u64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => AppError::NotFound(format!("Notification {} not found", id)),
            StoreError::AlreadyExists(id) => {
                AppError::Conflict(format!("Notification {} already exists", id))
            }
            StoreError::Conflict { .. } => AppError::Conflict(err.to_string()),
            StoreError::Database(e) => AppError::Database(e),
            StoreError::Serialization(e) => AppError::Store(e.to_string()),
        }
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a new object at version 1.
    async fn create(&self, request: NotificationRequest) -> Result<StoredNotification, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<StoredNotification>, StoreError>;

    /// Replace the status if the stored version still equals `expected_version`.
    /// Returns the new version.
    async fn update_status(
        &self,
        id: Uuid,
        expected_version: u64,
        status: &NotificationStatus,
    ) -> Result<u64, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<StoredNotification>, StoreError>;

    /// Ids of every notification not yet in a terminal phase, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use super::*;

    #[test]
    fn test_store_errors_map_to_http() {
        let id = Uuid::new_v4();
        let cases = [
            (StoreError::NotFound(id), StatusCode::NOT_FOUND),
            (StoreError::AlreadyExists(id), StatusCode::CONFLICT),
            (
                StoreError::Conflict { id, expected: 3 },
                StatusCode::CONFLICT,
            ),
        ];
        for (err, expected) in cases {
            let app: AppError = err.into();
            assert_eq!(app.into_response().status(), expected);
        }
    }
}
