use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use courier_common::types::{NotificationRequest, NotificationStatus};

use super::{ListFilter, NotificationStore, StoreError, StoredNotification};

/// Process-local store. Used by tests and single-process deployments
/// without a database.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<Uuid, StoredNotification>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create(&self, request: NotificationRequest) -> Result<StoredNotification, StoreError> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(&request.id) {
            return Err(StoreError::AlreadyExists(request.id));
        }
        let stored = StoredNotification {
            request,
            resource_version: 1,
        };
        objects.insert(stored.id(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredNotification>, StoreError> {
        Ok(self.objects.read().await.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected_version: u64,
        status: &NotificationStatus,
    ) -> Result<u64, StoreError> {
        let mut objects = self.objects.write().await;
        let stored = objects.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if stored.resource_version != expected_version {
            return Err(StoreError::Conflict {
                id,
                expected: expected_version,
            });
        }
        stored.request.status = status.clone();
        stored.resource_version += 1;
        Ok(stored.resource_version)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<StoredNotification>, StoreError> {
        let objects = self.objects.read().await;
        let mut matching: Vec<StoredNotification> = objects
            .values()
            .filter(|s| filter.phase.is_none_or(|p| s.status().phase == p))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.request.created_at.cmp(&a.request.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>, StoreError> {
        let objects = self.objects.read().await;
        let mut unfinished: Vec<&StoredNotification> = objects
            .values()
            .filter(|s| !s.status().phase.is_terminal())
            .collect();
        unfinished.sort_by_key(|s| s.request.created_at);
        Ok(unfinished.into_iter().map(|s| s.id()).collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.objects.write().await.remove(&id).is_some())
    }
}
