use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use courier_common::types::{NotificationRequest, NotificationSpec, NotificationStatus};

use super::{ListFilter, NotificationStore, StoreError, StoredNotification};

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    spec: Json<NotificationSpec>,
    status: Json<NotificationStatus>,
    resource_version: i64,
    created_at: DateTime<Utc>,
}

impl From<NotificationRow> for StoredNotification {
    fn from(row: NotificationRow) -> Self {
        Self {
            request: NotificationRequest {
                id: row.id,
                spec: row.spec.0,
                status: row.status.0,
                created_at: row.created_at,
            },
            resource_version: row.resource_version.max(0) as u64,
        }
    }
}

/// PostgreSQL-backed store. Spec and status are JSONB documents; the phase
/// is mirrored into its own column for filtering.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn create(&self, request: NotificationRequest) -> Result<StoredNotification, StoreError> {
        let row: NotificationRow = sqlx::query_as(
            r#"
            INSERT INTO notifications (id, spec, status, phase, resource_version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 1, $5, $5)
            RETURNING id, spec, status, resource_version, created_at
            "#,
        )
        .bind(request.id)
        .bind(Json(&request.spec))
        .bind(Json(&request.status))
        .bind(request.status.phase.to_string())
        .bind(request.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::AlreadyExists(request.id)
            }
            other => StoreError::Database(other),
        })?;

        Ok(row.into())
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredNotification>, StoreError> {
        let row: Option<NotificationRow> = sqlx::query_as(
            "SELECT id, spec, status, resource_version, created_at FROM notifications WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected_version: u64,
        status: &NotificationStatus,
    ) -> Result<u64, StoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE notifications
            SET status = $3, phase = $4, resource_version = resource_version + 1, updated_at = NOW()
            WHERE id = $1 AND resource_version = $2
            RETURNING resource_version
            "#,
        )
        .bind(id)
        .bind(expected_version as i64)
        .bind(Json(status))
        .bind(status.phase.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = version {
            return Ok(version as u64);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM notifications WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        if exists {
            Err(StoreError::Conflict {
                id,
                expected: expected_version,
            })
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<StoredNotification>, StoreError> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, spec, status, resource_version, created_at
            FROM notifications
            WHERE ($1::TEXT IS NULL OR phase = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(filter.phase.map(|p| p.to_string()))
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM notifications
            WHERE phase NOT IN ('Sent', 'PartiallySent', 'Failed')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
