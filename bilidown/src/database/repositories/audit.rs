//! Append-only audit log repository.

use async_trait::async_trait;

use crate::Result;
use crate::database::Store;
use crate::database::models::AuditEntryDbModel;
use crate::database::time::now_ms;

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append(&self, content: &str) -> Result<i64>;
    /// Newest first.
    async fn list_recent(&self, limit: i64) -> Result<Vec<AuditEntryDbModel>>;
}

pub struct SqlxAuditRepository {
    store: Store,
}

impl SqlxAuditRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditRepository for SqlxAuditRepository {
    async fn append(&self, content: &str) -> Result<i64> {
        let mut tx = self.store.begin_write().await?;
        let id: i64 =
            sqlx::query_scalar("INSERT INTO log (content, created_at) VALUES (?, ?) RETURNING id")
                .bind(content)
                .bind(now_ms())
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<AuditEntryDbModel>> {
        let limit = if limit <= 0 { -1 } else { limit };
        let rows = sqlx::query_as::<_, AuditEntryDbModel>(
            "SELECT id, content, created_at FROM log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.store.reader())
        .await?;
        Ok(rows)
    }
}
