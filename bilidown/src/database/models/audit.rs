//! Audit log models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row of the append-only `log` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditEntryDbModel {
    pub id: i64,
    pub content: String,
    /// Unix epoch milliseconds.
    pub created_at: i64,
}
