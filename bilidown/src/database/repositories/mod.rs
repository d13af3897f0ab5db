//! Repository layer for database access.
//!
//! Reads go straight to the read pool; writes go through
//! [`Store::begin_write`](crate::database::Store::begin_write).

pub mod audit;
pub mod job;
pub mod setting;

pub use audit::{AuditRepository, SqlxAuditRepository};
pub use job::{JobRepository, SqlxJobRepository};
pub use setting::{SettingRepository, SqlxSettingRepository};
