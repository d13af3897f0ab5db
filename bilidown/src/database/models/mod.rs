//! Database models for bilidown.
//!
//! These models map directly to the database schema.

pub mod audit;
pub mod job;
pub mod setting;

pub use audit::*;
pub use job::*;
pub use setting::*;
