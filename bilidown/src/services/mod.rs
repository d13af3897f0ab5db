//! Service layer module.
//!
//! This module provides the service container and startup ordering for
//! all application services.

pub mod container;

pub use container::ServiceContainer;
