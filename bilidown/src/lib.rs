//! bilidown library crate.
//!
//! A persistent download-and-transcode queue for Bilibili videos. The
//! binary wires these modules together; integration tests drive them
//! directly.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
