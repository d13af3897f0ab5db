//! Process configuration and persisted settings.
//!
//! [`AppConfig`] is read once from the environment at startup;
//! [`SettingsService`] wraps the settings stored in the database.

pub mod app;
pub mod settings;

pub use app::AppConfig;
pub use settings::SettingsService;
