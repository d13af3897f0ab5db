//! Key/value setting models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Setting name holding the current download folder.
pub const SETTING_DOWNLOAD_FOLDER: &str = "download_folder";

/// Setting name holding the optional Bilibili `SESSDATA` cookie.
pub const SETTING_SESSDATA: &str = "sessdata";

/// A row of the `field` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettingDbModel {
    pub name: String,
    pub value: Option<String>,
}
