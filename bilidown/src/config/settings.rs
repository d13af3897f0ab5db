//! Settings accessor.
//!
//! The download folder lives in the `field` table so it survives restarts
//! and can be changed at runtime. It is read when a job is enqueued and
//! copied into the job row, so changing it never moves existing jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::database::models::{SETTING_DOWNLOAD_FOLDER, SETTING_SESSDATA};
use crate::database::repositories::{AuditRepository, SettingRepository};
use crate::utils::fs::ensure_dir_all;
use crate::{Error, Result};

pub struct SettingsService {
    settings: Arc<dyn SettingRepository>,
    audit: Arc<dyn AuditRepository>,
    default_folder: PathBuf,
    folder_cache: RwLock<Option<String>>,
}

impl SettingsService {
    /// `default_folder` is used the first time no folder is stored. A
    /// relative path is resolved against the current directory.
    pub fn new(
        settings: Arc<dyn SettingRepository>,
        audit: Arc<dyn AuditRepository>,
        default_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            settings,
            audit,
            default_folder: default_folder.into(),
            folder_cache: RwLock::new(None),
        }
    }

    /// Current download folder, initializing (and creating) the default
    /// when none is stored yet.
    pub async fn current_folder(&self) -> Result<String> {
        if let Some(folder) = self.folder_cache.read().clone() {
            return Ok(folder);
        }

        let folder = match self.settings.get_setting(SETTING_DOWNLOAD_FOLDER).await? {
            Some(folder) => folder,
            None => {
                let folder = absolutize(&self.default_folder)?;
                ensure_dir_all(&folder).await?;
                let folder = folder.to_string_lossy().into_owned();
                self.settings
                    .set_setting(SETTING_DOWNLOAD_FOLDER, Some(&folder))
                    .await?;
                info!(folder = %folder, "Initialized default download folder");
                folder
            }
        };

        *self.folder_cache.write() = Some(folder.clone());
        Ok(folder)
    }

    /// Change the download folder. The path must be absolute; it is created
    /// if missing.
    pub async fn set_current_folder(&self, folder: &str) -> Result<String> {
        let path = Path::new(folder.trim());
        if !path.is_absolute() {
            return Err(Error::validation(format!(
                "download folder must be an absolute path, got '{}'",
                folder
            )));
        }
        ensure_dir_all(path).await?;

        let folder = path.to_string_lossy().into_owned();
        self.settings
            .set_setting(SETTING_DOWNLOAD_FOLDER, Some(&folder))
            .await?;
        *self.folder_cache.write() = Some(folder.clone());

        self.audit
            .append(&format!("download folder set to {}", folder))
            .await?;
        info!(folder = %folder, "Download folder changed");
        Ok(folder)
    }

    /// Optional `SESSDATA` cookie; unlocks qualities above 480P.
    pub async fn sessdata(&self) -> Result<Option<String>> {
        Ok(self
            .settings
            .get_setting(SETTING_SESSDATA)
            .await?
            .filter(|v| !v.is_empty()))
    }

    pub async fn set_sessdata(&self, value: Option<&str>) -> Result<()> {
        self.settings
            .set_setting(SETTING_SESSDATA, value.filter(|v| !v.is_empty()))
            .await
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| Error::io_path("resolving", path, e))?;
    Ok(cwd.join(path))
}
