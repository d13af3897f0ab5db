//! Key/value settings repository.

use async_trait::async_trait;

use crate::Result;
use crate::database::Store;
use crate::database::models::SettingDbModel;

#[async_trait]
pub trait SettingRepository: Send + Sync {
    /// `None` when the setting was never written or was written as NULL.
    async fn get_setting(&self, name: &str) -> Result<Option<String>>;
    async fn set_setting(&self, name: &str, value: Option<&str>) -> Result<()>;
    async fn list_settings(&self) -> Result<Vec<SettingDbModel>>;
}

pub struct SqlxSettingRepository {
    store: Store,
}

impl SqlxSettingRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SettingRepository for SqlxSettingRepository {
    async fn get_setting(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, SettingDbModel>("SELECT name, value FROM field WHERE name = ?")
            .bind(name)
            .fetch_optional(self.store.reader())
            .await?;
        Ok(row.and_then(|r| r.value))
    }

    async fn set_setting(&self, name: &str, value: Option<&str>) -> Result<()> {
        let mut tx = self.store.begin_write().await?;
        sqlx::query(
            "INSERT INTO field (name, value) VALUES (?, ?) ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    async fn list_settings(&self) -> Result<Vec<SettingDbModel>> {
        let rows = sqlx::query_as::<_, SettingDbModel>("SELECT name, value FROM field ORDER BY name")
            .fetch_all(self.store.reader())
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{SETTING_DOWNLOAD_FOLDER, SETTING_SESSDATA};
    use crate::database::test_support::temp_store;

    #[tokio::test]
    async fn test_missing_setting_is_none() {
        let (store, _dir) = temp_store().await;
        let repo = SqlxSettingRepository::new(store);
        assert_eq!(repo.get_setting(SETTING_DOWNLOAD_FOLDER).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_overwrites_previous_value() {
        let (store, _dir) = temp_store().await;
        let repo = SqlxSettingRepository::new(store);

        repo.set_setting(SETTING_DOWNLOAD_FOLDER, Some("/a")).await.unwrap();
        repo.set_setting(SETTING_DOWNLOAD_FOLDER, Some("/b")).await.unwrap();
        assert_eq!(
            repo.get_setting(SETTING_DOWNLOAD_FOLDER).await.unwrap().as_deref(),
            Some("/b")
        );

        repo.set_setting(SETTING_SESSDATA, None).await.unwrap();
        assert_eq!(repo.get_setting(SETTING_SESSDATA).await.unwrap(), None);

        let all = repo.list_settings().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, SETTING_DOWNLOAD_FOLDER);
    }
}
