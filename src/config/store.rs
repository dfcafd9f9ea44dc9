use arc_swap::ArcSwap;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by SQLite
///
/// Uses `ArcSwap` for lock-free reads; handlers read the configuration on
/// every request.
#[derive(Clone)]
pub struct ConfigStore {
    pool: Pool<Sqlite>,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Create a new configuration store
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(&db_url)
            .await?;

        Self::init_schema(&pool).await?;

        let config = Self::load_config(&pool).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));

        Ok(Self { pool, cache })
    }

    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn load_config(pool: &Pool<Sqlite>) -> Result<AppConfig> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM config WHERE key = 'app_config'")
                .fetch_optional(pool)
                .await?;

        match row {
            Some((json,)) => serde_json::from_str(&json).map_err(|e| AppError::Config(e.to_string())),
            None => {
                let config = AppConfig::default();
                Self::save_config_to_db(pool, &config).await?;
                Ok(config)
            }
        }
    }

    async fn save_config_to_db(pool: &Pool<Sqlite>, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;

        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at)
            VALUES ('app_config', ?1, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = ?1, updated_at = datetime('now')
            "#,
        )
        .bind(&json)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration for this process only
    ///
    /// Used for command line overrides, which must not be written back.
    pub fn set_runtime(&self, config: AppConfig) {
        self.cache.store(Arc::new(config));
    }

    /// Set and persist the entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        Self::save_config_to_db(&self.pool, &config).await?;
        self.set_runtime(config);
        Ok(())
    }

    /// Update and persist the configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        self.set(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::config::IceServer;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let store = ConfigStore::new(&db_path).await.unwrap();

        let config = store.get();
        assert!(config.whip.api_key.is_none());

        store
            .update(|c| {
                c.whip.api_key = Some("secret".to_string());
                c.whip.ice_servers.push(IceServer::new("stun:stun.example.com:3478"));
                c.web.http_port = 9000;
            })
            .await
            .unwrap();

        let config = store.get();
        assert_eq!(config.whip.api_key.as_deref(), Some("secret"));
        assert_eq!(config.web.http_port, 9000);

        // Persisted across instances
        let store2 = ConfigStore::new(&db_path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.whip.api_key.as_deref(), Some("secret"));
        assert_eq!(config.whip.ice_servers.len(), 1);
        assert_eq!(config.web.http_port, 9000);
    }

    #[tokio::test]
    async fn test_runtime_override_is_not_persisted() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let store = ConfigStore::new(&db_path).await.unwrap();

        let mut config = (*store.get()).clone();
        config.web.prefix = "/whip-api".to_string();
        store.set_runtime(config);

        assert_eq!(store.get().web.prefix, "/whip-api");

        let store2 = ConfigStore::new(&db_path).await.unwrap();
        assert_eq!(store2.get().web.prefix, "/api/v2");
    }
}
