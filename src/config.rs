use crate::error::AppError;
use crate::routing::balancer::SelectionStrategy;
use crate::stats::MAX_HISTORY_DAYS;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub local_api_key: String,
    pub openai_endpoint: String,
    pub redirect_enabled: bool,
    pub redirect_keyword: String,
    pub redirect_target_model: String,
    pub redirect_target_name: String,
    pub minimize_to_tray: bool,
    pub auto_start: bool,
    pub enable_file_log: bool,
    pub server_port: u16,
    pub log_retention_days: u32,
    pub upstream_timeout_secs: u64,
    pub selection_strategy: SelectionStrategy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            local_api_key: String::new(),
            openai_endpoint: "https://api.openai.com".to_string(),
            redirect_enabled: false,
            redirect_keyword: "proxy_auto".to_string(),
            redirect_target_model: String::new(),
            redirect_target_name: String::new(),
            minimize_to_tray: true,
            auto_start: false,
            enable_file_log: false,
            server_port: 9000,
            log_retention_days: 7,
            upstream_timeout_secs: 300,
            selection_strategy: SelectionStrategy::RoundRobin,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

impl AppConfig {
    pub async fn load_from_db(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM app_config")
            .fetch_all(pool)
            .await?;

        let mut config = Self::default();

        for (key, value) in rows {
            match key.as_str() {
                "local_api_key" => config.local_api_key = value,
                "openai_endpoint" => config.openai_endpoint = value,
                "redirect_keyword" => config.redirect_keyword = value,
                "redirect_target_model" => config.redirect_target_model = value,
                "redirect_target_name" => config.redirect_target_name = value,
                "redirect_enabled" => {
                    if let Some(v) = parse_bool(&value) {
                        config.redirect_enabled = v;
                    }
                }
                "minimize_to_tray" => {
                    if let Some(v) = parse_bool(&value) {
                        config.minimize_to_tray = v;
                    }
                }
                "auto_start" => {
                    if let Some(v) = parse_bool(&value) {
                        config.auto_start = v;
                    }
                }
                "enable_file_log" => {
                    if let Some(v) = parse_bool(&value) {
                        config.enable_file_log = v;
                    }
                }
                "server_port" => {
                    if let Ok(port) = value.parse::<u16>() {
                        config.server_port = port;
                    }
                }
                "log_retention_days" => {
                    if let Ok(days) = value.parse::<u32>() {
                        config.log_retention_days = days;
                    }
                }
                "upstream_timeout_secs" => {
                    if let Ok(secs) = value.parse::<u64>() {
                        config.upstream_timeout_secs = secs;
                    }
                }
                "selection_strategy" => {
                    if let Some(strategy) = SelectionStrategy::from_str_loose(&value) {
                        config.selection_strategy = strategy;
                    }
                }
                _ => {
                    log::warn!("Ignoring unknown config key: {}", key);
                }
            }
        }

        Ok(config)
    }

    fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("local_api_key", self.local_api_key.clone()),
            ("openai_endpoint", self.openai_endpoint.clone()),
            ("redirect_enabled", self.redirect_enabled.to_string()),
            ("redirect_keyword", self.redirect_keyword.clone()),
            ("redirect_target_model", self.redirect_target_model.clone()),
            ("redirect_target_name", self.redirect_target_name.clone()),
            ("minimize_to_tray", self.minimize_to_tray.to_string()),
            ("auto_start", self.auto_start.to_string()),
            ("enable_file_log", self.enable_file_log.to_string()),
            ("server_port", self.server_port.to_string()),
            ("log_retention_days", self.log_retention_days.to_string()),
            ("upstream_timeout_secs", self.upstream_timeout_secs.to_string()),
            ("selection_strategy", self.selection_strategy.as_str().to_string()),
        ]
    }

    /// UPSERT every key in a single transaction.
    pub async fn save_to_db(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for (key, value) in self.entries() {
            sqlx::query(
                "INSERT INTO app_config (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.redirect_enabled {
            if self.redirect_keyword.trim().is_empty() {
                return Err(AppError::ConfigInvalid(
                    "redirect is enabled but the redirect keyword is empty".into(),
                ));
            }
            if self.redirect_target_model.trim().is_empty() {
                return Err(AppError::ConfigInvalid(
                    "redirect is enabled but no target model is set".into(),
                ));
            }
        }
        if self.log_retention_days > MAX_HISTORY_DAYS {
            return Err(AppError::ConfigInvalid(format!(
                "log_retention_days must be at most {}",
                MAX_HISTORY_DAYS
            )));
        }
        if self.upstream_timeout_secs == 0 {
            return Err(AppError::ConfigInvalid(
                "upstream_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Process-wide config. Writes commit to the database before the in-memory
/// value is replaced, so every reader sees the latest committed config.
pub struct ConfigStore {
    db: SqlitePool,
    current: RwLock<AppConfig>,
    // serializes read-modify-write updates
    write_lock: tokio::sync::Mutex<()>,
}

impl ConfigStore {
    pub async fn load(db: SqlitePool) -> Result<Self, AppError> {
        let config = AppConfig::load_from_db(&db).await?;
        Ok(Self {
            db,
            current: RwLock::new(config),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn snapshot(&self) -> AppConfig {
        self.current.read().await.clone()
    }

    /// Apply `change` to a copy of the current config, validate, persist, publish.
    pub async fn update<F>(&self, change: F) -> Result<AppConfig, AppError>
    where
        F: FnOnce(&mut AppConfig),
    {
        let _guard = self.write_lock.lock().await;
        let mut next = self.current.read().await.clone();
        change(&mut next);
        next.validate()?;
        next.save_to_db(&self.db).await?;

        let mut current = self.current.write().await;
        *current = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn defaults_when_table_is_empty() {
        let pool = db::init_memory_pool().await.unwrap();
        let config = AppConfig::load_from_db(&pool).await.unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn update_persists_and_is_visible_immediately() {
        let pool = db::init_memory_pool().await.unwrap();
        let store = ConfigStore::load(pool.clone()).await.unwrap();

        store
            .update(|c| {
                c.redirect_enabled = true;
                c.redirect_keyword = "auto".into();
                c.redirect_target_model = "gpt-4o".into();
                c.selection_strategy = SelectionStrategy::Priority;
            })
            .await
            .unwrap();

        let live = store.snapshot().await;
        assert!(live.redirect_enabled);
        assert_eq!(live.redirect_target_model, "gpt-4o");

        let reloaded = AppConfig::load_from_db(&pool).await.unwrap();
        assert_eq!(reloaded, live);
    }

    #[tokio::test]
    async fn invalid_update_is_not_applied() {
        let pool = db::init_memory_pool().await.unwrap();
        let store = ConfigStore::load(pool.clone()).await.unwrap();

        let err = store
            .update(|c| {
                c.redirect_enabled = true;
                c.redirect_keyword = "  ".into();
                c.redirect_target_model = "gpt-4o".into();
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigInvalid(_)));
        assert!(!store.snapshot().await.redirect_enabled);
        assert!(!AppConfig::load_from_db(&pool).await.unwrap().redirect_enabled);
    }

    #[tokio::test]
    async fn retention_beyond_the_history_window_is_rejected() {
        let pool = db::init_memory_pool().await.unwrap();
        let store = ConfigStore::load(pool).await.unwrap();

        let err = store
            .update(|c| c.log_retention_days = MAX_HISTORY_DAYS + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigInvalid(_)));
        assert_eq!(store.snapshot().await.log_retention_days, 7);

        store.update(|c| c.log_retention_days = MAX_HISTORY_DAYS).await.unwrap();
    }
}
