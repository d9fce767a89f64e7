//! SQLite-backed configuration persistence
//!
//! Each section of [`AppConfig`] is stored as one JSON row keyed by its
//! section name, so a partial or older database still loads: missing rows
//! and missing fields fall back to defaults.

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Top-level configuration section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigSection {
    Playback,
    Channel,
    Backend,
}

impl ConfigSection {
    pub const ALL: [ConfigSection; 3] = [
        ConfigSection::Playback,
        ConfigSection::Channel,
        ConfigSection::Backend,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ConfigSection::Playback => "playback",
            ConfigSection::Channel => "channel",
            ConfigSection::Backend => "backend",
        }
    }

    fn differs(self, a: &AppConfig, b: &AppConfig) -> bool {
        match self {
            ConfigSection::Playback => a.playback != b.playback,
            ConfigSection::Channel => a.channel != b.channel,
            ConfigSection::Backend => a.backend != b.backend,
        }
    }
}

/// Sent once per section that actually changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub section: ConfigSection,
}

/// Configuration store
///
/// Reads hit an `ArcSwap` snapshot and never touch the database.
#[derive(Clone)]
pub struct ConfigStore {
    pool: Pool<Sqlite>,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

impl ConfigStore {
    /// Open (or create) the store at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&format!("sqlite:{}?mode=rwc", db_path.display()))
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                section TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&pool)
        .await?;

        let config = AppConfig {
            playback: load_section(&pool, ConfigSection::Playback).await?,
            channel: load_section(&pool, ConfigSection::Channel).await?,
            backend: load_section(&pool, ConfigSection::Backend).await?,
        };
        config.validate()?;
        debug!("Loaded configuration from {}", db_path.display());

        let (change_tx, _) = broadcast::channel(16);
        Ok(Self {
            pool,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// Current configuration snapshot
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the whole configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        self.commit(config).await
    }

    /// Read-modify-write; concurrent updates are last-writer-wins
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.get()).clone();
        f(&mut config);
        self.commit(config).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    async fn commit(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        let current = self.get();
        let changed: Vec<ConfigSection> = ConfigSection::ALL
            .into_iter()
            .filter(|section| section.differs(&current, &config))
            .collect();

        for section in &changed {
            match section {
                ConfigSection::Playback => save_section(&self.pool, *section, &config.playback).await?,
                ConfigSection::Channel => save_section(&self.pool, *section, &config.channel).await?,
                ConfigSection::Backend => save_section(&self.pool, *section, &config.backend).await?,
            }
        }

        self.cache.store(Arc::new(config));
        for section in changed {
            let _ = self.change_tx.send(ConfigChange { section });
        }
        Ok(())
    }
}

async fn load_section<T>(pool: &Pool<Sqlite>, section: ConfigSection) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT body FROM settings WHERE section = ?1")
        .bind(section.key())
        .fetch_optional(pool)
        .await?;

    match row {
        Some((body,)) => serde_json::from_str(&body).map_err(|e| {
            warn!("Stored {} config is invalid: {}", section.key(), e);
            AppError::Config(format!("{}: {}", section.key(), e))
        }),
        None => Ok(T::default()),
    }
}

async fn save_section<T: Serialize>(
    pool: &Pool<Sqlite>,
    section: ConfigSection,
    value: &T,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (section, body, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(section) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
    )
    .bind(section.key())
    .bind(serde_json::to_string(value)?)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store_persists_updates() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("camwatch.db");

        let store = ConfigStore::new(&db_path).await.unwrap();
        assert_eq!(store.get().playback.max_recovery_attempts, 3);

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.playback.freeze_threshold_ms = 6_000;
                c.channel.endpoint = "wss://nvr.local/ws".to_string();
            })
            .await
            .unwrap();

        assert_eq!(changes.try_recv().unwrap().section, ConfigSection::Playback);
        assert_eq!(changes.try_recv().unwrap().section, ConfigSection::Channel);
        assert!(changes.try_recv().is_err());
        assert_eq!(store.get().playback.freeze_threshold_ms, 6_000);

        drop(store);
        let reopened = ConfigStore::new(&db_path).await.unwrap();
        let config = reopened.get();
        assert_eq!(config.playback.freeze_threshold_ms, 6_000);
        assert_eq!(config.channel.endpoint, "wss://nvr.local/ws");

        reopened.set(AppConfig::default()).await.unwrap();
        assert_eq!(reopened.get().playback.freeze_threshold_ms, 8_000);
    }

    #[tokio::test]
    async fn test_invalid_update_rejected() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(&dir.path().join("camwatch.db")).await.unwrap();
        let mut changes = store.subscribe();

        let result = store
            .update(|c| c.playback.detection_interval_ms = 0)
            .await;

        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(store.get().playback.detection_interval_ms, 3_000);
        assert!(changes.try_recv().is_err());
    }
}
