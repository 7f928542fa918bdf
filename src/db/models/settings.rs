use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::debug;

/// In-memory TTL cache in front of the settings tables, generalized from a
/// single-table cache into one shared cache keyed by `"scope:key"`.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: JsonValue,
    timestamp: u64,
}

#[derive(Clone)]
pub struct SettingsCache {
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    cleanup_started: Arc<tokio::sync::OnceCell<()>>,
}

impl Default for SettingsCache {
    fn default() -> Self {
        Self::new()
    }
}

const TTL_SECS: u64 = 60;

impl SettingsCache {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            cleanup_started: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    fn start_cleanup(&self) {
        let cache = self.cache.clone();
        let cleanup_started = self.cleanup_started.clone();

        tokio::spawn(async move {
            cleanup_started
                .get_or_init(|| async {
                    let cache = cache.clone();
                    tokio::spawn(async move {
                        let mut ticker = interval(Duration::from_secs(TTL_SECS));
                        loop {
                            ticker.tick().await;
                            debug!("settings cache cleanup running");
                            let now = now_secs();
                            let mut guard = cache.write().await;
                            guard.retain(|_, entry| now - entry.timestamp <= TTL_SECS);
                        }
                    });
                })
                .await;
        });
    }

    async fn get(&self, key: &str) -> Option<JsonValue> {
        let guard = self.cache.read().await;
        let entry = guard.get(key)?;
        if now_secs() - entry.timestamp > TTL_SECS {
            return None;
        }
        Some(entry.value.clone())
    }

    async fn set(&self, key: String, value: JsonValue) {
        let entry = CacheEntry { value, timestamp: now_secs() };
        self.cache.write().await.insert(key, entry);
    }

    async fn invalidate(&self, key: &str) {
        self.cache.write().await.remove(key);
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Global application-wide settings, including `devops_apply`.
pub struct AppSetting;

impl AppSetting {
    pub async fn get(pool: &PgPool, cache: &SettingsCache, key: &str) -> Result<Option<JsonValue>> {
        cache.start_cleanup();
        let cache_key = format!("app:{key}");
        if let Some(v) = cache.get(&cache_key).await {
            return Ok(Some(v));
        }
        let value: Option<JsonValue> = sqlx::query_scalar("SELECT value FROM app_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await
            .context("failed to query app setting")?;
        if let Some(v) = &value {
            cache.set(cache_key, v.clone()).await;
        }
        Ok(value)
    }

    pub async fn set(pool: &PgPool, cache: &SettingsCache, key: &str, value: &JsonValue) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(pool)
        .await
        .context("failed to set app setting")?;
        cache.invalidate(&format!("app:{key}")).await;
        Ok(())
    }
}

/// Per-host override settings, e.g. a host-level `auto_apply` override.
pub struct HostSetting;

impl HostSetting {
    pub async fn get(pool: &PgPool, cache: &SettingsCache, host_id: i64, key: &str) -> Result<Option<JsonValue>> {
        cache.start_cleanup();
        let cache_key = format!("host:{host_id}:{key}");
        if let Some(v) = cache.get(&cache_key).await {
            return Ok(Some(v));
        }
        let value: Option<JsonValue> = sqlx::query_scalar(
            "SELECT value FROM host_settings WHERE host_id = $1 AND key = $2",
        )
        .bind(host_id)
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("failed to query host setting")?;
        if let Some(v) = &value {
            cache.set(cache_key, v.clone()).await;
        }
        Ok(value)
    }

    pub async fn set(pool: &PgPool, cache: &SettingsCache, host_id: i64, key: &str, value: &JsonValue) -> Result<()> {
        sqlx::query(
            "INSERT INTO host_settings (host_id, key, value) VALUES ($1, $2, $3)
             ON CONFLICT (host_id, key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(host_id)
        .bind(key)
        .bind(value)
        .execute(pool)
        .await
        .context("failed to set host setting")?;
        cache.invalidate(&format!("host:{host_id}:{key}")).await;
        Ok(())
    }
}

/// Per-group override settings, consulted for hosts' groups in
/// lexicographic order by the Policy Engine.
pub struct GroupSetting;

impl GroupSetting {
    pub async fn get(pool: &PgPool, cache: &SettingsCache, group_name: &str, key: &str) -> Result<Option<JsonValue>> {
        cache.start_cleanup();
        let cache_key = format!("group:{group_name}:{key}");
        if let Some(v) = cache.get(&cache_key).await {
            return Ok(Some(v));
        }
        let value: Option<JsonValue> = sqlx::query_scalar(
            "SELECT value FROM group_settings WHERE group_name = $1 AND key = $2",
        )
        .bind(group_name)
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("failed to query group setting")?;
        if let Some(v) = &value {
            cache.set(cache_key, v.clone()).await;
        }
        Ok(value)
    }

    pub async fn set(pool: &PgPool, cache: &SettingsCache, group_name: &str, key: &str, value: &JsonValue) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_settings (group_name, key, value) VALUES ($1, $2, $3)
             ON CONFLICT (group_name, key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(group_name)
        .bind(key)
        .bind(value)
        .execute(pool)
        .await
        .context("failed to set group setting")?;
        cache.invalidate(&format!("group:{group_name}:{key}")).await;
        Ok(())
    }
}
