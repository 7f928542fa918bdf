use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ScanLog {
    pub id: i64,
    pub host_id: Option<i64>,
    pub level: String,
    pub message: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl ScanLog {
    pub async fn record(pool: &PgPool, host_id: Option<i64>, level: &str, message: &str, payload: JsonValue) -> Result<()> {
        sqlx::query("INSERT INTO scan_logs (host_id, level, message, payload) VALUES ($1, $2, $3, $4)")
            .bind(host_id)
            .bind(level)
            .bind(message)
            .bind(payload)
            .execute(pool)
            .await
            .context("failed to record scan log")?;
        Ok(())
    }

    pub async fn tail_for_host(pool: &PgPool, host_id: i64, limit: i64) -> Result<Vec<ScanLog>> {
        sqlx::query_as::<_, ScanLog>(
            "SELECT id, host_id, level, message, payload, created_at
             FROM scan_logs WHERE host_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(host_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("failed to tail scan logs")
    }
}
