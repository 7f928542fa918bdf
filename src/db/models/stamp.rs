use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }
}

/// An immutable content-addressed record of a deployment attempt. Only
/// `deployment_status` may change after creation.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct DeploymentStamp {
    pub id: i64,
    pub stack_id: i64,
    pub deployment_hash: String,
    pub deployment_method: String,
    pub deployment_owner: String,
    pub deployment_timestamp: DateTime<Utc>,
    pub deployment_status: String,
    pub meta: JsonValue,
}

impl DeploymentStamp {
    pub async fn find_existing(pool: &PgPool, stack_id: i64, deployment_hash: &str) -> Result<Option<DeploymentStamp>> {
        sqlx::query_as::<_, DeploymentStamp>(
            "SELECT id, stack_id, deployment_hash, deployment_method, deployment_owner,
                    deployment_timestamp, deployment_status, meta
             FROM deployment_stamps WHERE stack_id = $1 AND deployment_hash = $2",
        )
        .bind(stack_id)
        .bind(deployment_hash)
        .fetch_optional(pool)
        .await
        .context("failed to look up deployment stamp")
    }

    /// Creates a `pending` stamp for `(stack_id, deployment_hash)`, or
    /// returns the existing one on a concurrent-creation race (P4).
    pub async fn create_or_get(
        pool: &PgPool,
        stack_id: i64,
        deployment_hash: &str,
        deployment_method: &str,
        deployment_owner: &str,
        meta: &JsonValue,
    ) -> Result<DeploymentStamp> {
        sqlx::query_as::<_, DeploymentStamp>(
            "INSERT INTO deployment_stamps
                (stack_id, deployment_hash, deployment_method, deployment_owner, meta)
             VALUES ($1,$2,$3,$4,$5)
             ON CONFLICT (stack_id, deployment_hash) DO UPDATE SET stack_id = EXCLUDED.stack_id
             RETURNING id, stack_id, deployment_hash, deployment_method, deployment_owner,
                       deployment_timestamp, deployment_status, meta",
        )
        .bind(stack_id)
        .bind(deployment_hash)
        .bind(deployment_method)
        .bind(deployment_owner)
        .bind(meta)
        .fetch_one(pool)
        .await
        .context("failed to create deployment stamp")
    }

    pub async fn update_status(pool: &PgPool, id: i64, status: DeploymentStatus) -> Result<()> {
        sqlx::query("UPDATE deployment_stamps SET deployment_status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(pool)
            .await
            .context("failed to update deployment stamp status")?;
        Ok(())
    }

    pub async fn latest_success(pool: &PgPool, stack_id: i64) -> Result<Option<DeploymentStamp>> {
        sqlx::query_as::<_, DeploymentStamp>(
            "SELECT id, stack_id, deployment_hash, deployment_method, deployment_owner,
                    deployment_timestamp, deployment_status, meta
             FROM deployment_stamps
             WHERE stack_id = $1 AND deployment_status = 'success'
             ORDER BY deployment_timestamp DESC LIMIT 1",
        )
        .bind(stack_id)
        .fetch_optional(pool)
        .await
        .context("failed to look up latest successful stamp")
    }

    /// Delete all but the most recent `keep` terminal stamps per stack.
    /// Pending stamps are never touched (§9 design note (c)).
    pub async fn prune_old(pool: &PgPool, stack_id: i64, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM deployment_stamps
             WHERE id IN (
                SELECT id FROM deployment_stamps
                WHERE stack_id = $1 AND deployment_status IN ('success', 'failed')
                ORDER BY deployment_timestamp DESC
                OFFSET $2
             )",
        )
        .bind(stack_id)
        .bind(keep)
        .execute(pool)
        .await
        .context("failed to prune old deployment stamps")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::iac::{DiscoveredStack, DeployKind, IacRepo, IacStack, ScopeKind, SopsStatus};

    #[test]
    fn test_deployment_status_round_trip() {
        assert_eq!(DeploymentStatus::Pending.as_str(), "pending");
        assert_eq!(DeploymentStatus::Success.as_str(), "success");
        assert_eq!(DeploymentStatus::Failed.as_str(), "failed");
    }

    fn test_database_url() -> Option<String> {
        std::env::var("DDUI_TEST_DATABASE_URL").ok()
    }

    async fn setup() -> Option<(PgPool, IacStack)> {
        let url = test_database_url()?;
        let pool = PgPool::connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        sqlx::query("TRUNCATE iac_repos CASCADE").execute(&pool).await.unwrap();
        let repo = IacRepo::ensure_local(&pool, "/tmp/ddui-stamp-test").await.unwrap();
        let stack = IacStack::upsert(
            &pool,
            repo.id,
            &DiscoveredStack {
                scope_kind: ScopeKind::Host,
                scope_name: "anchorage".to_string(),
                stack_name: "grafana".to_string(),
                rel_path: "anchorage/grafana".to_string(),
                compose_file: Some("docker-compose.yml".to_string()),
                deploy_kind: DeployKind::Compose,
                sops_status: SopsStatus::None,
                hash: None,
            },
        )
        .await
        .unwrap();
        Some((pool, stack))
    }

    /// P4: two `create_or_get` calls with the same `(stack_id, deployment_hash)`
    /// must resolve to the same stamp row, not create a second one.
    #[tokio::test]
    async fn test_create_or_get_is_unique_on_stack_and_hash() {
        let Some((pool, stack)) = setup().await else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };

        let meta = serde_json::json!({});
        let first = DeploymentStamp::create_or_get(&pool, stack.id, "deadbeef", "compose", "infra", &meta)
            .await
            .unwrap();
        let second = DeploymentStamp::create_or_get(&pool, stack.id, "deadbeef", "compose", "infra", &meta)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM deployment_stamps WHERE stack_id = $1")
            .bind(stack.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    /// A different `deployment_hash` on the same stack produces a distinct stamp.
    #[tokio::test]
    async fn test_create_or_get_distinguishes_by_hash() {
        let Some((pool, stack)) = setup().await else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };

        let meta = serde_json::json!({});
        let first = DeploymentStamp::create_or_get(&pool, stack.id, "hash-a", "compose", "infra", &meta)
            .await
            .unwrap();
        let second = DeploymentStamp::create_or_get(&pool, stack.id, "hash-b", "compose", "infra", &meta)
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
    }
}
