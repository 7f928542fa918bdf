use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;

/// A Compose project observed on a host (label `com.docker.compose.project`).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct RuntimeStack {
    pub id: i64,
    pub host_id: i64,
    pub project: String,
    pub owner: String,
    pub auto_apply_override: Option<bool>,
}

impl RuntimeStack {
    /// Created on first sighting by the scanner; unique per `(host_id, project)`.
    pub async fn ensure(pool: &PgPool, host_id: i64, project: &str, owner: &str) -> Result<RuntimeStack> {
        if let Some(existing) = sqlx::query_as::<_, RuntimeStack>(
            "SELECT id, host_id, project, owner, auto_apply_override
             FROM stacks WHERE host_id = $1 AND project = $2",
        )
        .bind(host_id)
        .bind(project)
        .fetch_optional(pool)
        .await
        .context("failed to look up runtime stack")?
        {
            return Ok(existing);
        }

        sqlx::query_as::<_, RuntimeStack>(
            "INSERT INTO stacks (host_id, project, owner)
             VALUES ($1, $2, $3)
             ON CONFLICT (host_id, project) DO UPDATE SET project = EXCLUDED.project
             RETURNING id, host_id, project, owner, auto_apply_override",
        )
        .bind(host_id)
        .bind(project)
        .bind(owner)
        .fetch_one(pool)
        .await
        .context("failed to create runtime stack")
    }

    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<RuntimeStack>> {
        sqlx::query_as::<_, RuntimeStack>(
            "SELECT id, host_id, project, owner, auto_apply_override FROM stacks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to query runtime stack")
    }

    pub async fn set_auto_apply_override(pool: &PgPool, id: i64, value: Option<bool>) -> Result<()> {
        sqlx::query("UPDATE stacks SET auto_apply_override = $2 WHERE id = $1")
            .bind(id)
            .bind(value)
            .execute(pool)
            .await
            .context("failed to set auto_apply_override")?;
        Ok(())
    }
}

/// A port mapping as flattened from Docker's `NetworkSettings.Ports`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerPort {
    pub ip: Option<String>,
    pub public_port: Option<u16>,
    pub private_port: u16,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ContainerRow {
    id: i64,
    host_id: i64,
    stack_id: Option<i64>,
    container_id: String,
    name: String,
    image: String,
    state: String,
    status: String,
    ports: JsonValue,
    labels: JsonValue,
    env: JsonValue,
    networks: JsonValue,
    mounts: JsonValue,
    ip_addr: Option<String>,
    created_ts: Option<DateTime<Utc>>,
    owner: String,
    deployment_stamp_id: Option<i64>,
    deployment_hash: Option<String>,
}

/// A single Docker container, upserted every scan cycle and pruned when it
/// no longer appears in the host's container list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Container {
    pub id: i64,
    pub host_id: i64,
    pub stack_id: Option<i64>,
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: Vec<ContainerPort>,
    pub labels: JsonValue,
    pub env: Vec<String>,
    pub networks: JsonValue,
    pub mounts: JsonValue,
    pub ip_addr: Option<String>,
    pub created_ts: Option<DateTime<Utc>>,
    pub owner: String,
    pub deployment_stamp_id: Option<i64>,
    pub deployment_hash: Option<String>,
}

impl From<ContainerRow> for Container {
    fn from(row: ContainerRow) -> Self {
        Container {
            id: row.id,
            host_id: row.host_id,
            stack_id: row.stack_id,
            container_id: row.container_id,
            name: row.name,
            image: row.image,
            state: row.state,
            status: row.status,
            ports: serde_json::from_value(row.ports).unwrap_or_default(),
            labels: row.labels,
            env: serde_json::from_value(row.env).unwrap_or_default(),
            networks: row.networks,
            mounts: row.mounts,
            ip_addr: row.ip_addr,
            created_ts: row.created_ts,
            owner: row.owner,
            deployment_stamp_id: row.deployment_stamp_id,
            deployment_hash: row.deployment_hash,
        }
    }
}

/// Observed container state for one scan pass, prior to persistence.
#[derive(Debug, Clone)]
pub struct ScannedContainer {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: Vec<ContainerPort>,
    pub labels: JsonValue,
    pub env: Vec<String>,
    pub networks: JsonValue,
    pub mounts: JsonValue,
    pub ip_addr: Option<String>,
    pub created_ts: Option<DateTime<Utc>>,
    pub stack_id: Option<i64>,
}

impl Container {
    /// Upsert keyed on `(host_id, container_id)`. The container's owner is
    /// inherited from the host and never blanked on a subsequent scan.
    pub async fn upsert(pool: &PgPool, host_id: i64, owner: &str, scanned: &ScannedContainer) -> Result<Container> {
        let ports_json = serde_json::to_value(&scanned.ports)?;
        let env_json = serde_json::to_value(&scanned.env)?;

        let row = sqlx::query_as::<_, ContainerRow>(
            "INSERT INTO containers
                (host_id, stack_id, container_id, name, image, state, status,
                 ports, labels, env, networks, mounts, ip_addr, created_ts, owner)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
             ON CONFLICT (host_id, container_id) DO UPDATE SET
                stack_id = EXCLUDED.stack_id,
                name = EXCLUDED.name,
                image = EXCLUDED.image,
                state = EXCLUDED.state,
                status = EXCLUDED.status,
                ports = EXCLUDED.ports,
                labels = EXCLUDED.labels,
                env = EXCLUDED.env,
                networks = EXCLUDED.networks,
                mounts = EXCLUDED.mounts,
                ip_addr = EXCLUDED.ip_addr,
                created_ts = EXCLUDED.created_ts
             RETURNING id, host_id, stack_id, container_id, name, image, state, status,
                       ports, labels, env, networks, mounts, ip_addr, created_ts, owner,
                       deployment_stamp_id, deployment_hash",
        )
        .bind(host_id)
        .bind(scanned.stack_id)
        .bind(&scanned.container_id)
        .bind(&scanned.name)
        .bind(&scanned.image)
        .bind(&scanned.state)
        .bind(&scanned.status)
        .bind(ports_json)
        .bind(&scanned.labels)
        .bind(env_json)
        .bind(&scanned.networks)
        .bind(&scanned.mounts)
        .bind(&scanned.ip_addr)
        .bind(scanned.created_ts)
        .bind(owner)
        .fetch_one(pool)
        .await
        .context("failed to upsert container")?;

        Ok(Container::from(row))
    }

    /// Delete containers for this host whose docker id was not in the
    /// latest list call. Implements the list-then-prune ordering.
    pub async fn prune_absent(pool: &PgPool, host_id: i64, seen_ids: &[String]) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM containers WHERE host_id = $1 AND NOT (container_id = ANY($2))",
        )
        .bind(host_id)
        .bind(seen_ids)
        .execute(pool)
        .await
        .context("failed to prune containers")?;
        Ok(result.rows_affected())
    }

    pub async fn find_by_host(pool: &PgPool, host_id: i64) -> Result<Vec<Container>> {
        let rows = sqlx::query_as::<_, ContainerRow>(
            "SELECT id, host_id, stack_id, container_id, name, image, state, status,
                    ports, labels, env, networks, mounts, ip_addr, created_ts, owner,
                    deployment_stamp_id, deployment_hash
             FROM containers WHERE host_id = $1 ORDER BY name",
        )
        .bind(host_id)
        .fetch_all(pool)
        .await
        .context("failed to query containers by host")?;
        Ok(rows.into_iter().map(Container::from).collect())
    }

    /// Associate containers matching a sanitized Compose project label with
    /// a deployment stamp. Called by the Deploy Engine's background
    /// association poll after `docker compose up -d` succeeds.
    pub async fn associate_by_project(
        pool: &PgPool,
        host_id: i64,
        sanitized_project: &str,
        stamp_id: i64,
        deployment_hash: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE containers SET deployment_stamp_id = $3, deployment_hash = $4
             WHERE host_id = $1 AND labels->>'com.docker.compose.project' = $2",
        )
        .bind(host_id)
        .bind(sanitized_project)
        .bind(stamp_id)
        .bind(deployment_hash)
        .execute(pool)
        .await
        .context("failed to associate containers with stamp")?;
        Ok(result.rows_affected())
    }
}
