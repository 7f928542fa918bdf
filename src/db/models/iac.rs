use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    Local,
    Git,
}

impl RepoKind {
    fn as_str(&self) -> &'static str {
        match self {
            RepoKind::Local => "local",
            RepoKind::Git => "git",
        }
    }
}

impl std::str::FromStr for RepoKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(RepoKind::Local),
            "git" => Ok(RepoKind::Git),
            other => anyhow::bail!("unknown repo kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct IacRepo {
    pub id: i64,
    pub kind: String,
    pub root_path: String,
    pub url: Option<String>,
    pub branch: Option<String>,
    pub enabled: bool,
    pub last_scan_at: Option<DateTime<Utc>>,
}

impl IacRepo {
    pub async fn ensure_local(pool: &PgPool, root_path: &str) -> Result<IacRepo> {
        if let Some(existing) = sqlx::query_as::<_, IacRepo>(
            "SELECT id, kind, root_path, url, branch, enabled, last_scan_at
             FROM iac_repos WHERE kind = 'local' AND root_path = $1",
        )
        .bind(root_path)
        .fetch_optional(pool)
        .await
        .context("failed to look up iac repo")?
        {
            return Ok(existing);
        }

        sqlx::query_as::<_, IacRepo>(
            "INSERT INTO iac_repos (kind, root_path) VALUES ($1, $2)
             RETURNING id, kind, root_path, url, branch, enabled, last_scan_at",
        )
        .bind(RepoKind::Local.as_str())
        .bind(root_path)
        .fetch_one(pool)
        .await
        .context("failed to create iac repo")
    }

    pub async fn touch_scanned(pool: &PgPool, id: i64) -> Result<()> {
        sqlx::query("UPDATE iac_repos SET last_scan_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to touch iac repo scan time")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Host,
    Group,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Host => "host",
            ScopeKind::Group => "group",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployKind {
    Compose,
    Script,
    Unmanaged,
}

impl DeployKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployKind::Compose => "compose",
            DeployKind::Script => "script",
            DeployKind::Unmanaged => "unmanaged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SopsStatus {
    None,
    Partial,
    All,
}

impl SopsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SopsStatus::None => "none",
            SopsStatus::Partial => "partial",
            SopsStatus::All => "all",
        }
    }

    /// (I2) all iff every env file has SOPS markers; partial iff some do; else none.
    pub fn from_counts(encrypted: usize, total: usize) -> SopsStatus {
        match (encrypted, total) {
            (_, 0) => SopsStatus::None,
            (e, t) if e == t => SopsStatus::All,
            (0, _) => SopsStatus::None,
            _ => SopsStatus::Partial,
        }
    }
}

/// A directory `<root>/<dirname>/<scope>/<stack>/` projected into the DB.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct IacStack {
    pub id: i64,
    pub repo_id: i64,
    pub scope_kind: String,
    pub scope_name: String,
    pub stack_name: String,
    pub rel_path: String,
    pub compose_file: Option<String>,
    pub deploy_kind: String,
    pub sops_status: String,
    pub pull_policy: Option<String>,
    pub auto_apply_override: Option<bool>,
    pub iac_enabled: bool,
    pub hash: Option<String>,
}

/// Fields the walker derives fresh from disk on every pass.
pub struct DiscoveredStack {
    pub scope_kind: ScopeKind,
    pub scope_name: String,
    pub stack_name: String,
    pub rel_path: String,
    pub compose_file: Option<String>,
    pub deploy_kind: DeployKind,
    pub sops_status: SopsStatus,
    pub hash: Option<String>,
}

impl IacStack {
    pub async fn upsert(pool: &PgPool, repo_id: i64, discovered: &DiscoveredStack) -> Result<IacStack> {
        sqlx::query_as::<_, IacStack>(
            "INSERT INTO iac_stacks
                (repo_id, scope_kind, scope_name, stack_name, rel_path, compose_file,
                 deploy_kind, sops_status, hash)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
             ON CONFLICT (repo_id, scope_kind, scope_name, stack_name) DO UPDATE SET
                rel_path = EXCLUDED.rel_path,
                compose_file = EXCLUDED.compose_file,
                deploy_kind = EXCLUDED.deploy_kind,
                sops_status = EXCLUDED.sops_status,
                hash = EXCLUDED.hash
             RETURNING id, repo_id, scope_kind, scope_name, stack_name, rel_path, compose_file,
                       deploy_kind, sops_status, pull_policy, auto_apply_override, iac_enabled, hash",
        )
        .bind(repo_id)
        .bind(discovered.scope_kind.as_str())
        .bind(&discovered.scope_name)
        .bind(&discovered.stack_name)
        .bind(&discovered.rel_path)
        .bind(&discovered.compose_file)
        .bind(discovered.deploy_kind.as_str())
        .bind(discovered.sops_status.as_str())
        .bind(&discovered.hash)
        .fetch_one(pool)
        .await
        .context("failed to upsert iac stack")
    }

    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<IacStack>> {
        sqlx::query_as::<_, IacStack>(
            "SELECT id, repo_id, scope_kind, scope_name, stack_name, rel_path, compose_file,
                    deploy_kind, sops_status, pull_policy, auto_apply_override, iac_enabled, hash
             FROM iac_stacks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to query iac stack")
    }

    pub async fn find_by_repo(pool: &PgPool, repo_id: i64) -> Result<Vec<IacStack>> {
        sqlx::query_as::<_, IacStack>(
            "SELECT id, repo_id, scope_kind, scope_name, stack_name, rel_path, compose_file,
                    deploy_kind, sops_status, pull_policy, auto_apply_override, iac_enabled, hash
             FROM iac_stacks WHERE repo_id = $1 ORDER BY scope_name, stack_name",
        )
        .bind(repo_id)
        .fetch_all(pool)
        .await
        .context("failed to query iac stacks by repo")
    }

    /// Every stack that could deploy onto `host_name` — scoped directly to
    /// the host, or scoped to one of `groups`.
    pub async fn find_relevant_to_host(pool: &PgPool, host_name: &str, groups: &[String]) -> Result<Vec<IacStack>> {
        sqlx::query_as::<_, IacStack>(
            "SELECT id, repo_id, scope_kind, scope_name, stack_name, rel_path, compose_file,
                    deploy_kind, sops_status, pull_policy, auto_apply_override, iac_enabled, hash
             FROM iac_stacks
             WHERE (scope_kind = 'host' AND scope_name = $1)
                OR (scope_kind = 'group' AND scope_name = ANY($2))",
        )
        .bind(host_name)
        .bind(groups)
        .fetch_all(pool)
        .await
        .context("failed to query iac stacks relevant to host")
    }

    /// Stacks tracked under this repo but absent from the latest walk are
    /// deleted; cascades to services/files/deployment stamps.
    pub async fn prune_absent(pool: &PgPool, repo_id: i64, seen_rel_paths: &[String]) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM iac_stacks WHERE repo_id = $1 AND NOT (rel_path = ANY($2))",
        )
        .bind(repo_id)
        .bind(seen_rel_paths)
        .execute(pool)
        .await
        .context("failed to prune iac stacks")?;
        Ok(result.rows_affected())
    }

    pub async fn set_auto_apply_override(pool: &PgPool, id: i64, value: Option<bool>) -> Result<()> {
        sqlx::query("UPDATE iac_stacks SET auto_apply_override = $2 WHERE id = $1")
            .bind(id)
            .bind(value)
            .execute(pool)
            .await
            .context("failed to set iac stack auto_apply_override")?;
        Ok(())
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct IacService {
    pub id: i64,
    pub stack_id: i64,
    pub service_name: String,
    pub container_name: Option<String>,
    pub image: Option<String>,
    pub labels: JsonValue,
    pub env_keys: Vec<String>,
    pub env_files: Vec<String>,
    pub ports: JsonValue,
    pub volumes: JsonValue,
    pub deploy: JsonValue,
}

pub struct DiscoveredService {
    pub service_name: String,
    pub container_name: Option<String>,
    pub image: Option<String>,
    pub labels: JsonValue,
    pub env_keys: Vec<String>,
    pub env_files: Vec<String>,
    pub ports: JsonValue,
    pub volumes: JsonValue,
    pub deploy: JsonValue,
}

impl IacService {
    pub async fn upsert(pool: &PgPool, stack_id: i64, svc: &DiscoveredService) -> Result<IacService> {
        sqlx::query_as::<_, IacService>(
            "INSERT INTO iac_services
                (stack_id, service_name, container_name, image, labels, env_keys, env_files,
                 ports, volumes, deploy)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
             ON CONFLICT (stack_id, service_name) DO UPDATE SET
                container_name = EXCLUDED.container_name,
                image = EXCLUDED.image,
                labels = EXCLUDED.labels,
                env_keys = EXCLUDED.env_keys,
                env_files = EXCLUDED.env_files,
                ports = EXCLUDED.ports,
                volumes = EXCLUDED.volumes,
                deploy = EXCLUDED.deploy
             RETURNING id, stack_id, service_name, container_name, image, labels,
                       env_keys, env_files, ports, volumes, deploy",
        )
        .bind(stack_id)
        .bind(&svc.service_name)
        .bind(&svc.container_name)
        .bind(&svc.image)
        .bind(&svc.labels)
        .bind(&svc.env_keys)
        .bind(&svc.env_files)
        .bind(&svc.ports)
        .bind(&svc.volumes)
        .bind(&svc.deploy)
        .fetch_one(pool)
        .await
        .context("failed to upsert iac service")
    }

    pub async fn find_by_stack(pool: &PgPool, stack_id: i64) -> Result<Vec<IacService>> {
        sqlx::query_as::<_, IacService>(
            "SELECT id, stack_id, service_name, container_name, image, labels,
                    env_keys, env_files, ports, volumes, deploy
             FROM iac_services WHERE stack_id = $1 ORDER BY service_name",
        )
        .bind(stack_id)
        .fetch_all(pool)
        .await
        .context("failed to query iac services by stack")
    }

    pub async fn prune_absent(pool: &PgPool, stack_id: i64, seen_names: &[String]) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM iac_services WHERE stack_id = $1 AND NOT (service_name = ANY($2))",
        )
        .bind(stack_id)
        .bind(seen_names)
        .execute(pool)
        .await
        .context("failed to prune iac services")?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRole {
    Compose,
    Env,
    Script,
    Other,
}

impl FileRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileRole::Compose => "compose",
            FileRole::Env => "env",
            FileRole::Script => "script",
            FileRole::Other => "other",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct IacFile {
    pub id: i64,
    pub stack_id: i64,
    pub role: String,
    pub rel_path: String,
    pub sops: bool,
    pub sha256_hex: String,
    pub size_bytes: i64,
}

pub struct DiscoveredFile {
    pub role: FileRole,
    pub rel_path: String,
    pub sops: bool,
    pub sha256_hex: String,
    pub size_bytes: i64,
}

impl IacFile {
    pub async fn upsert(pool: &PgPool, stack_id: i64, file: &DiscoveredFile) -> Result<IacFile> {
        sqlx::query_as::<_, IacFile>(
            "INSERT INTO iac_files (stack_id, role, rel_path, sops, sha256_hex, size_bytes)
             VALUES ($1,$2,$3,$4,$5,$6)
             ON CONFLICT (stack_id, rel_path) DO UPDATE SET
                role = EXCLUDED.role,
                sops = EXCLUDED.sops,
                sha256_hex = EXCLUDED.sha256_hex,
                size_bytes = EXCLUDED.size_bytes
             RETURNING id, stack_id, role, rel_path, sops, sha256_hex, size_bytes",
        )
        .bind(stack_id)
        .bind(file.role.as_str())
        .bind(&file.rel_path)
        .bind(file.sops)
        .bind(&file.sha256_hex)
        .bind(file.size_bytes)
        .fetch_one(pool)
        .await
        .context("failed to upsert iac file")
    }

    pub async fn find_by_stack(pool: &PgPool, stack_id: i64) -> Result<Vec<IacFile>> {
        sqlx::query_as::<_, IacFile>(
            "SELECT id, stack_id, role, rel_path, sops, sha256_hex, size_bytes
             FROM iac_files WHERE stack_id = $1 ORDER BY rel_path",
        )
        .bind(stack_id)
        .fetch_all(pool)
        .await
        .context("failed to query iac files by stack")
    }

    pub async fn prune_absent(pool: &PgPool, stack_id: i64, seen_paths: &[String]) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM iac_files WHERE stack_id = $1 AND NOT (rel_path = ANY($2))",
        )
        .bind(stack_id)
        .bind(seen_paths)
        .execute(pool)
        .await
        .context("failed to prune iac files")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sops_status_from_counts() {
        assert_eq!(SopsStatus::from_counts(0, 0), SopsStatus::None);
        assert_eq!(SopsStatus::from_counts(0, 3), SopsStatus::None);
        assert_eq!(SopsStatus::from_counts(3, 3), SopsStatus::All);
        assert_eq!(SopsStatus::from_counts(1, 3), SopsStatus::Partial);
        assert_eq!(SopsStatus::from_counts(1, 1), SopsStatus::All);
    }
}
