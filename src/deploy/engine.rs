//! Deploy Engine: stage, fingerprint, stamp, `docker compose up -d`, and
//! background container association (spec §4.5).

use crate::config::Config;
use crate::connector::HostConnector;
use crate::db::models::{
    Container, DeploymentStamp, DeploymentStatus, FileRole, Host, IacFile, IacService, IacStack, RuntimeStack,
    SettingsCache, StackDriftCache,
};
use crate::errors::DduiError;
use crate::sops::stage_stack;
use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::hasher;
use super::policy::should_auto_apply;

/// One line of the deploy event stream, per spec §4.5's `deployStack` contract.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployEvent {
    Info { message: String },
    Stdout { message: String },
    Stderr { message: String },
    Error { message: String },
    Success { message: String },
    ConfigUnchanged { stamp_id: i64, status: String },
    Complete { stamp_id: i64, status: String },
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub manual: bool,
    pub force: bool,
}

/// Compose-style project-name sanitization: lowercase, replace anything
/// that isn't `[a-z0-9_-]` with `_`, strip leading non-alphanumerics.
pub fn sanitize_project(raw: &str) -> String {
    let invalid = regex::Regex::new(r"[^a-z0-9_-]").unwrap();
    let leading = regex::Regex::new(r"^[^a-z0-9]+").unwrap();

    let lowered = raw.to_lowercase();
    let replaced = invalid.replace_all(&lowered, "_");
    let stripped = leading.replace(&replaced, "");
    if stripped.is_empty() {
        "stack".to_string()
    } else {
        stripped.into_owned()
    }
}

/// Orchestrates one deploy attempt for `stack`, emitting events on `tx`.
pub async fn deploy_stack(
    pool: &PgPool,
    cache: &SettingsCache,
    config: &Config,
    connector: &HostConnector,
    stack: &IacStack,
    options: DeployOptions,
    tx: mpsc::Sender<DeployEvent>,
) -> Result<()> {
    if !options.manual && !should_auto_apply(pool, cache, config, stack).await? {
        let _ = tx.send(DeployEvent::Error { message: "auto-apply denied by policy".to_string() }).await;
        return Err(DduiError::PolicyDenied { stack_id: stack.id }.into());
    }

    let raw_project = stack.stack_name.clone();
    let sanitized_project = sanitize_project(&raw_project);

    let _ = tx.send(DeployEvent::Info { message: format!("staging {raw_project}") }).await;

    let files = IacFile::find_by_stack(pool, stack.id).await?;
    let services = IacService::find_by_stack(pool, stack.id).await?;
    let staged = match stage_stack(config, stack, &files, &services).await {
        Ok(s) => s,
        Err(e) => {
            let _ = tx.send(DeployEvent::Error { message: format!("staging failed: {e:#}") }).await;
            return Err(e);
        }
    };

    let compose_paths: Vec<std::path::PathBuf> = staged
        .files
        .iter()
        .filter(|f| f.role == FileRole::Compose)
        .map(|f| f.staged_path.clone())
        .collect();
    if compose_paths.is_empty() {
        let _ = tx.send(DeployEvent::Error { message: "no compose file staged".to_string() }).await;
        anyhow::bail!("stack {} has no compose file to deploy", stack.stack_name);
    }

    let content_hash = hasher::bundle_hash(&compose_paths)?;

    if !options.force {
        if let Some(existing) = DeploymentStamp::find_existing(pool, stack.id, &content_hash).await? {
            let _ = tx
                .send(DeployEvent::ConfigUnchanged {
                    stamp_id: existing.id,
                    status: existing.deployment_status.clone(),
                })
                .await;
            return Ok(());
        }
    }

    let compose_file_names: Vec<String> = staged
        .files
        .iter()
        .filter(|f| f.role == FileRole::Compose)
        .map(|f| f.staged_path.file_name().unwrap().to_string_lossy().to_string())
        .collect();

    let (rendered_hash, per_service) =
        hasher::rendered_config_hash(&staged.stage_dir, &raw_project, &compose_file_names).await.unwrap_or_else(|e| {
            warn!("failed to compute rendered config hash: {e:#}");
            (String::new(), HashMap::new())
        });

    let meta = serde_json::json!({
        "rendered_config_hash": rendered_hash,
        "bundle_hash": content_hash,
    });

    let stamp = DeploymentStamp::create_or_get(
        pool,
        stack.id,
        &content_hash,
        "compose",
        &config.default_owner,
        &meta,
    )
    .await?;

    let host = Host::find_by_name(pool, &stack.scope_name).await?;
    let Some(host) = host else {
        let _ = tx
            .send(DeployEvent::Error { message: format!("no host named {} to deploy to", stack.scope_name) })
            .await;
        DeploymentStamp::update_status(pool, stamp.id, DeploymentStatus::Failed).await?;
        anyhow::bail!("stack {} has scope_kind=group; deploy requires a resolvable host", stack.scope_name);
    };

    let (docker_host, _tunnel) = connector.docker_host_env(&host).await?;

    let mut args = vec!["compose".to_string(), "-p".to_string(), raw_project.clone()];
    for name in &compose_file_names {
        args.push("-f".to_string());
        args.push(name.clone());
    }
    args.push("up".to_string());
    args.push("-d".to_string());
    args.push("--remove-orphans".to_string());

    let _ = tx.send(DeployEvent::Info { message: format!("docker {}", args.join(" ")) }).await;

    let mut child = Command::new("docker")
        .args(&args)
        .current_dir(&staged.stage_dir)
        .env("DOCKER_HOST", &docker_host)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let tx_out = tx.clone();
    let stdout_task = tokio::spawn(async move {
        while let Ok(Some(line)) = stdout_lines.next_line().await {
            let _ = tx_out.send(DeployEvent::Stdout { message: line }).await;
        }
    });
    let tx_err = tx.clone();
    let stderr_task = tokio::spawn(async move {
        while let Ok(Some(line)) = stderr_lines.next_line().await {
            let _ = tx_err.send(DeployEvent::Stderr { message: line }).await;
        }
    });

    let status = child.wait().await?;
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    if !status.success() {
        DeploymentStamp::update_status(pool, stamp.id, DeploymentStatus::Failed).await?;
        let _ = tx
            .send(DeployEvent::Error { message: format!("docker compose up exited {:?}", status.code()) })
            .await;
        return Err(DduiError::CommandFailure {
            exit_code: status.code(),
            message: "docker compose up failed".to_string(),
        }
        .into());
    }

    DeploymentStamp::update_status(pool, stamp.id, DeploymentStatus::Success).await?;
    StackDriftCache::upsert(pool, stack.id, &content_hash, &per_service).await?;

    let _ = tx.send(DeployEvent::Success { message: "deploy succeeded".to_string() }).await;
    let _ = tx
        .send(DeployEvent::Complete { stamp_id: stamp.id, status: DeploymentStatus::Success.as_str().to_string() })
        .await;

    spawn_association_poll(pool.clone(), host.id, sanitized_project, stamp.id, content_hash);

    Ok(())
}

/// Poll for containers matching the deployed project label, bounded
/// retries with backoff (§4.5 step 9). Errors here are logged, never
/// surfaced to the caller.
fn spawn_association_poll(pool: PgPool, host_id: i64, sanitized_project: String, stamp_id: i64, deployment_hash: String) {
    tokio::spawn(async move {
        let mut delay = Duration::from_millis(500);
        for attempt in 1..=6 {
            tokio::time::sleep(delay).await;
            match Container::associate_by_project(&pool, host_id, &sanitized_project, stamp_id, &deployment_hash).await {
                Ok(n) if n > 0 => {
                    info!("associated {n} containers with stamp {stamp_id} on attempt {attempt}");
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!("association poll failed on attempt {attempt}: {e:#}"),
            }
            delay = (delay * 2).min(Duration::from_secs(10));
        }
        warn!("no containers associated with stamp {stamp_id} after retries");
    });
}

/// Auto-DevOps periodic pass: evaluate every Compose-deployable stack and
/// fire a non-manual deploy where the policy allows it.
pub async fn run_auto_devops_pass(
    pool: &PgPool,
    cache: &SettingsCache,
    config: &Config,
    connector: &HostConnector,
) -> Result<()> {
    // Only host-scoped stacks: deploy_stack resolves scope_name to a single
    // Host and has no fanout to a group's members, so a group-scoped stack
    // selected here would fail every pass and never recover.
    let stacks = sqlx::query_as::<_, RuntimeStackJoinRow>(
        "SELECT id FROM iac_stacks WHERE deploy_kind = 'compose' AND iac_enabled = true AND scope_kind = 'host'",
    )
    .fetch_all(pool)
    .await?;

    for row in stacks {
        let Some(stack) = IacStack::find_by_id(pool, row.id).await? else { continue };
        if !should_auto_apply(pool, cache, config, &stack).await.unwrap_or(false) {
            continue;
        }
        let (tx, mut rx) = mpsc::channel(16);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        if let Err(e) = deploy_stack(pool, cache, config, connector, &stack, DeployOptions::default(), tx).await {
            error!("auto-devops deploy failed for stack {}: {e:#}", stack.stack_name);
        }
        let _ = drain.await;
    }

    Ok(())
}

#[derive(sqlx::FromRow)]
struct RuntimeStackJoinRow {
    id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::host::{Host, NewHost};
    use crate::db::models::iac::{DeployKind, DiscoveredFile, DiscoveredStack, IacRepo, ScopeKind, SopsStatus};
    use std::collections::HashMap;

    #[test]
    fn test_sanitize_project_lowercases_and_replaces_invalid_chars() {
        assert_eq!(sanitize_project("Grafana Stack!"), "grafana_stack_");
        assert_eq!(sanitize_project("my-app_01"), "my-app_01");
    }

    #[test]
    fn test_sanitize_project_strips_leading_punctuation() {
        assert_eq!(sanitize_project("--grafana"), "grafana");
    }

    #[test]
    fn test_sanitize_project_empty_falls_back() {
        assert_eq!(sanitize_project("---"), "stack");
    }

    fn test_database_url() -> Option<String> {
        std::env::var("DDUI_TEST_DATABASE_URL").ok()
    }

    fn test_config(iac_root: &std::path::Path) -> Config {
        use clap::Parser;
        Config::try_parse_from([
            "ddui",
            "--database-url",
            "postgres://localhost/ddui",
            "--iac-root",
            iac_root.to_str().unwrap(),
        ])
        .unwrap()
    }

    /// P7: when the staged bundle hash already has a stamp, `deploy_stack`
    /// must short-circuit with `ConfigUnchanged` and never invoke `docker`.
    #[tokio::test]
    async fn test_deploy_stack_short_circuits_on_unchanged_config() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };
        let pool = PgPool::connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        sqlx::query("TRUNCATE iac_repos, hosts CASCADE").execute(&pool).await.unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let iac_root = tmp.path();
        let stack_dir = iac_root.join("anchorage/grafana");
        std::fs::create_dir_all(&stack_dir).unwrap();
        let compose_content = b"services:\n  grafana:\n    image: grafana/grafana:10.3\n".to_vec();
        std::fs::write(stack_dir.join("docker-compose.yml"), &compose_content).unwrap();

        let config = test_config(iac_root);

        Host::create(
            &pool,
            &NewHost {
                name: "anchorage".to_string(),
                addr: "10.30.1.122".to_string(),
                vars: HashMap::new(),
                groups: vec![],
                owner: "infra".to_string(),
            },
        )
        .await
        .unwrap();

        let repo = IacRepo::ensure_local(&pool, &iac_root.to_string_lossy()).await.unwrap();
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

        IacFile::upsert(
            &pool,
            stack.id,
            &DiscoveredFile {
                role: FileRole::Compose,
                rel_path: "docker-compose.yml".to_string(),
                sops: false,
                sha256_hex: "unused".to_string(),
                size_bytes: compose_content.len() as i64,
            },
        )
        .await
        .unwrap();

        // The file has no CRLF, so staging normalizes nothing and the bundle
        // hash over the raw bytes equals the one `deploy_stack` will compute.
        let expected_hash = hasher::bundle_hash(&[stack_dir.join("docker-compose.yml")]).unwrap();
        let seeded = DeploymentStamp::create_or_get(
            &pool,
            stack.id,
            &expected_hash,
            "compose",
            &config.default_owner,
            &serde_json::json!({}),
        )
        .await
        .unwrap();

        let cache = SettingsCache::new();
        let connector = HostConnector::new(std::sync::Arc::new(config.clone()));
        let (tx, mut rx) = mpsc::channel(16);

        let result = deploy_stack(
            &pool,
            &cache,
            &config,
            &connector,
            &stack,
            DeployOptions { manual: true, force: false },
            tx,
        )
        .await;

        assert!(result.is_ok());
        match rx.recv().await.unwrap() {
            DeployEvent::ConfigUnchanged { stamp_id, .. } => assert_eq!(stamp_id, seeded.id),
            other => panic!("expected ConfigUnchanged, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM deployment_stamps WHERE stack_id = $1")
            .bind(stack.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
