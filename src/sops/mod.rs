//! Stages an IaC stack's tracked files into a short-lived scratch directory,
//! transparently decrypting SOPS-protected compose/env files when a key is
//! configured. Never mutates the tracked files themselves.

use crate::config::Config;
use crate::db::models::{FileRole, IacFile, IacService, IacStack};
use crate::errors::DduiError;
use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

const SOPS_MARKERS: &[&str] = &["sops:", "ENC[", "AGE-ENCRYPTED"];
const SOPS_SCAN_BYTES: usize = 4096;

/// One file copied or decrypted into the scratch directory.
pub struct StagedFile {
    pub role: FileRole,
    pub rel_path: String,
    pub staged_path: PathBuf,
}

/// The result of staging one stack: its scratch directory, the staged
/// files, and a guard that removes the directory on drop.
pub struct StagedStack {
    pub stage_dir: PathBuf,
    pub files: Vec<StagedFile>,
    _cleanup: ScratchDirGuard,
}

struct ScratchDirGuard(PathBuf);

impl Drop for ScratchDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove stage dir {}: {e}", self.0.display());
            }
        }
    }
}

fn has_sops_markers(content: &[u8]) -> bool {
    let prefix = String::from_utf8_lossy(&content[..content.len().min(SOPS_SCAN_BYTES)]);
    SOPS_MARKERS.iter().any(|m| prefix.contains(m))
}

/// (a) a key is configured AND (b) the file has SOPS markers.
fn should_decrypt(content: &[u8], sops_key: &Option<String>) -> bool {
    sops_key.is_some() && has_sops_markers(content)
}

async fn run_sops_decrypt(path: &Path, input_type: &str, sops_key: &str) -> Result<Vec<u8>> {
    let output = Command::new("sops")
        .args(["-d", "--input-type", input_type, "--output-type", input_type])
        .arg(path)
        .env("SOPS_AGE_KEY", sops_key)
        .output()
        .await
        .context("failed to invoke sops")?;

    if !output.status.success() {
        anyhow::bail!(
            "sops exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(output.stdout)
}

fn normalize_line_endings(bytes: &[u8]) -> Vec<u8> {
    String::from_utf8_lossy(bytes).replace("\r\n", "\n").into_bytes()
}

/// Normalize dotenv content per spec §4.5: drop `sops_*` metadata keys
/// (case-insensitive), strip a leading `export `, normalize line endings.
/// If `raw` is actually JSON (sops emitted JSON despite a dotenv request),
/// convert it to `KEY=VAL` lines first.
fn normalize_env_content(raw: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(&normalize_line_endings(raw)).to_string();
    let text = if let Ok(json) = serde_json::from_str::<serde_json::Value>(text.trim()) {
        json_to_dotenv(&json)
    } else {
        text
    };

    let mut out = String::new();
    for line in text.lines() {
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, _)) = line.split_once('=') else {
            if !line.trim().is_empty() {
                out.push_str(line);
                out.push('\n');
            }
            continue;
        };
        if key.trim().to_lowercase().starts_with("sops_") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.into_bytes()
}

fn json_to_dotenv(value: &serde_json::Value) -> String {
    let mut out = String::new();
    if let serde_json::Value::Object(map) = value {
        for (k, v) in map {
            if k.to_lowercase().starts_with("sops") {
                continue;
            }
            let scalar = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("{k}={scalar}\n"));
        }
    }
    out
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Build `builds/<kind>/<scope>/<stack>/<timestamp-shorthash>/` with mode
/// 0700 and mirror every tracked file into it, decrypting where required.
/// Also best-effort stages any `env_file` a compose service references but
/// that wasn't tracked explicitly; a missing or undecryptable untracked
/// file is logged and skipped rather than failing the whole stage.
pub async fn stage_stack(
    config: &Config,
    stack: &IacStack,
    files: &[IacFile],
    services: &[IacService],
) -> Result<StagedStack> {
    let sops_key = config
        .resolve_sops_age_key()
        .map_err(|e| DduiError::StagingError(e.to_string()))?;

    let abs_stack_dir = config.iac_root.join(&stack.rel_path);

    let stage_root = config.iac_root.join("builds").join(&stack.deploy_kind).join(&stack.scope_name).join(&stack.stack_name);
    let suffix = format!("{}-{}", chrono::Utc::now().timestamp(), random_suffix());
    let stage_dir = stage_root.join(suffix);

    std::fs::create_dir_all(&stage_dir)
        .map_err(|e| DduiError::StagingError(format!("failed to create stage dir: {e}")))?;
    std::fs::set_permissions(&stage_dir, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| DduiError::StagingError(format!("failed to chmod stage dir: {e}")))?;

    let mut staged = Vec::with_capacity(files.len());

    for file in files {
        let src = abs_stack_dir.join(&file.rel_path);
        let dst = stage_dir.join(&file.rel_path);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let role: FileRole = match file.role.as_str() {
            "compose" => FileRole::Compose,
            "env" => FileRole::Env,
            "script" => FileRole::Script,
            _ => FileRole::Other,
        };

        let raw = std::fs::read(&src)
            .map_err(|e| DduiError::StagingError(format!("failed to read {}: {e}", src.display())))?;

        match role {
            FileRole::Compose => {
                let content = if should_decrypt(&raw, &sops_key) {
                    run_sops_decrypt(&src, "yaml", sops_key.as_deref().unwrap())
                        .await
                        .map_err(|e| DduiError::StagingError(e.to_string()))?
                } else {
                    raw
                };
                std::fs::write(&dst, normalize_line_endings(&content))
                    .map_err(|e| DduiError::StagingError(e.to_string()))?;
                std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o644)).ok();
            }
            FileRole::Env => {
                let content = if should_decrypt(&raw, &sops_key) {
                    run_sops_decrypt(&src, "dotenv", sops_key.as_deref().unwrap())
                        .await
                        .map_err(|e| DduiError::StagingError(e.to_string()))?
                } else {
                    raw
                };
                let normalized = normalize_env_content(&content);
                std::fs::write(&dst, normalized).map_err(|e| DduiError::StagingError(e.to_string()))?;
                std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o600)).ok();
            }
            FileRole::Script | FileRole::Other => {
                std::fs::write(&dst, &raw).map_err(|e| DduiError::StagingError(e.to_string()))?;
            }
        }

        debug!("staged {} -> {}", src.display(), dst.display());
        staged.push(StagedFile { role, rel_path: file.rel_path.clone(), staged_path: dst });
    }

    let tracked: std::collections::HashSet<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();

    for svc in services {
        for env_path in &svc.env_files {
            if tracked.contains(env_path.as_str()) {
                continue;
            }

            let src = abs_stack_dir.join(env_path);
            let raw = match std::fs::read(&src) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("skipping untracked env_file {}: {e}", src.display());
                    continue;
                }
            };

            let dst = stage_dir.join(env_path);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).ok();
            }

            let content = if should_decrypt(&raw, &sops_key) {
                match run_sops_decrypt(&src, "dotenv", sops_key.as_deref().unwrap()).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("skipping untracked env_file {}: decrypt failed: {e}", src.display());
                        continue;
                    }
                }
            } else {
                raw
            };
            let normalized = normalize_env_content(&content);

            if let Err(e) = std::fs::write(&dst, normalized) {
                warn!("skipping untracked env_file {}: {e}", src.display());
                continue;
            }
            std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o600)).ok();

            debug!("staged untracked env_file {} -> {}", src.display(), dst.display());
            staged.push(StagedFile { role: FileRole::Env, rel_path: env_path.clone(), staged_path: dst });
        }
    }

    Ok(StagedStack {
        stage_dir: stage_dir.clone(),
        files: staged,
        _cleanup: ScratchDirGuard(stage_dir),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(iac_root: &Path) -> Config {
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

    fn sample_stack(rel_path: &str) -> IacStack {
        IacStack {
            id: 1,
            repo_id: 1,
            scope_kind: "host".to_string(),
            scope_name: "anchorage".to_string(),
            stack_name: "grafana".to_string(),
            rel_path: rel_path.to_string(),
            compose_file: Some("docker-compose.yml".to_string()),
            deploy_kind: "compose".to_string(),
            sops_status: "none".to_string(),
            pull_policy: None,
            auto_apply_override: None,
            iac_enabled: true,
            hash: None,
        }
    }

    fn sample_service(env_files: Vec<String>) -> IacService {
        IacService {
            id: 1,
            stack_id: 1,
            service_name: "grafana".to_string(),
            container_name: None,
            image: Some("grafana/grafana:10.3".to_string()),
            labels: serde_json::json!({}),
            env_keys: vec![],
            env_files,
            ports: serde_json::json!([]),
            volumes: serde_json::json!([]),
            deploy: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_stage_stack_stages_untracked_env_file_referenced_by_service() {
        let tmp = tempfile::tempdir().unwrap();
        let iac_root = tmp.path();
        let stack_dir = iac_root.join("anchorage/grafana");
        std::fs::create_dir_all(&stack_dir).unwrap();
        std::fs::write(stack_dir.join("docker-compose.yml"), b"services:\n  grafana: {}\n").unwrap();
        std::fs::write(stack_dir.join(".env"), b"GF_SECURITY_ADMIN_PASSWORD=swordfish\n").unwrap();

        let config = test_config(iac_root);
        let stack = sample_stack("anchorage/grafana");
        let files = vec![IacFile {
            id: 1,
            stack_id: 1,
            role: "compose".to_string(),
            rel_path: "docker-compose.yml".to_string(),
            sops: false,
            sha256_hex: String::new(),
            size_bytes: 0,
        }];
        let services = vec![sample_service(vec![".env".to_string()])];

        let staged = stage_stack(&config, &stack, &files, &services).await.unwrap();

        let env = staged.files.iter().find(|f| f.rel_path == ".env").expect("untracked env_file not staged");
        assert_eq!(env.role, FileRole::Env);
        let content = std::fs::read_to_string(&env.staged_path).unwrap();
        assert!(content.contains("GF_SECURITY_ADMIN_PASSWORD=swordfish"));
    }

    #[tokio::test]
    async fn test_stage_stack_skips_missing_untracked_env_file() {
        let tmp = tempfile::tempdir().unwrap();
        let iac_root = tmp.path();
        let stack_dir = iac_root.join("anchorage/grafana");
        std::fs::create_dir_all(&stack_dir).unwrap();
        std::fs::write(stack_dir.join("docker-compose.yml"), b"services:\n  grafana: {}\n").unwrap();

        let config = test_config(iac_root);
        let stack = sample_stack("anchorage/grafana");
        let files = vec![IacFile {
            id: 1,
            stack_id: 1,
            role: "compose".to_string(),
            rel_path: "docker-compose.yml".to_string(),
            sops: false,
            sha256_hex: String::new(),
            size_bytes: 0,
        }];
        let services = vec![sample_service(vec!["missing.env".to_string()])];

        let staged = stage_stack(&config, &stack, &files, &services).await.unwrap();

        assert!(staged.files.iter().all(|f| f.rel_path != "missing.env"));
    }

    #[tokio::test]
    async fn test_stage_stack_does_not_restage_tracked_env_file() {
        let tmp = tempfile::tempdir().unwrap();
        let iac_root = tmp.path();
        let stack_dir = iac_root.join("anchorage/grafana");
        std::fs::create_dir_all(&stack_dir).unwrap();
        std::fs::write(stack_dir.join("docker-compose.yml"), b"services:\n  grafana: {}\n").unwrap();
        std::fs::write(stack_dir.join(".env"), b"FOO=bar\n").unwrap();

        let config = test_config(iac_root);
        let stack = sample_stack("anchorage/grafana");
        let files = vec![
            IacFile {
                id: 1,
                stack_id: 1,
                role: "compose".to_string(),
                rel_path: "docker-compose.yml".to_string(),
                sops: false,
                sha256_hex: String::new(),
                size_bytes: 0,
            },
            IacFile {
                id: 2,
                stack_id: 1,
                role: "env".to_string(),
                rel_path: ".env".to_string(),
                sops: false,
                sha256_hex: String::new(),
                size_bytes: 0,
            },
        ];
        let services = vec![sample_service(vec![".env".to_string()])];

        let staged = stage_stack(&config, &stack, &files, &services).await.unwrap();

        assert_eq!(staged.files.iter().filter(|f| f.rel_path == ".env").count(), 1);
    }

    #[test]
    fn test_has_sops_markers_detects_any_marker() {
        assert!(has_sops_markers(b"sops:\n  kms: []\n"));
        assert!(has_sops_markers(b"DATABASE_URL=ENC[abc]"));
        assert!(!has_sops_markers(b"DATABASE_URL=postgres://localhost"));
    }

    #[test]
    fn test_should_decrypt_requires_key_and_markers() {
        assert!(!should_decrypt(b"sops:\n", &None));
        assert!(!should_decrypt(b"plain=1", &Some("key".to_string())));
        assert!(should_decrypt(b"sops:\n", &Some("key".to_string())));
    }

    #[test]
    fn test_normalize_env_content_strips_export_and_sops_keys() {
        let raw = b"export DATABASE_URL=postgres://x\r\nsops_version=3.8.1\nDEBUG=true\n";
        let normalized = String::from_utf8(normalize_env_content(raw)).unwrap();
        assert!(normalized.contains("DATABASE_URL=postgres://x"));
        assert!(normalized.contains("DEBUG=true"));
        assert!(!normalized.contains("sops_version"));
        assert!(!normalized.contains('\r'));
    }

    #[test]
    fn test_normalize_env_content_converts_json() {
        let raw = br#"{"DATABASE_URL": "postgres://x", "sops": {"version": "3.8.1"}}"#;
        let normalized = String::from_utf8(normalize_env_content(raw)).unwrap();
        assert!(normalized.contains("DATABASE_URL=postgres://x"));
        assert!(!normalized.to_lowercase().contains("sops"));
    }
}
