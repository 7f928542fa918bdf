//! Walks `<root>/<dirname>/<scope>/<stack>/`, classifies files, detects SOPS
//! markers without decrypting, parses Compose documents, and projects the
//! result into the `iac_*` tables.

pub mod compose;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::db::models::{
    DeployKind, DiscoveredFile, DiscoveredStack, FileRole, IacFile, IacRepo, IacService, IacStack,
    ScopeKind, SopsStatus,
};
use compose::ComposeFile;
use crate::utils::ACCEPTED_COMPOSE_FILE_NAMES;

const SOPS_MARKERS: &[&str] = &["sops:", "ENC[", "AGE-ENCRYPTED"];
const SOPS_SCAN_BYTES: usize = 4096;

fn is_env_file(name: &str) -> bool {
    name == ".env"
        || name.ends_with(".env")
        || name.contains(".env.")
        || name.ends_with("_secret.env")
        || name.ends_with("_private.env")
        || name.ends_with("_secure.env")
}

fn is_script_file(name: &str) -> bool {
    matches!(name, "pre.sh" | "deploy.sh" | "post.sh")
}

/// Cheap prefix scan for SOPS markers; never decrypts (P3).
fn detect_sops_markers(path: &Path) -> Result<bool> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut buf = vec![0u8; SOPS_SCAN_BYTES];
    let n = file.read(&mut buf)?;
    let prefix = String::from_utf8_lossy(&buf[..n]);
    Ok(SOPS_MARKERS.iter().any(|marker| prefix.contains(marker)))
}

fn sha256_hex(path: &Path) -> Result<(String, u64)> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    Ok((hex::encode(digest), bytes.len() as u64))
}

/// One stack directory discovered on disk, prior to any DB upsert.
pub struct WalkedStack {
    pub scope_kind: ScopeKind,
    pub scope_name: String,
    pub stack_name: String,
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub compose_file: Option<String>,
    pub deploy_kind: DeployKind,
    pub files: Vec<(DiscoveredFile, PathBuf)>,
    pub compose: Option<ComposeFile>,
}

/// Walk `<root>/<dirname>/<scope>/<stack>/` and classify every candidate
/// stack directory. `known_hosts` decides `scope_kind` (host wins per §9 (a)
/// when a name matches both a host and a group).
pub fn discover_stacks(root: &Path, dirname: &str, known_hosts: &HashSet<String>) -> Result<Vec<WalkedStack>> {
    let base = root.join(dirname);
    let mut stacks = Vec::new();

    if !base.is_dir() {
        warn!("iac root {} does not exist", base.display());
        return Ok(stacks);
    }

    for scope_entry in std::fs::read_dir(&base).with_context(|| format!("failed to read {}", base.display()))? {
        let scope_entry = scope_entry?;
        if !scope_entry.file_type()?.is_dir() {
            continue;
        }
        let scope_name = scope_entry.file_name().to_string_lossy().to_string();

        for stack_entry in std::fs::read_dir(scope_entry.path())? {
            let stack_entry = stack_entry?;
            if !stack_entry.file_type()?.is_dir() {
                continue;
            }
            let stack_name = stack_entry.file_name().to_string_lossy().to_string();
            let abs_path = stack_entry.path();
            let rel_path = abs_path
                .strip_prefix(root)
                .unwrap_or(&abs_path)
                .to_string_lossy()
                .to_string();

            match classify_stack_dir(&abs_path, &scope_name, &stack_name, &rel_path, known_hosts) {
                Ok(Some(stack)) => stacks.push(stack),
                Ok(None) => debug_skip(&abs_path),
                Err(e) => warn!("failed to classify {}: {e:#}", abs_path.display()),
            }
        }
    }

    Ok(stacks)
}

fn debug_skip(path: &Path) {
    tracing::debug!("skipping {}: no compose/env/script files", path.display());
}

fn classify_stack_dir(
    abs_path: &Path,
    scope_name: &str,
    stack_name: &str,
    rel_path: &str,
    known_hosts: &HashSet<String>,
) -> Result<Option<WalkedStack>> {
    let mut present_names = Vec::new();
    let mut env_files = Vec::new();
    let mut scripts = Vec::new();
    let mut other_files = Vec::new();

    for entry in std::fs::read_dir(abs_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();

        if ACCEPTED_COMPOSE_FILE_NAMES.contains(&name.as_str()) {
            present_names.push(name);
        } else if is_env_file(&name) {
            env_files.push(name);
        } else if is_script_file(&name) {
            scripts.push(name);
        } else {
            other_files.push(name);
        }
    }

    // Pick by priority order, not directory-iteration order, per the
    // documented compose filename precedence.
    let compose_file = ACCEPTED_COMPOSE_FILE_NAMES
        .iter()
        .find_map(|candidate| present_names.iter().find(|n| n.as_str() == *candidate).cloned());

    if compose_file.is_none() && env_files.is_empty() && scripts.is_empty() {
        return Ok(None);
    }

    let deploy_kind = if compose_file.is_some() {
        DeployKind::Compose
    } else if !scripts.is_empty() {
        DeployKind::Script
    } else {
        DeployKind::Unmanaged
    };

    let scope_kind = if known_hosts.contains(scope_name) {
        ScopeKind::Host
    } else {
        ScopeKind::Group
    };

    let mut files = Vec::new();
    let mut encrypted_env_count = 0usize;

    if let Some(name) = &compose_file {
        let path = abs_path.join(name);
        let sops = detect_sops_markers(&path)?;
        let (sha, size) = sha256_hex(&path)?;
        files.push((
            DiscoveredFile { role: FileRole::Compose, rel_path: name.clone(), sops, sha256_hex: sha, size_bytes: size as i64 },
            path,
        ));
    }
    for name in &env_files {
        let path = abs_path.join(name);
        let sops = detect_sops_markers(&path)?;
        if sops {
            encrypted_env_count += 1;
        }
        let (sha, size) = sha256_hex(&path)?;
        files.push((
            DiscoveredFile { role: FileRole::Env, rel_path: name.clone(), sops, sha256_hex: sha, size_bytes: size as i64 },
            path,
        ));
    }
    for name in &scripts {
        let path = abs_path.join(name);
        let (sha, size) = sha256_hex(&path)?;
        files.push((
            DiscoveredFile { role: FileRole::Script, rel_path: name.clone(), sops: false, sha256_hex: sha, size_bytes: size as i64 },
            path,
        ));
    }
    for name in &other_files {
        let path = abs_path.join(name);
        let (sha, size) = sha256_hex(&path)?;
        files.push((
            DiscoveredFile { role: FileRole::Other, rel_path: name.clone(), sops: false, sha256_hex: sha, size_bytes: size as i64 },
            path,
        ));
    }

    let sops_status = SopsStatus::from_counts(encrypted_env_count, env_files.len());

    let compose = match &compose_file {
        Some(name) => {
            let content = std::fs::read_to_string(abs_path.join(name))?;
            Some(compose::parse_compose(&content).context("failed to parse compose file")?)
        }
        None => None,
    };

    let combined_hash = {
        let mut hasher = Sha256::new();
        for (f, _) in &files {
            hasher.update(f.sha256_hex.as_bytes());
        }
        hex::encode(hasher.finalize())
    };

    Ok(Some(WalkedStack {
        scope_kind,
        scope_name: scope_name.to_string(),
        stack_name: stack_name.to_string(),
        rel_path: rel_path.to_string(),
        abs_path: abs_path.to_path_buf(),
        compose_file,
        deploy_kind,
        files,
        compose,
    }))
}

/// Project one repo's walk results into the database: upsert every
/// discovered stack/service/file, then prune rows no longer present.
pub async fn sync_repo(pool: &PgPool, repo: &IacRepo, root: &Path, dirname: &str, known_hosts: &HashSet<String>) -> Result<(usize, usize)> {
    let walked = discover_stacks(root, dirname, known_hosts)?;
    let mut stacks_found = 0;
    let mut services_saved = 0;
    let mut seen_rel_paths = Vec::new();

    for stack in &walked {
        seen_rel_paths.push(stack.rel_path.clone());

        let discovered = DiscoveredStack {
            scope_kind: stack.scope_kind,
            scope_name: stack.scope_name.clone(),
            stack_name: stack.stack_name.clone(),
            rel_path: stack.rel_path.clone(),
            compose_file: stack.compose_file.clone(),
            deploy_kind: stack.deploy_kind,
            sops_status: sops_status_of(stack),
            hash: None,
        };
        let iac_stack = IacStack::upsert(pool, repo.id, &discovered).await?;
        stacks_found += 1;

        let mut seen_files = Vec::new();
        for (file, _path) in &stack.files {
            IacFile::upsert(pool, iac_stack.id, file).await?;
            seen_files.push(file.rel_path.clone());
        }
        IacFile::prune_absent(pool, iac_stack.id, &seen_files).await?;

        let mut seen_services = Vec::new();
        if let Some(compose) = &stack.compose {
            for (name, service) in &compose.services {
                let discovered_service = compose::to_discovered_service(name, service);
                IacService::upsert(pool, iac_stack.id, &discovered_service).await?;
                seen_services.push(name.clone());
                services_saved += 1;
            }
        }
        IacService::prune_absent(pool, iac_stack.id, &seen_services).await?;
    }

    // Stacks tracked under this repo but absent from this walk are deleted
    // (cascades); so are stacks with no tracked files.
    IacStack::prune_absent(pool, repo.id, &seen_rel_paths).await?;

    IacRepo::touch_scanned(pool, repo.id).await?;
    info!("iac walk complete: {stacks_found} stacks, {services_saved} services");

    Ok((stacks_found, services_saved))
}

fn sops_status_of(stack: &WalkedStack) -> SopsStatus {
    let env_files: Vec<_> = stack.files.iter().filter(|(f, _)| f.role == FileRole::Env).collect();
    let encrypted = env_files.iter().filter(|(f, _)| f.sops).count();
    SopsStatus::from_counts(encrypted, env_files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_discover_stacks_classifies_compose_and_scope() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("docker-compose/anchorage/grafana/compose.yaml"),
            "services:\n  grafana:\n    image: grafana/grafana:10.3\n",
        );

        let mut known_hosts = HashSet::new();
        known_hosts.insert("anchorage".to_string());

        let stacks = discover_stacks(root, "docker-compose", &known_hosts).unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].scope_kind, ScopeKind::Host);
        assert_eq!(stacks[0].stack_name, "grafana");
        assert_eq!(stacks[0].deploy_kind, DeployKind::Compose);
        let compose = stacks[0].compose.as_ref().unwrap();
        assert_eq!(compose.services["grafana"].image.as_deref(), Some("grafana/grafana:10.3"));
    }

    #[test]
    fn test_discover_stacks_scope_kind_group_when_unknown_host() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("docker-compose/monitoring/grafana/compose.yaml"), "services: {}\n");

        let stacks = discover_stacks(root, "docker-compose", &HashSet::new()).unwrap();
        assert_eq!(stacks[0].scope_kind, ScopeKind::Group);
    }

    #[test]
    fn test_sops_marker_detected_on_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("docker-compose/anchorage/grafana/.env"), "sops:\n  kms: []\nDATA=ENC[abc]\n");
        write(&root.join("docker-compose/anchorage/grafana/compose.yaml"), "services: {}\n");

        let stacks = discover_stacks(root, "docker-compose", &HashSet::new()).unwrap();
        let env_file = stacks[0]
            .files
            .iter()
            .find(|(f, _)| f.role == FileRole::Env)
            .unwrap();
        assert!(env_file.0.sops);
    }

    #[test]
    fn test_empty_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("docker-compose/anchorage/empty")).unwrap();

        let stacks = discover_stacks(root, "docker-compose", &HashSet::new()).unwrap();
        assert!(stacks.is_empty());
    }

    #[test]
    fn test_script_only_stack_is_deploy_kind_script() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("docker-compose/anchorage/job/deploy.sh"), "#!/bin/sh\necho hi\n");

        let stacks = discover_stacks(root, "docker-compose", &HashSet::new()).unwrap();
        assert_eq!(stacks[0].deploy_kind, DeployKind::Script);
    }

    #[test]
    fn test_compose_file_precedence_prefers_docker_compose_yml() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("docker-compose/anchorage/grafana/compose.yaml"), "services: {}\n");
        write(&root.join("docker-compose/anchorage/grafana/docker-compose.yml"), "services: {}\n");

        let stacks = discover_stacks(root, "docker-compose", &HashSet::new()).unwrap();
        assert_eq!(stacks[0].compose_file.as_deref(), Some("docker-compose.yml"));
    }
}
