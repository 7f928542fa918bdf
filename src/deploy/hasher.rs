//! Rendered Config Hasher: derives the fingerprints the Deploy Engine uses
//! to decide whether a stack's declared state actually changed.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;

/// `sha256(concatenated staged compose bytes)`, lowercase hex. This is the
/// "content hash" keyed on in the deployment stamp uniqueness constraint.
pub fn bundle_hash(staged_compose_paths: &[std::path::PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in staged_compose_paths {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Runs `docker compose -p <raw> -f <files...> config --hash`, which prints
/// one `<service> <hash>` line per service, and returns the parsed map plus
/// a combined hash over the sorted output lines.
pub async fn rendered_config_hash(
    stage_dir: &Path,
    raw_project: &str,
    compose_files: &[String],
) -> Result<(String, HashMap<String, String>)> {
    let mut args = vec!["compose".to_string(), "-p".to_string(), raw_project.to_string()];
    for f in compose_files {
        args.push("-f".to_string());
        args.push(f.clone());
    }
    args.push("config".to_string());
    args.push("--hash".to_string());
    args.push("*".to_string());

    let output = Command::new("docker")
        .args(&args)
        .current_dir(stage_dir)
        .output()
        .await
        .context("failed to run docker compose config --hash")?;

    if !output.status.success() {
        anyhow::bail!(
            "docker compose config --hash exited {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut per_service = HashMap::new();
    let mut lines: Vec<&str> = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        lines.push(line);
        if let Some((service, hash)) = line.rsplit_once(' ') {
            per_service.insert(service.trim().to_string(), hash.trim().to_string());
        }
    }
    lines.sort_unstable();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    let combined = hex::encode(hasher.finalize());

    Ok((combined, per_service))
}

/// `sha256(content)` in lowercase hex — the deployment hash keyed on in the
/// stamp uniqueness constraint.
pub fn deployment_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
