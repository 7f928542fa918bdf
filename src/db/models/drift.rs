use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::HashMap;

use super::iac::IacService;
use super::runtime::Container;

/// `stack_id -> (bundle_hash, per-service rendered config hashes)`, updated
/// on every successful deploy and consulted to short-circuit drift queries.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct StackDriftCache {
    pub stack_id: i64,
    pub bundle_hash: String,
    pub docker_config_cache: JsonValue,
    pub last_updated: DateTime<Utc>,
}

impl StackDriftCache {
    pub async fn upsert(
        pool: &PgPool,
        stack_id: i64,
        bundle_hash: &str,
        docker_config_cache: &HashMap<String, String>,
    ) -> Result<StackDriftCache> {
        let payload = serde_json::to_value(docker_config_cache)?;
        sqlx::query_as::<_, StackDriftCache>(
            "INSERT INTO stack_drift_cache (stack_id, bundle_hash, docker_config_cache, last_updated)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (stack_id) DO UPDATE SET
                bundle_hash = EXCLUDED.bundle_hash,
                docker_config_cache = EXCLUDED.docker_config_cache,
                last_updated = now()
             RETURNING stack_id, bundle_hash, docker_config_cache, last_updated",
        )
        .bind(stack_id)
        .bind(bundle_hash)
        .bind(payload)
        .fetch_one(pool)
        .await
        .context("failed to upsert drift cache")
    }

    pub async fn find(pool: &PgPool, stack_id: i64) -> Result<Option<StackDriftCache>> {
        sqlx::query_as::<_, StackDriftCache>(
            "SELECT stack_id, bundle_hash, docker_config_cache, last_updated
             FROM stack_drift_cache WHERE stack_id = $1",
        )
        .bind(stack_id)
        .fetch_optional(pool)
        .await
        .context("failed to query drift cache")
    }
}

/// A single divergence between a stack's declared and observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriftKind {
    BundleChanged,
    ImageMismatch { service: String, declared: String, running: String },
    MissingRuntime { service: String },
    OrphanRuntimeProject { project: String },
}

/// Compare a stack's IaC services and cached bundle hash against live
/// containers for the same host, per spec §4.8 (a)-(c). (d) is a host-wide
/// condition and lives in `detect_orphan_runtime_projects` below, since it
/// can't be answered from one stack's service list alone.
pub fn compare_drift(
    cache: Option<&StackDriftCache>,
    current_bundle_hash: &str,
    iac_services: &[IacService],
    runtime_containers: &[Container],
) -> Vec<DriftKind> {
    let mut drift = Vec::new();

    match cache {
        Some(c) if c.bundle_hash == current_bundle_hash => {}
        _ => drift.push(DriftKind::BundleChanged),
    }

    let containers_by_service: HashMap<&str, &Container> = runtime_containers
        .iter()
        .filter_map(|c| {
            c.labels
                .get("com.docker.compose.service")
                .and_then(|v| v.as_str())
                .map(|s| (s, c))
        })
        .collect();

    for svc in iac_services {
        match containers_by_service.get(svc.service_name.as_str()) {
            None => drift.push(DriftKind::MissingRuntime {
                service: svc.service_name.clone(),
            }),
            Some(container) => {
                if let Some(declared_image) = &svc.image {
                    if declared_image != &container.image {
                        drift.push(DriftKind::ImageMismatch {
                            service: svc.service_name.clone(),
                            declared: declared_image.clone(),
                            running: container.image.clone(),
                        });
                    }
                }
            }
        }
    }

    drift
}

/// (d): a host's runtime compose projects that no known `iac_stacks` row
/// (sanitized) accounts for at all, independent of any single stack's
/// declared service list.
pub fn detect_orphan_runtime_projects(
    runtime_containers: &[Container],
    known_sanitized_projects: &[String],
) -> Vec<DriftKind> {
    let mut seen = std::collections::HashSet::new();
    let mut drift = Vec::new();

    for container in runtime_containers {
        let Some(project) = container.labels.get("com.docker.compose.project").and_then(|v| v.as_str()) else {
            continue;
        };
        if known_sanitized_projects.iter().any(|p| p == project) {
            continue;
        }
        if seen.insert(project.to_string()) {
            drift.push(DriftKind::OrphanRuntimeProject { project: project.to_string() });
        }
    }

    drift
}
