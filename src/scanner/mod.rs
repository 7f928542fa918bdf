//! Per-host adaptive polling: lists and inspects containers through a
//! negotiated Docker client, upserts runtime state, and prunes vanished
//! containers. Scheduling lives in `start_scanner`; the scan itself is
//! `scan_host`, which is also exercised directly in tests against a fake
//! `DockerInspector`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connector::HostConnector;
use crate::db::models::{Container, Host, RuntimeStack, ScanLog, ScannedContainer};
use crate::errors::DduiError;

/// A minimal, already-flattened view of one container as reported by the
/// Docker API, independent of whether it came from bollard or a test fake.
#[derive(Debug, Clone)]
pub struct InspectedContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: JsonValue,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub networks: JsonValue,
    pub mounts: JsonValue,
    pub ip_addr: Option<String>,
    pub created_ts: Option<chrono::DateTime<chrono::Utc>>,
}

/// Abstracts "list all containers, inspect each" over a Docker transport so
/// the scan sequencing (list → inspect → upsert → prune) can be tested
/// without a real daemon.
#[async_trait]
pub trait DockerInspector: Send + Sync {
    async fn list_container_ids(&self) -> Result<Vec<String>>;
    async fn inspect(&self, id: &str) -> Result<InspectedContainer>;
}

pub struct BollardInspector {
    docker: bollard::Docker,
}

impl BollardInspector {
    pub fn new(docker: bollard::Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl DockerInspector for BollardInspector {
    async fn list_container_ids(&self) -> Result<Vec<String>> {
        use bollard::container::ListContainersOptions;
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context("failed to list containers")?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<InspectedContainer> {
        let details = self
            .docker
            .inspect_container(id, None)
            .await
            .context("failed to inspect container")?;

        let name = details
            .name
            .clone()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        let config = details.config.clone().unwrap_or_default();
        let image = config.image.clone().unwrap_or_default();
        let labels: HashMap<String, String> = config.labels.clone().unwrap_or_default();
        let env: Vec<String> = config.env.clone().unwrap_or_default();

        let state = details.state.clone().unwrap_or_default();
        let state_str = state.status.map(|s| format!("{s:?}").to_lowercase()).unwrap_or_default();
        let status_str = details.state.and_then(|s| s.status).map(|s| format!("{s:?}")).unwrap_or_default();

        let ports = serde_json::to_value(
            details
                .network_settings
                .as_ref()
                .and_then(|ns| ns.ports.clone())
                .unwrap_or_default(),
        )
        .unwrap_or(JsonValue::Null);

        let networks = details
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.clone())
            .and_then(|n| serde_json::to_value(n).ok())
            .unwrap_or(JsonValue::Object(Default::default()));

        let ip_addr = details
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .and_then(|nets| nets.values().find_map(|n| n.ip_address.clone()))
            .filter(|ip| !ip.is_empty());

        let created_ts = details
            .created
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(InspectedContainer {
            id: id.to_string(),
            name,
            image,
            state: state_str,
            status: status_str,
            ports,
            labels,
            env,
            networks,
            mounts: serde_json::to_value(details.mounts.unwrap_or_default()).unwrap_or(JsonValue::Array(vec![])),
            ip_addr,
            created_ts,
        })
    }
}

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

fn derive_project(labels: &HashMap<String, String>) -> Option<String> {
    labels
        .get(COMPOSE_PROJECT_LABEL)
        .or_else(|| labels.get(STACK_NAMESPACE_LABEL))
        .cloned()
}

/// Flatten Docker's `NetworkSettings.Ports` map (`{"80/tcp": [{"HostIp":
/// "0.0.0.0", "HostPort": "8080"}]}`) into the spec's
/// `[{IP, PublicPort, PrivatePort, Type}]` shape.
fn flatten_ports(raw: &JsonValue) -> JsonValue {
    let mut flattened = Vec::new();
    if let JsonValue::Object(map) = raw {
        for (key, bindings) in map {
            let mut parts = key.splitn(2, '/');
            let private_port: u16 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            let proto = parts.next().unwrap_or("tcp").to_string();

            match bindings {
                JsonValue::Array(entries) if !entries.is_empty() => {
                    for entry in entries {
                        let ip = entry.get("HostIp").and_then(|v| v.as_str()).map(String::from);
                        let public_port = entry
                            .get("HostPort")
                            .and_then(|v| v.as_str())
                            .and_then(|s| s.parse::<u16>().ok());
                        flattened.push(serde_json::json!({
                            "IP": ip,
                            "PublicPort": public_port,
                            "PrivatePort": private_port,
                            "Type": proto,
                        }));
                    }
                }
                _ => {
                    flattened.push(serde_json::json!({
                        "IP": JsonValue::Null,
                        "PublicPort": JsonValue::Null,
                        "PrivatePort": private_port,
                        "Type": proto,
                    }));
                }
            }
        }
    }
    JsonValue::Array(flattened)
}

/// One full scan of `host`: list, inspect each, upsert, then prune anything
/// not observed in this pass. Returns the number of containers saved.
pub async fn scan_host(pool: &PgPool, host: &Host, inspector: &dyn DockerInspector) -> Result<usize> {
    let ids = inspector.list_container_ids().await?;
    // Prune must observe the exact set returned by the list call, independent
    // of per-id inspect failures, or a transient inspect error would cause a
    // still-running container to be pruned.
    let seen_ids = ids.clone();
    let mut saved = 0usize;

    for id in &ids {
        let inspected = match inspector.inspect(id).await {
            Ok(i) => i,
            Err(e) => {
                warn!("failed to inspect container {id} on host {}: {e:#}", host.name);
                continue;
            }
        };

        let labels_json = serde_json::to_value(&inspected.labels).unwrap_or(JsonValue::Object(Default::default()));

        let stack_id = match derive_project(&inspected.labels) {
            Some(project) => {
                let stack = RuntimeStack::ensure(pool, host.id, &project, &host.owner).await?;
                Some(stack.id)
            }
            None => None,
        };

        let scanned = ScannedContainer {
            container_id: inspected.id.clone(),
            name: inspected.name,
            image: inspected.image,
            state: inspected.state,
            status: inspected.status,
            ports: serde_json::from_value(flatten_ports(&inspected.ports)).unwrap_or_default(),
            labels: labels_json,
            env: inspected.env,
            networks: inspected.networks,
            mounts: inspected.mounts,
            ip_addr: inspected.ip_addr,
            created_ts: inspected.created_ts,
            stack_id,
        };

        Container::upsert(pool, host.id, &host.owner, &scanned).await?;
        saved += 1;
    }

    let pruned = Container::prune_absent(pool, host.id, &seen_ids).await?;

    ScanLog::record(
        pool,
        Some(host.id),
        "info",
        "scan completed",
        serde_json::json!({"saved": saved, "pruned": pruned, "listed": ids.len()}),
    )
    .await?;

    Ok(saved)
}

/// Tracks active viewers per host so the driver can shorten a host's next
/// reschedule interval (view boost). Guarded by a single mutex, per spec §5.
#[derive(Clone, Default)]
pub struct ViewBoostTracker {
    counts: Arc<Mutex<HashMap<i64, u32>>>,
}

impl ViewBoostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self, host_id: i64) {
        let mut guard = self.counts.lock().await;
        *guard.entry(host_id).or_insert(0) += 1;
    }

    pub async fn leave(&self, host_id: i64) {
        let mut guard = self.counts.lock().await;
        if let Some(count) = guard.get_mut(&host_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                guard.remove(&host_id);
            }
        }
    }

    pub async fn is_boosted(&self, host_id: i64) -> bool {
        self.counts.lock().await.get(&host_id).copied().unwrap_or(0) > 0
    }
}

/// Drives one timer per host: each scan reschedules itself after
/// completion using the base or boosted interval, so a slow host never
/// queues work.
pub struct ScannerFabric {
    pool: PgPool,
    connector: Arc<HostConnector>,
    config: Arc<Config>,
    view_boost: ViewBoostTracker,
    sweep_semaphore: Arc<Semaphore>,
}

impl ScannerFabric {
    pub fn new(pool: PgPool, connector: Arc<HostConnector>, config: Arc<Config>) -> Self {
        let sweep_semaphore = Arc::new(Semaphore::new(config.scan_concurrency));
        Self {
            pool,
            connector,
            config,
            view_boost: ViewBoostTracker::new(),
            sweep_semaphore,
        }
    }

    pub fn view_boost(&self) -> ViewBoostTracker {
        self.view_boost.clone()
    }

    /// Spawn one self-rescheduling task per host. Returns immediately; the
    /// returned handles can be aborted to stop the fabric.
    pub fn start(&self, hosts: Vec<Host>) -> Vec<tokio::task::JoinHandle<()>> {
        hosts
            .into_iter()
            .map(|host| {
                let pool = self.pool.clone();
                let connector = self.connector.clone();
                let config = self.config.clone();
                let view_boost = self.view_boost.clone();
                let sweep_semaphore = self.sweep_semaphore.clone();

                tokio::spawn(async move {
                    loop {
                        let _permit = sweep_semaphore.acquire().await;
                        let started = Instant::now();

                        let timeout = Duration::from_secs(config.scan_host_timeout_secs);
                        let outcome = tokio::time::timeout(timeout, run_one_scan(&pool, &connector, &host)).await;

                        match outcome {
                            Ok(Ok(saved)) => debug!("scanned host {}: {saved} containers", host.name),
                            Ok(Err(e)) => match e.downcast_ref::<DduiError>() {
                                Some(DduiError::SkipScan { reason, .. }) => {
                                    debug!("skipping scan for host {}: {reason}", host.name)
                                }
                                _ => warn!("scan failed for host {}: {e:#}", host.name),
                            },
                            Err(_) => warn!("scan timed out for host {} after {:?}", host.name, timeout),
                        }

                        drop(_permit);

                        let boosted = view_boost.is_boosted(host.id).await;
                        let interval = if boosted {
                            Duration::from_millis(config.scan_boost_interval_ms)
                        } else {
                            Duration::from_millis(config.scan_base_interval_ms)
                        };
                        let elapsed = started.elapsed();
                        if elapsed < interval {
                            tokio::time::sleep(interval - elapsed).await;
                        }
                    }
                })
            })
            .collect()
    }
}

async fn run_one_scan(pool: &PgPool, connector: &HostConnector, host: &Host) -> Result<usize> {
    if let Some(reason) = scan_disabled_reason(host) {
        return Err(DduiError::SkipScan { host: host.name.clone(), reason }.into());
    }
    let connected = connector.connect(host).await?;
    let inspector = BollardInspector::new(connected.docker);
    scan_host(pool, host, &inspector).await
}

/// An inventory var can pull a host out of the scan rotation entirely —
/// e.g. a host kept in inventory for its deployment history but
/// decommissioned or otherwise unreachable by design.
fn scan_disabled_reason(host: &Host) -> Option<String> {
    let val = host.vars.get("scan_disabled")?;
    (val.eq_ignore_ascii_case("true") || val == "1").then(|| "scan_disabled inventory var set".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeInspector {
        containers: Vec<InspectedContainer>,
        fail_ids: Vec<String>,
    }

    #[async_trait]
    impl DockerInspector for FakeInspector {
        async fn list_container_ids(&self) -> Result<Vec<String>> {
            Ok(self.containers.iter().map(|c| c.id.clone()).collect())
        }

        async fn inspect(&self, id: &str) -> Result<InspectedContainer> {
            if self.fail_ids.iter().any(|f| f == id) {
                anyhow::bail!("transient inspect failure for {id}");
            }
            self.containers
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .context("not found")
        }
    }

    fn sample(id: &str, project: Option<&str>) -> InspectedContainer {
        let mut labels = HashMap::new();
        if let Some(p) = project {
            labels.insert(COMPOSE_PROJECT_LABEL.to_string(), p.to_string());
        }
        InspectedContainer {
            id: id.to_string(),
            name: "grafana".to_string(),
            image: "grafana/grafana:10.3".to_string(),
            state: "running".to_string(),
            status: "Up 2 hours".to_string(),
            ports: serde_json::json!({}),
            labels,
            env: vec![],
            networks: serde_json::json!({}),
            mounts: serde_json::json!([]),
            ip_addr: None,
            created_ts: None,
        }
    }

    #[test]
    fn test_derive_project_prefers_compose_label() {
        let mut labels = HashMap::new();
        labels.insert(COMPOSE_PROJECT_LABEL.to_string(), "grafana".to_string());
        labels.insert(STACK_NAMESPACE_LABEL.to_string(), "other".to_string());
        assert_eq!(derive_project(&labels), Some("grafana".to_string()));
    }

    #[test]
    fn test_derive_project_falls_back_to_stack_namespace() {
        let mut labels = HashMap::new();
        labels.insert(STACK_NAMESPACE_LABEL.to_string(), "swarmstack".to_string());
        assert_eq!(derive_project(&labels), Some("swarmstack".to_string()));
    }

    #[test]
    fn test_flatten_ports_handles_mapped_and_unmapped() {
        let raw = serde_json::json!({
            "80/tcp": [{"HostIp": "0.0.0.0", "HostPort": "8080"}],
            "443/tcp": null,
        });
        let flattened = flatten_ports(&raw);
        let arr = flattened.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert!(arr.iter().any(|p| p["PrivatePort"] == 80 && p["PublicPort"] == 8080));
        assert!(arr.iter().any(|p| p["PrivatePort"] == 443 && p["PublicPort"].is_null()));
    }

    fn test_database_url() -> Option<String> {
        std::env::var("DDUI_TEST_DATABASE_URL").ok()
    }

    fn sample_host(vars: HashMap<String, String>) -> Host {
        Host { id: 1, name: "anchorage".to_string(), addr: "10.30.1.122".to_string(), vars, groups: vec![], owner: "infra".to_string() }
    }

    #[test]
    fn test_scan_disabled_reason_none_by_default() {
        assert_eq!(scan_disabled_reason(&sample_host(HashMap::new())), None);
    }

    #[test]
    fn test_scan_disabled_reason_set_when_true() {
        let mut vars = HashMap::new();
        vars.insert("scan_disabled".to_string(), "true".to_string());
        assert!(scan_disabled_reason(&sample_host(vars)).is_some());
    }

    #[test]
    fn test_scan_disabled_reason_none_when_false() {
        let mut vars = HashMap::new();
        vars.insert("scan_disabled".to_string(), "false".to_string());
        assert_eq!(scan_disabled_reason(&sample_host(vars)), None);
    }

    #[tokio::test]
    async fn test_scan_host_is_idempotent() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };
        let pool = sqlx::PgPool::connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        sqlx::query("TRUNCATE hosts CASCADE").execute(&pool).await.unwrap();

        let host = crate::db::models::Host::create(
            &pool,
            &crate::db::models::NewHost {
                name: "anchorage".to_string(),
                addr: "10.30.1.122".to_string(),
                vars: Default::default(),
                groups: vec![],
                owner: "infra".to_string(),
            },
        )
        .await
        .unwrap();

        let inspector = FakeInspector {
            containers: vec![sample("abc123", Some("grafana"))],
            fail_ids: vec![],
        };

        let first = scan_host(&pool, &host, &inspector).await.unwrap();
        let second = scan_host(&pool, &host, &inspector).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 1);

        let containers = Container::find_by_host(&pool, host.id).await.unwrap();
        assert_eq!(containers.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_host_prunes_vanished_containers() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };
        let pool = sqlx::PgPool::connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        sqlx::query("TRUNCATE hosts CASCADE").execute(&pool).await.unwrap();

        let host = crate::db::models::Host::create(
            &pool,
            &crate::db::models::NewHost {
                name: "anchorage".to_string(),
                addr: "10.30.1.122".to_string(),
                vars: Default::default(),
                groups: vec![],
                owner: "infra".to_string(),
            },
        )
        .await
        .unwrap();

        let first_pass = FakeInspector {
            containers: vec![sample("keep", None), sample("gone", None)],
            fail_ids: vec![],
        };
        scan_host(&pool, &host, &first_pass).await.unwrap();

        let second_pass = FakeInspector {
            containers: vec![sample("keep", None)],
            fail_ids: vec![],
        };
        scan_host(&pool, &host, &second_pass).await.unwrap();

        let containers = Container::find_by_host(&pool, host.id).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].container_id, "keep");
    }

    /// P2: prune must observe the exact set returned by the list call, so a
    /// transient per-id inspect failure must not cause that container to be
    /// pruned.
    #[tokio::test]
    async fn test_scan_host_does_not_prune_on_transient_inspect_failure() {
        let Some(url) = test_database_url() else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };
        let pool = sqlx::PgPool::connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        sqlx::query("TRUNCATE hosts CASCADE").execute(&pool).await.unwrap();

        let host = crate::db::models::Host::create(
            &pool,
            &crate::db::models::NewHost {
                name: "anchorage".to_string(),
                addr: "10.30.1.122".to_string(),
                vars: Default::default(),
                groups: vec![],
                owner: "infra".to_string(),
            },
        )
        .await
        .unwrap();

        let first_pass = FakeInspector {
            containers: vec![sample("flaky", None), sample("stable", None)],
            fail_ids: vec![],
        };
        scan_host(&pool, &host, &first_pass).await.unwrap();

        let second_pass = FakeInspector {
            containers: vec![sample("flaky", None), sample("stable", None)],
            fail_ids: vec!["flaky".to_string()],
        };
        let saved = scan_host(&pool, &host, &second_pass).await.unwrap();
        assert_eq!(saved, 1);

        let containers = Container::find_by_host(&pool, host.id).await.unwrap();
        let mut ids: Vec<&str> = containers.iter().map(|c| c.container_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["flaky", "stable"]);
    }
}
