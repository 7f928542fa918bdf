mod config;
mod connector;
mod db;
mod deploy;
mod errors;
mod iac;
mod inventory;
mod scanner;
mod server;
mod sops;
mod utils;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("starting ddui");
    check_required_binaries();

    let db = db::Database::new(&config.database_url, config.database_max_connections).await?;
    db.migrate().await?;
    let pool = db.pool().clone();

    let cache = db::models::SettingsCache::new();
    let config = Arc::new(config);
    let connector = Arc::new(connector::HostConnector::new(config.clone()));

    let initial_inventory = inventory::load(&config.inventory_path, &config.default_owner)
        .context("failed to load initial inventory")?;
    sync_hosts(&pool, &initial_inventory).await?;

    let hosts = db::models::Host::find_all(&pool).await?;
    info!("loaded {} hosts from inventory", hosts.len());

    let fabric = scanner::ScannerFabric::new(pool.clone(), connector.clone(), config.clone());
    let mut tasks = fabric.start(hosts);

    tasks.push(spawn_inventory_watcher(pool.clone(), config.clone()));
    tasks.push(spawn_iac_walker(pool.clone(), config.clone()));
    tasks.push(spawn_auto_devops(pool.clone(), cache.clone(), config.clone(), connector.clone()));
    tasks.push(spawn_stamp_retention(pool.clone(), config.clone()));

    let ctx = server::ServerContext {
        config: config.clone(),
        pool: pool.clone(),
        cache,
        connector,
    };

    info!("listening on {}", config.bind_address());
    server::serve(ctx).await?;

    for task in tasks {
        task.abort();
    }

    Ok(())
}

/// `docker` is required for every deploy; `sops` only for encrypted IaC.
/// Neither missing is fatal here — the failure surfaces at the first
/// deploy/stage attempt that actually needs the binary.
fn check_required_binaries() {
    if which::which("docker").is_err() {
        warn!("docker binary not found on PATH; deploys will fail");
    }
    if which::which("sops").is_err() {
        warn!("sops binary not found on PATH; encrypted IaC staging will fail");
    }
}

async fn sync_hosts(pool: &sqlx::PgPool, inventory: &inventory::Inventory) -> Result<()> {
    let mut names = Vec::with_capacity(inventory.hosts.len());
    for host in &inventory.hosts {
        db::models::Host::upsert(pool, &host.clone().into_new_host()).await?;
        names.push(host.name.clone());
    }
    let removed = db::models::Host::delete_absent(pool, &names).await?;
    if removed > 0 {
        info!("removed {removed} host(s) no longer present in inventory");
    }
    Ok(())
}

fn spawn_inventory_watcher(pool: sqlx::PgPool, config: Arc<config::Config>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let owner = config.default_owner.clone();
        let path = config.inventory_path.clone();
        inventory::watch(path, owner, std::time::Duration::from_secs(10), move |loaded| {
            let pool = pool.clone();
            match loaded {
                Ok(inventory) => {
                    tokio::spawn(async move {
                        if let Err(e) = sync_hosts(&pool, &inventory).await {
                            error!("failed to sync hosts from updated inventory: {e:#}");
                        }
                    });
                }
                Err(e) => error!("failed to reload inventory: {e:#}"),
            }
        })
        .await;
    })
}

fn spawn_iac_walker(pool: sqlx::PgPool, config: Arc<config::Config>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(config.iac_walk_interval_secs));
        loop {
            interval.tick().await;
            let repo = match db::models::IacRepo::ensure_local(&pool, &config.iac_root.to_string_lossy()).await {
                Ok(repo) => repo,
                Err(e) => {
                    error!("failed to load iac repo record: {e:#}");
                    continue;
                }
            };
            let known_hosts: HashSet<String> = match db::models::Host::find_all(&pool).await {
                Ok(hosts) => hosts.into_iter().map(|h| h.name).collect(),
                Err(e) => {
                    error!("failed to load hosts for iac walk: {e:#}");
                    continue;
                }
            };
            match iac::sync_repo(&pool, &repo, &config.iac_root, &config.iac_dirname, &known_hosts).await {
                Ok((stacks, files)) => info!("iac walk: {stacks} stack(s), {files} file(s)"),
                Err(e) => warn!("iac walk failed: {e:#}"),
            }
        }
    })
}

fn spawn_auto_devops(
    pool: sqlx::PgPool,
    cache: db::models::SettingsCache,
    config: Arc<config::Config>,
    connector: Arc<connector::HostConnector>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(config.auto_devops_interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = deploy::run_auto_devops_pass(&pool, &cache, &config, &connector).await {
                error!("auto-devops pass failed: {e:#}");
            }
        }
    })
}

fn spawn_stamp_retention(pool: sqlx::PgPool, config: Arc<config::Config>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let stack_ids: Vec<i64> = match sqlx::query_scalar("SELECT id FROM iac_stacks").fetch_all(&pool).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!("failed to list stacks for stamp retention: {e:#}");
                    continue;
                }
            };
            for stack_id in stack_ids {
                if let Err(e) = db::models::DeploymentStamp::prune_old(&pool, stack_id, config.stamp_retention).await {
                    warn!("failed to prune stamps for stack {stack_id}: {e:#}");
                }
            }
        }
    })
}
