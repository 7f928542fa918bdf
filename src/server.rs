//! HTTP surface: health check, drift queries, deploy trigger with a
//! streamed event body, and per-host scan log tailing.

use crate::config::Config;
use crate::connector::HostConnector;
use crate::db::models::{Container, IacService, IacStack, ScanLog, SettingsCache, StackDriftCache};
use crate::deploy::{self, DeployEvent, DeployOptions};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub cache: SettingsCache,
    pub connector: Arc<HostConnector>,
}

pub async fn serve(ctx: ServerContext) -> Result<()> {
    let bind_addr = ctx.config.bind_address();

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/stacks/:id/drift", get(get_drift))
        .route("/api/stacks/:id/deploy", post(post_deploy))
        .route("/api/hosts/:id/scan_logs", get(get_scan_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(ctx));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received termination signal, shutting down"),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

fn internal_error(e: anyhow::Error) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
}

async fn get_drift(State(ctx): State<Arc<ServerContext>>, Path(id): Path<i64>) -> Response {
    match compute_drift(&ctx, id).await {
        Ok(Some(drift)) => Json(drift).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "stack not found").into_response(),
        Err(e) => internal_error(e),
    }
}

async fn compute_drift(ctx: &ServerContext, stack_id: i64) -> Result<Option<serde_json::Value>> {
    let Some(stack) = IacStack::find_by_id(&ctx.pool, stack_id).await? else {
        return Ok(None);
    };

    let services = IacService::find_by_stack(&ctx.pool, stack_id).await?;
    let cache = StackDriftCache::find(&ctx.pool, stack_id).await?;
    let bundle_hash = cache.as_ref().map(|c| c.bundle_hash.clone()).unwrap_or_default();

    let host = crate::db::models::Host::find_by_name(&ctx.pool, &stack.scope_name).await?;
    let mut drift = Vec::new();

    if let Some(host) = &host {
        let containers = Container::find_by_host(&ctx.pool, host.id).await?;
        drift.extend(crate::db::models::compare_drift(cache.as_ref(), &bundle_hash, &services, &containers));

        let relevant_stacks = IacStack::find_relevant_to_host(&ctx.pool, &host.name, &host.groups).await?;
        let known_sanitized_projects: Vec<String> =
            relevant_stacks.iter().map(|s| deploy::sanitize_project(&s.stack_name)).collect();
        drift.extend(crate::db::models::detect_orphan_runtime_projects(&containers, &known_sanitized_projects));
    } else {
        drift.extend(crate::db::models::compare_drift(cache.as_ref(), &bundle_hash, &services, &[]));
    }

    Ok(Some(serde_json::json!({
        "stack_id": stack_id,
        "stack_name": stack.stack_name,
        "drift": drift,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct DeployRequest {
    #[serde(default)]
    force: bool,
}

async fn post_deploy(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<i64>,
    body: Option<Json<DeployRequest>>,
) -> Response {
    let stack = match IacStack::find_by_id(&ctx.pool, id).await {
        Ok(Some(s)) => s,
        Ok(None) => return (StatusCode::NOT_FOUND, "stack not found").into_response(),
        Err(e) => return internal_error(e),
    };

    let options = DeployOptions { manual: true, force: body.map(|b| b.0.force).unwrap_or(false) };
    let (tx, rx) = tokio::sync::mpsc::channel::<DeployEvent>(64);

    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = deploy::deploy_stack(&ctx.pool, &ctx.cache, &ctx.config, &ctx.connector, &stack, options, tx).await {
            tracing::warn!("deploy of stack {} failed: {e:#}", stack.stack_name);
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<Event, std::convert::Infallible>(Event::default().data(data))
    });

    sse_response(stream)
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Event, std::convert::Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct ScanLogQuery {
    limit: Option<i64>,
}

async fn get_scan_logs(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<i64>,
    axum::extract::Query(query): axum::extract::Query<ScanLogQuery>,
) -> Response {
    match ScanLog::tail_for_host(&ctx.pool, id, query.limit.unwrap_or(100)).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => internal_error(e),
    }
}
