//! JSON surface for BidBeacon: health with the latest run row and the
//! secret-protected manual digest trigger.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use beacon_core::{CronRun, DIGEST_JOB};
use beacon_digest::{maybe_build_scheduler, DigestConfig, DigestJob, RunOptions};
use beacon_storage::{DigestStore, PgStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "beacon-web";

pub const ADMIN_SECRET_HEADER: &str = "x-admin-run-secret";

/// Manual runs always look back one day.
const MANUAL_RUN_DAYS_BACK: u32 = 1;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DigestStore>,
    pub job: Option<Arc<DigestJob>>,
    pub admin_secret: Option<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn DigestStore>) -> Self {
        Self {
            store,
            job: None,
            admin_secret: None,
        }
    }

    pub fn with_job(mut self, job: Arc<DigestJob>) -> Self {
        self.job = Some(job);
        self
    }

    pub fn with_admin_secret(mut self, secret: Option<String>) -> Self {
        self.admin_secret = secret.filter(|s| !s.is_empty());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub ok: bool,
    pub ts: DateTime<Utc>,
    pub last_cron: Option<CronRun>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/admin/run-cron", post(run_cron_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = DigestConfig::from_env();
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to the database")?,
    );
    let mut state = AppState::new(store.clone()).with_admin_secret(config.admin_run_secret.clone());
    let mut scheduler = None;
    match DigestJob::from_config(&config, store) {
        Ok(job) => {
            let job = Arc::new(job);
            scheduler = maybe_build_scheduler(job.clone(), &config).await?;
            state = state.with_job(job);
        }
        Err(err) => warn!(error = %err, "digest job unavailable; manual trigger disabled"),
    }
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.cron, "digest scheduler started");
    }
    serve(state, config.web_port).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_run(DIGEST_JOB).await {
        Ok(last_cron) => Json(HealthBody {
            ok: true,
            ts: Utc::now(),
            last_cron,
        })
        .into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

async fn run_cron_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(expected) = state.admin_secret.as_deref() else {
        return error_json(StatusCode::FORBIDDEN, "manual runs are disabled");
    };
    let provided = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if !secret_matches(expected, provided) {
        warn!("manual run rejected: bad secret");
        return error_json(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let Some(job) = state.job.clone() else {
        return server_error("digest job is not configured".to_string());
    };

    info!("manual digest run requested");
    match job.run(RunOptions::days_back(MANUAL_RUN_DAYS_BACK)).await {
        Ok(summary) => Json(json!({ "ok": true, "summary": summary })).into_response(),
        Err(err) => {
            warn!(code = err.code(), error = %err, "manual digest run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "code": err.code(), "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// Compares in time independent of where the first differing byte is.
fn secret_matches(expected: &str, provided: Option<&str>) -> bool {
    provided.is_some_and(|p| bool::from(p.as_bytes().ct_eq(expected.as_bytes())))
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "ok": false, "error": message }))).into_response()
}

fn server_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": message })),
    )
        .into_response()
}
