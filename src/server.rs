use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    output,
    scanner::{self, Checker, ScanConfig, SharedProgress},
    targets,
    types::{ScanResults, DEFAULT_MQTT_PORT},
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>,
    base: ScanConfig,
}

#[derive(Debug)]
struct ServerState {
    status: Status,
    results: Option<(String, ScanResults)>,
    progress: Option<SharedProgress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Status {
    pub total: u64,
    pub scanned: u64,
    pub vulnerable: u64,
    pub state: String, // "idle" | "running" | "done"
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub targets: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub tls: Option<bool>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl AppState {
    /// Fresh idle state. `base` supplies defaults for fields a request omits.
    pub fn new(base: ScanConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState {
                status: Status {
                    state: "idle".into(),
                    ..Status::default()
                },
                results: None,
                progress: None,
            })),
            base,
        }
    }
}

/// API routes under `/api`, with request tracing and `cache-control: no-store`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/results", get(get_results))
        .with_state(state);

    Router::new().nest("/api", api).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(SetResponseHeaderLayer::overriding(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store"),
            )),
    )
}

/// Serve the API until `shutdown` fires. Scans already running are not cancelled.
pub async fn spawn_server(bind: &str, base: ScanConfig, shutdown: CancellationToken) -> Result<()> {
    let app = router(AppState::new(base));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving scan API");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let (mut out, progress) = {
        let s = app.inner.read().await;
        (s.status.clone(), s.progress.clone())
    };
    if let Some(p) = progress {
        out.scanned = p.scanned_done.load(Ordering::Relaxed);
        out.vulnerable = p.vulnerable_count().await;
    }
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let Some((scan_date, res)) = s.results.as_ref() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match output::render_json(&res.entries, scan_date) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> impl IntoResponse {
    let port = req.port.unwrap_or(DEFAULT_MQTT_PORT);
    let mut all_targets = Vec::new();
    for t in &req.targets {
        match targets::parse_target_entry(t.trim(), port) {
            Ok(v) => all_targets.extend(v),
            Err(e) => {
                let msg = format!("invalid target {t}: {e:#}");
                return (StatusCode::BAD_REQUEST, msg).into_response();
            }
        }
    }
    if all_targets.is_empty() {
        return (StatusCode::BAD_REQUEST, "no valid targets found").into_response();
    }

    let mut config = app.base.clone();
    if let Some(secs) = req.timeout_secs {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(tls) = req.tls {
        config.tls = tls;
    }
    let checker = match Checker::new(config) {
        Ok(c) => c,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("{e:#}")).into_response(),
    };

    let scan_date = match output::scan_date_now() {
        Ok(d) => d,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    };
    let total = all_targets.len() as u64;
    let progress = SharedProgress::new();

    {
        let mut s = app.inner.write().await;
        if s.status.state == "running" {
            return (StatusCode::CONFLICT, "a scan is already running").into_response();
        }
        s.status = Status {
            total,
            scanned: 0,
            vulnerable: 0,
            state: "running".into(),
        };
        s.results = None;
        s.progress = Some(progress.clone());
    }

    info!(total, "scan requested over HTTP");
    let app2 = app.clone();
    tokio::spawn(async move {
        let results = scanner::scan_targets_with_shared(&all_targets, &checker, progress).await;

        let mut s = app2.inner.write().await;
        if results.scanned_done != results.scanned_total {
            error!(
                done = results.scanned_done,
                total = results.scanned_total,
                "scan finished with missing results"
            );
        }
        s.status.scanned = results.scanned_done;
        s.status.vulnerable = results.vulnerable_count;
        s.status.state = "done".into();
        s.results = Some((scan_date, results));
        s.progress = None;
    });

    (
        StatusCode::ACCEPTED,
        Json(Status {
            total,
            scanned: 0,
            vulnerable: 0,
            state: "running".into(),
        }),
    )
        .into_response()
}
