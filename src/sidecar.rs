//! Health sidecar
//!
//! Small HTTP listener next to the bus surface: `/livez` answers as soon
//! as the process runs, `/readyz` only once every bus subscription is
//! established. Debug builds additionally expose the log filter under
//! `/debug/log-level`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::SidecarConfig;
use crate::{Error, LogLevelHandle, Result};

/// Shared readiness flag.
#[derive(Default)]
pub struct SidecarState {
    ready: AtomicBool,
}

impl SidecarState {
    /// Create the shared state, not yet ready.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Flip readiness (set after subscriptions, cleared on shutdown).
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

struct AppState {
    sidecar: Arc<SidecarState>,
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    log_handle: Option<LogLevelHandle>,
}

/// Build the sidecar router.
#[must_use]
pub fn router(sidecar: Arc<SidecarState>, log_handle: Option<LogLevelHandle>) -> Router {
    let state = Arc::new(AppState {
        sidecar,
        log_handle,
    });

    let router = Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz));

    #[cfg(debug_assertions)]
    let router = router.route(
        "/debug/log-level",
        get(log_level_get).put(log_level_put),
    );

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve until the cancellation token fires.
pub async fn serve(
    config: &SidecarConfig,
    sidecar: Arc<SidecarState>,
    log_handle: Option<LogLevelHandle>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(|e| Error::Unexpected(format!("bind sidecar: {e}")))?;

    info!(host = %config.host, port = config.port, "health sidecar listening");

    axum::serve(listener, router(sidecar, log_handle))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Unexpected(format!("sidecar: {e}")))
}

async fn livez() -> &'static str {
    "OK"
}

async fn readyz(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.sidecar.is_ready() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[cfg(debug_assertions)]
async fn log_level_get(State(state): State<Arc<AppState>>) -> (StatusCode, String) {
    match &state.log_handle {
        Some(handle) => {
            let current = handle
                .with_current(ToString::to_string)
                .unwrap_or_else(|_| String::new());
            (StatusCode::OK, current)
        }
        None => (StatusCode::NOT_FOUND, "no reload handle".to_string()),
    }
}

#[cfg(debug_assertions)]
async fn log_level_put(
    State(state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, String) {
    use tracing_subscriber::EnvFilter;

    let Some(handle) = &state.log_handle else {
        return (StatusCode::NOT_FOUND, "no reload handle".to_string());
    };

    match EnvFilter::try_new(body.trim()) {
        Ok(filter) => match handle.reload(filter) {
            Ok(()) => (StatusCode::OK, "OK".to_string()),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt as _;

    async fn status_of(router: Router, uri: &str) -> StatusCode {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let state = SidecarState::new();
        assert_eq!(status_of(router(state, None), "/livez").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_the_flag() {
        let state = SidecarState::new();

        assert_eq!(
            status_of(router(state.clone(), None), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_ready(true);
        assert_eq!(
            status_of(router(state.clone(), None), "/readyz").await,
            StatusCode::OK
        );

        state.set_ready(false);
        assert_eq!(
            status_of(router(state, None), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
