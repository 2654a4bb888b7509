use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::StatusSource;

#[derive(Clone)]
struct AppState {
    binary_path: Option<PathBuf>,
    status_source: Arc<dyn StatusSource>,
}

/// The internal, unfirewalled surface (C9): `/containarium` streams the
/// on-disk backend binary for a freshly recreated backend VM to
/// self-bootstrap, `/health` is a liveness probe, `/status` duplicates the
/// JSON the maintenance listeners serve at the same path.
pub struct StatusBinaryServer {
    addr: SocketAddr,
    binary_path: Option<PathBuf>,
    status_source: Arc<dyn StatusSource>,
}

impl StatusBinaryServer {
    /// `binary_path = None` means binary serving is disabled (`/containarium`
    /// returns 404); the caller decides whether to start this server at all
    /// based on the configured port being non-zero.
    pub fn new(
        addr: SocketAddr,
        binary_path: Option<PathBuf>,
        status_source: Arc<dyn StatusSource>,
    ) -> Self {
        Self {
            addr,
            binary_path,
            status_source,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let state = AppState {
            binary_path: self.binary_path,
            status_source: self.status_source,
        };
        let app = Router::new()
            .route("/containarium", get(serve_binary))
            .route("/health", get(health))
            .route("/status", get(status_json))
            .with_state(state);

        let listener = match tokio::net::TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, addr = %self.addr, "failed to bind status/binary listener");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            warn!(error = %e, "status/binary listener exited with an error");
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn status_json(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status_source.snapshot().await)
}

async fn serve_binary(State(state): State<AppState>) -> Response {
    let Some(path) = state.binary_path else {
        return (StatusCode::NOT_FOUND, "binary serving disabled").into_response();
    };
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to open backend binary");
            return (StatusCode::INTERNAL_SERVER_ERROR, "binary unavailable").into_response();
        }
    };
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sentinel_proto::{Mode, StatusSnapshot, SyncCounters};

    struct FixedStatus;

    #[async_trait]
    impl StatusSource for FixedStatus {
        async fn snapshot(&self) -> StatusSnapshot {
            StatusSnapshot {
                mode: Mode::Maintenance,
                backend_ip: "10.0.0.5".to_string(),
                preempt_count: 0,
                outage_start: None,
                outage_seconds: None,
                last_preemption: None,
                cert_sync: SyncCounters::default(),
                key_sync: SyncCounters::default(),
            }
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        assert_eq!(health().await, "ok");
    }

    #[tokio::test]
    async fn serve_binary_returns_404_when_disabled() {
        let state = AppState {
            binary_path: None,
            status_source: Arc::new(FixedStatus),
        };
        let response = serve_binary(State(state)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
