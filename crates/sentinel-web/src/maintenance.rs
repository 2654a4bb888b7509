use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_certs::{CertStore, SniResolver};

use crate::html::{render_status_html, MAINTENANCE_HTML};
use crate::StatusSource;

#[derive(Clone)]
struct AppState {
    status_source: Arc<dyn StatusSource>,
}

struct Running {
    cancel: CancellationToken,
    http: JoinHandle<()>,
    https: JoinHandle<()>,
}

/// The pair of listeners described by C6: public HTTP serving the 503
/// maintenance page, public HTTPS serving the same content with certs drawn
/// from the certificate store via SNI. Opened and closed together, and both
/// operations are idempotent.
pub struct MaintenanceServers {
    http_addr: SocketAddr,
    https_addr: SocketAddr,
    cert_store: Arc<CertStore>,
    status_source: Arc<dyn StatusSource>,
    running: Mutex<Option<Running>>,
}

impl MaintenanceServers {
    pub fn new(
        http_addr: SocketAddr,
        https_addr: SocketAddr,
        cert_store: Arc<CertStore>,
        status_source: Arc<dyn StatusSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            http_addr,
            https_addr,
            cert_store,
            status_source,
            running: Mutex::new(None),
        })
    }

    pub fn is_open(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Opens both listeners if they aren't already open.
    pub fn open(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("maintenance servers already open");
            return;
        }
        let cancel = CancellationToken::new();
        let http = tokio::spawn(Self::run_http(self.clone(), cancel.clone()));
        let https = tokio::spawn(Self::run_https(self.clone(), cancel.clone()));
        *running = Some(Running {
            cancel,
            http,
            https,
        });
        info!(http = %self.http_addr, https = %self.https_addr, "maintenance servers opened");
    }

    /// Closes both listeners if open; safe to call when already closed.
    pub async fn close(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.http.await;
        let _ = running.https.await;
        info!("maintenance servers closed");
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/status", get(status_json))
            .route("/sentinel", get(status_html))
            .fallback(maintenance_fallback)
            .with_state(AppState {
                status_source: self.status_source.clone(),
            })
    }

    async fn run_http(self: Arc<Self>, cancel: CancellationToken) {
        let app = self.router();
        let listener = match tokio::net::TcpListener::bind(self.http_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, addr = %self.http_addr, "failed to bind maintenance HTTP listener");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            warn!(error = %e, "maintenance HTTP listener exited with an error");
        }
    }

    async fn run_https(self: Arc<Self>, cancel: CancellationToken) {
        sentinel_certs::ensure_crypto_provider_installed();
        let resolver = Arc::new(SniResolver(self.cert_store.clone()));
        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(server_config));
        let app = self.router();

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });

        if let Err(e) = axum_server::bind_rustls(self.https_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
        {
            warn!(error = %e, "maintenance HTTPS listener exited with an error");
        }
    }
}

async fn status_json(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status_source.snapshot().await)
}

async fn status_html(State(state): State<AppState>) -> impl IntoResponse {
    Html(render_status_html(&state.status_source.snapshot().await))
}

async fn maintenance_fallback() -> impl IntoResponse {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [
            (header::RETRY_AFTER, "30"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Html(MAINTENANCE_HTML),
    )
}
