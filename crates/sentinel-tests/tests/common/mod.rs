//! Shared scaffolding for the scenario tests: a cloud-provider test double
//! that can be driven by hand (lifecycle events, instance status, start
//! counts) and a tiny axum "backend" standing in for the real VPS's
//! `/certs` and `/authorized-keys` HTTP surface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sentinel_cloud::{CloudError, CloudProvider, CloudResult, InstanceStatus, VmEvent};
use sentinel_proto::{
    AuthorizedKeysResponse, CertEntryWire, CertsResponse, PushSentinelKeyRequest,
    PushSentinelKeyResponse, UserKeyWire,
};

/// A `CloudProvider` whose status/IP/events are set directly by the test
/// instead of coming from a real API, mirroring how the Hetzner adapter
/// classifies actions into the same `VmEvent` stream.
pub struct TestCloudProvider {
    ip: String,
    status: Mutex<InstanceStatus>,
    events_rx: Mutex<Option<mpsc::Receiver<VmEvent>>>,
    start_calls: AtomicUsize,
}

impl TestCloudProvider {
    /// Returns the provider plus the sending half of its event channel, so
    /// the test can push lifecycle events whenever it likes.
    pub fn new(ip: impl Into<String>) -> (Arc<Self>, mpsc::Sender<VmEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let provider = Arc::new(Self {
            ip: ip.into(),
            status: Mutex::new(InstanceStatus::Running),
            events_rx: Mutex::new(Some(rx)),
            start_calls: AtomicUsize::new(0),
        });
        (provider, tx)
    }

    pub fn set_status(&self, status: InstanceStatus) {
        *self.status.lock() = status;
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CloudProvider for TestCloudProvider {
    fn name(&self) -> &str {
        "test-double"
    }

    async fn get_instance_status(&self) -> CloudResult<InstanceStatus> {
        Ok(*self.status.lock())
    }

    async fn get_instance_ip(&self) -> CloudResult<String> {
        Ok(self.ip.clone())
    }

    async fn start_instance(&self) -> CloudResult<()> {
        self.start_calls.fetch_add(1, Ordering::Relaxed);
        *self.status.lock() = InstanceStatus::Running;
        Ok(())
    }

    fn supports_events(&self) -> bool {
        true
    }

    async fn watch_events(
        &self,
        sink: mpsc::Sender<VmEvent>,
        cancel: CancellationToken,
    ) -> CloudResult<()> {
        let mut rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| CloudError::Api("watch_events called more than once".to_string()))?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            if sink.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
struct BackendState {
    certs: Arc<Mutex<Vec<CertEntryWire>>>,
    keys: Arc<Mutex<Vec<UserKeyWire>>>,
}

async fn get_certs(State(state): State<BackendState>) -> Json<CertsResponse> {
    Json(CertsResponse {
        certs: state.certs.lock().clone(),
    })
}

async fn get_authorized_keys(State(state): State<BackendState>) -> Json<AuthorizedKeysResponse> {
    Json(AuthorizedKeysResponse {
        keys: state.keys.lock().clone(),
    })
}

async fn push_sentinel_key(
    Json(_req): Json<PushSentinelKeyRequest>,
) -> Json<PushSentinelKeyResponse> {
    Json(PushSentinelKeyResponse { updated: 1 })
}

/// Spawns a bare-bones stand-in for the backend VM's `/certs` and
/// `/authorized-keys` HTTP API on `addr`, returning a handle that keeps it
/// alive until dropped/cancelled.
pub struct MockBackend {
    pub certs: Arc<Mutex<Vec<CertEntryWire>>>,
    pub keys: Arc<Mutex<Vec<UserKeyWire>>>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    pub async fn spawn(addr: SocketAddr) -> Self {
        let certs = Arc::new(Mutex::new(Vec::new()));
        let keys = Arc::new(Mutex::new(Vec::new()));
        let state = BackendState {
            certs: certs.clone(),
            keys: keys.clone(),
        };
        let router = Router::new()
            .route("/certs", get(get_certs))
            .route("/authorized-keys", get(get_authorized_keys))
            .route("/authorized-keys/sentinel", post(push_sentinel_key))
            .with_state(state);
        let listener = TcpListener::bind(addr).await.expect("bind mock backend");
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .expect("mock backend server");
        });
        Self {
            certs,
            keys,
            cancel,
            task,
        }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawns a TCP listener that immediately drops every connection it
/// accepts — enough for `sentinel_health::probe`'s handshake-only liveness
/// check to see the backend as up. Closing the returned handle (dropping the
/// cancellation token) makes subsequent probes fail, simulating the backend
/// going unreachable.
pub struct ProbeTarget {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ProbeTarget {
    pub async fn spawn(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.expect("bind probe target");
        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        if let Ok((stream, _)) = accepted {
                            drop(stream);
                        }
                    }
                }
            }
        });
        Self { cancel, task }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Polls `condition` until it returns `true` or `timeout` elapses, returning
/// whether it succeeded. Used instead of a fixed sleep so scenario tests
/// don't race the supervisor's own probe interval.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
