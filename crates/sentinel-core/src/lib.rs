//! Mode manager (C8): the only long-lived supervisor in the process. It runs
//! the health-probe and event-ingestion loops, and owns every other
//! component's lifecycle — opening/closing the maintenance servers, enabling
//! and disabling the NAT actuator, forcing a cert/key sync on handover, and
//! invoking cloud-side recovery when the backend looks unreachable.
//!
//! The switch routines below are modeled on the reference failover engine's
//! step-by-step sequence (verify, update, route, reprovision, notify): each
//! step is attempted, its outcome logged, and a failure in one step does not
//! abort steps that still make sense to run.

#![forbid(unsafe_code)]

mod config;

pub use config::SupervisorConfig;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_certs::CertStore;
use sentinel_cloud::{BackendTarget, CloudProvider, InstanceStatus, VmEvent, VmEventKind};
use sentinel_health::HealthWindow;
use sentinel_nat::NatActuator;
use sentinel_proto::{Mode, StatusSnapshot, SyncCounters};
use sentinel_ssh::SshKeyStore;
use sentinel_web::{MaintenanceServers, StatusBinaryServer, StatusSource};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to resolve backend IP from the cloud provider: {0}")]
    ResolveBackend(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, Default)]
struct OutageState {
    start: Option<DateTime<Utc>>,
    last_preemption: Option<DateTime<Utc>>,
    preempt_count: u64,
}

/// Everything `build_snapshot` reads, behind one lock. Mode, the outage
/// record, and the mirrored cert/key sync counters are read and written
/// together so a status snapshot never combines fields observed at
/// different instants — a small amount of lock contention traded for
/// eliminating that skew.
struct SupervisorState {
    mode: Mode,
    outage: OutageState,
    cert_sync: SyncCounters,
    key_sync: SyncCounters,
}

impl SupervisorState {
    fn new(initial_mode: Mode) -> Self {
        Self {
            mode: initial_mode,
            outage: OutageState::default(),
            cert_sync: SyncCounters::default(),
            key_sync: SyncCounters::default(),
        }
    }
}

/// Adapts a `Weak<Supervisor>` into `StatusSource` so `MaintenanceServers`
/// and `StatusBinaryServer` can query live status without the supervisor
/// needing to finish constructing itself first (see `Supervisor::new`,
/// which wires this through `Arc::new_cyclic`).
struct WeakStatusSource(Weak<Supervisor>);

#[async_trait]
impl StatusSource for WeakStatusSource {
    async fn snapshot(&self) -> StatusSnapshot {
        match self.0.upgrade() {
            Some(supervisor) => supervisor.build_snapshot(),
            None => StatusSnapshot {
                mode: Mode::Maintenance,
                backend_ip: String::new(),
                preempt_count: 0,
                outage_start: None,
                outage_seconds: None,
                last_preemption: None,
                cert_sync: Default::default(),
                key_sync: Default::default(),
            },
        }
    }
}

/// The state machine described by C8. Owns C2 (via `sentinel_health::probe`),
/// C3 (`NatActuator`), C4 (`CertStore`), C5 (`SshKeyStore`), C6
/// (`MaintenanceServers`), C9 (`StatusBinaryServer`), and calls into C1/C7
/// (`CloudProvider`).
pub struct Supervisor {
    cloud: Arc<dyn CloudProvider>,
    nat: NatActuator,
    cert_store: Arc<CertStore>,
    key_store: Arc<SshKeyStore>,
    maintenance: Arc<MaintenanceServers>,
    status_source: Arc<dyn StatusSource>,
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    health: Mutex<HealthWindow>,
    recovery_timeout_warned: AtomicBool,
    target: OnceLock<BackendTarget>,
}

impl Supervisor {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        cert_store: Arc<CertStore>,
        key_store: Arc<SshKeyStore>,
        nat: NatActuator,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let health = HealthWindow::new(config.healthy_threshold, config.unhealthy_threshold);
        Arc::new_cyclic(|weak: &Weak<Supervisor>| {
            let status_source: Arc<dyn StatusSource> = Arc::new(WeakStatusSource(weak.clone()));
            let maintenance = MaintenanceServers::new(
                config.http_addr,
                config.https_addr,
                cert_store.clone(),
                status_source.clone(),
            );
            Supervisor {
                cloud,
                nat,
                cert_store,
                key_store,
                maintenance,
                status_source,
                config,
                state: Mutex::new(SupervisorState::new(Mode::Maintenance)),
                health: Mutex::new(health),
                recovery_timeout_warned: AtomicBool::new(false),
                target: OnceLock::new(),
            }
        })
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    fn target(&self) -> &BackendTarget {
        self.target
            .get()
            .expect("backend target resolved during startup before the main loop runs")
    }

    fn build_snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock();
        let now = Utc::now();
        StatusSnapshot {
            mode: state.mode,
            backend_ip: self
                .target
                .get()
                .map(|t| t.private_ip.clone())
                .unwrap_or_default(),
            preempt_count: state.outage.preempt_count,
            outage_start: state.outage.start,
            outage_seconds: state.outage.start.map(|start| (now - start).num_seconds().max(0)),
            last_preemption: state.outage.last_preemption,
            cert_sync: state.cert_sync.clone(),
            key_sync: state.key_sync.clone(),
        }
    }

    /// Runs the startup sequence, then the probe/event main loop, until
    /// `cancel` fires; runs the shutdown cleanup unconditionally before
    /// returning.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> CoreResult<()> {
        if let Some(binary_addr) = self.binary_addr() {
            let server = StatusBinaryServer::new(
                binary_addr,
                self.config.binary_path.clone(),
                self.status_source.clone(),
            );
            tokio::spawn(server.run(cancel.child_token()));
        }

        let private_ip = self
            .cloud
            .get_instance_ip()
            .await
            .map_err(|e| CoreError::ResolveBackend(e.to_string()))?;
        let target = BackendTarget::new(private_ip, self.config.forwarded_ports.clone());
        info!(backend_ip = %target.private_ip, ports = ?target.ports, "resolved backend target");
        let _ = self.target.set(target);

        {
            let cert_store = self.cert_store.clone();
            let backend_ip = self.target().private_ip.clone();
            let backend_port = self.config.backend_api_port;
            let interval = self.config.cert_sync_interval;
            let cert_cancel = cancel.child_token();
            let this = self.clone();
            tokio::spawn(async move {
                cert_store
                    .run_sync_loop(backend_ip, backend_port, interval, cert_cancel, move |counters| {
                        this.state.lock().cert_sync = counters;
                    })
                    .await;
            });
        }

        {
            let key_store = self.key_store.clone();
            let backend_ip = self.target().private_ip.clone();
            let backend_port = self.config.backend_api_port;
            let interval = self.config.key_sync_interval;
            let key_cancel = cancel.child_token();
            let this = self.clone();
            tokio::spawn(async move {
                key_store
                    .run_sync_loop(backend_ip, backend_port, interval, key_cancel, move |counters| {
                        this.state.lock().key_sync = counters;
                    })
                    .await;
            });
        }

        self.maintenance.open();
        info!("sentinel started in MAINTENANCE");

        let mut event_rx = None;
        if self.cloud.supports_events() {
            let (tx, rx) = mpsc::channel(32);
            let cloud = self.cloud.clone();
            let event_cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = cloud.watch_events(tx, event_cancel).await {
                    warn!(error = %e, "event watcher exited with an error");
                }
            });
            event_rx = Some(rx);
        }

        self.main_loop(&cancel, &mut event_rx).await;

        self.maintenance.close().await;
        if let Err(e) = self.nat.disable().await {
            warn!(error = %e, "NAT disable failed during shutdown; host NAT table may retain sentinel rules");
        }
        info!("sentinel shut down cleanly");
        Ok(())
    }

    fn binary_addr(&self) -> Option<SocketAddr> {
        self.config.binary_addr
    }

    async fn main_loop(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        event_rx: &mut Option<mpsc::Receiver<VmEvent>>,
    ) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        loop {
            let next_event = async {
                match event_rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancellation received; stopping main loop");
                    return;
                }
                _ = ticker.tick() => {
                    let target = self.target();
                    let success = sentinel_health::probe(
                        &target.private_ip,
                        self.config.probe_port,
                        self.config.probe_timeout,
                    )
                    .await;
                    self.on_probe_result(success).await;
                }
                event = next_event => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
            }
        }
    }

    async fn on_probe_result(self: &Arc<Self>, success: bool) {
        if success {
            let crossed = self.health.lock().record_success();
            if crossed && self.mode() == Mode::Maintenance {
                self.proxy_switch().await;
            }
            return;
        }

        let (crossed, unhealthy_streak) = {
            let mut window = self.health.lock();
            let crossed = window.record_failure();
            (crossed, window.unhealthy_streak)
        };

        if crossed && self.mode() == Mode::Proxy {
            self.maintenance_switch().await;
            return;
        }

        if self.mode() == Mode::Maintenance {
            self.check_recovery_timeout();
            if unhealthy_streak > 0 && unhealthy_streak % 4 == 0 {
                debug!(unhealthy_streak, "re-diagnosing after four consecutive unhealthy probes");
                self.diagnose_and_recover().await;
            }
        }
    }

    /// (a) stop maintenance servers, (b) force a cert sync, (c) force a key
    /// sync/push/apply/conditional-restart cycle, (d) enable NAT, (e) set
    /// mode=PROXY, (f) clear the outage record, (g) log recovery duration.
    ///
    /// If NAT enable fails, the manager stays in MAINTENANCE and reopens the
    /// maintenance servers it closed in step (a) — leaving neither surface
    /// listening would violate the mode/listener invariant.
    async fn proxy_switch(self: &Arc<Self>) {
        info!("healthy threshold crossed; attempting proxy switch");
        self.maintenance.close().await;

        let target = self.target();
        if let Err(e) = self.cert_store.sync(&target.private_ip, self.config.backend_api_port).await {
            warn!(error = %e, "forced cert sync failed during proxy switch; continuing with stale certs");
        }
        self.state.lock().cert_sync = self.cert_store.counters();

        if let Err(e) = self
            .key_store
            .sync_cycle(&target.private_ip, self.config.backend_api_port)
            .await
        {
            warn!(error = %e, "forced ssh key sync failed during proxy switch; continuing with stale keys");
        }
        self.state.lock().key_sync = self.key_store.counters();

        match self.nat.enable(&target.private_ip, &target.ports).await {
            Ok(()) => {
                let outage_start = {
                    let mut state = self.state.lock();
                    state.mode = Mode::Proxy;
                    state.outage.start.take()
                };
                match outage_start {
                    Some(start) => {
                        let recovered_ms = (Utc::now() - start).num_milliseconds().max(0);
                        info!(recovered_ms, "proxy switch complete; mode=PROXY");
                    }
                    None => info!("proxy switch complete; mode=PROXY"),
                }
            }
            Err(e) => {
                warn!(error = %e, "NAT enable failed; remaining in MAINTENANCE and reopening maintenance servers");
                self.maintenance.open();
            }
        }
    }

    /// (a) disable NAT, (b) open maintenance servers, (c) set
    /// mode=MAINTENANCE, (d) stamp the outage start, (e) invoke
    /// `diagnose_and_recover`.
    ///
    /// If NAT disable fails, the manager stays in PROXY so the mode/NAT
    /// invariant holds; the next unhealthy-streak crossing retries the
    /// switch. `diagnose_and_recover` still runs either way — the probe
    /// already confirmed the backend is unreachable.
    async fn maintenance_switch(self: &Arc<Self>) {
        info!("unhealthy threshold crossed; attempting maintenance switch");
        match self.nat.disable().await {
            Ok(()) => self.enter_maintenance(Utc::now()),
            Err(e) => warn!(
                error = %e,
                "NAT disable failed during maintenance switch; remaining in PROXY, will retry on next unhealthy crossing"
            ),
        }
        self.diagnose_and_recover().await;
    }

    fn enter_maintenance(&self, outage_start: DateTime<Utc>) {
        self.maintenance.open();
        {
            let mut state = self.state.lock();
            state.mode = Mode::Maintenance;
            state.outage.start = Some(outage_start);
        }
        self.recovery_timeout_warned.store(false, Ordering::Relaxed);
        info!("entered MAINTENANCE");
    }

    fn check_recovery_timeout(&self) {
        let Some(recovery_timeout) = self.config.recovery_timeout else {
            return;
        };
        let Some(start) = self.state.lock().outage.start else {
            return;
        };
        let elapsed = Utc::now() - start;
        if elapsed.num_seconds() < recovery_timeout.as_secs() as i64 {
            return;
        }
        if !self.recovery_timeout_warned.swap(true, Ordering::Relaxed) {
            warn!(
                elapsed_secs = elapsed.num_seconds(),
                "recovery timeout exceeded; backend still unhealthy"
            );
        }
    }

    /// A `preempted`/`stopped`/`terminated` event is confirmed cloud-side
    /// truth, not a probe guess, so unlike `maintenance_switch` it forces
    /// MAINTENANCE regardless of whether NAT disable succeeds: continuing to
    /// forward traffic to a backend the cloud API reports gone is worse than
    /// a transient NAT-table inconsistency the next `enable` will flush.
    async fn handle_event(self: &Arc<Self>, event: VmEvent) {
        match event.kind {
            VmEventKind::Started => {
                info!("received started event; health probe will detect readiness");
            }
            VmEventKind::Provisioning => {
                debug!("received provisioning event");
            }
            VmEventKind::Preempted | VmEventKind::Stopped | VmEventKind::Terminated => {
                if self.mode() == Mode::Maintenance {
                    debug!(kind = ?event.kind, "event received while already in MAINTENANCE; not re-dispatched");
                    return;
                }

                self.health.lock().reset();
                if matches!(event.kind, VmEventKind::Preempted) {
                    let mut state = self.state.lock();
                    state.outage.preempt_count += 1;
                    state.outage.last_preemption = Some(event.timestamp);
                }

                if let Err(e) = self.nat.disable().await {
                    warn!(error = %e, kind = ?event.kind, "NAT disable failed while reacting to lifecycle event");
                }
                self.enter_maintenance(event.timestamp);
                self.diagnose_and_recover().await;
            }
        }
    }

    /// Reads instance status and reacts: stopped/terminated -> best-effort
    /// start, provisioning -> wait, running -> note a likely app-level
    /// issue. Never blocks and never propagates an error.
    async fn diagnose_and_recover(&self) {
        match self.cloud.get_instance_status().await {
            Ok(InstanceStatus::Stopped | InstanceStatus::Terminated) => {
                info!("instance reports stopped/terminated; requesting start");
                if let Err(e) = self.cloud.start_instance().await {
                    warn!(error = %e, "start_instance failed (best effort)");
                }
            }
            Ok(InstanceStatus::Provisioning) => {
                debug!("instance still provisioning; waiting");
            }
            Ok(InstanceStatus::Running) => {
                warn!("instance reports running but health probe fails; likely an application-level issue");
            }
            Ok(InstanceStatus::Unknown) => {
                warn!("cloud provider reports unknown instance status");
            }
            Err(e) => {
                warn!(error = %e, "failed to query instance status during recovery diagnosis");
            }
        }
    }
}

#[async_trait]
impl StatusSource for Supervisor {
    async fn snapshot(&self) -> StatusSnapshot {
        self.build_snapshot()
    }
}
