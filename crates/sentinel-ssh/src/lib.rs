//! SSH key store (C5): keeps the sibling SSH proxy's per-user
//! `authorized_keys` files and sshpiper routing config in sync with what the
//! backend reports, and pushes this host's upstream key to the backend so
//! it can recognize proxied connections.
//!
//! `Sync`/`PushSentinelKey`/`Apply`/`RestartSSHPiper` are exposed both as
//! individually-callable steps (the mode manager forces one cycle of all
//! four on every recovery) and composed into `run_sync_loop` for the steady
//! state, mirroring the step-by-step-then-composed shape of the reference
//! heal/failover sequences.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_proto::{
    AuthorizedKeysResponse, PushSentinelKeyRequest, PushSentinelKeyResponse, SyncCounters, UserKeyWire,
};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2 * 60);
const USER_DIR_MODE: u32 = 0o755;
const KEY_FILE_MODE: u32 = 0o600;
const CONFIG_FILE_MODE: u32 = 0o600;
const BACKEND_SSH_PORT: u16 = 22;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("network error talking to backend: {0}")]
    Network(#[from] reqwest::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to render sshpiper config: {0}")]
    Render(#[from] serde_yaml::Error),
    #[error("ssh proxy service restart failed: {0}")]
    Service(String),
}

pub type SshResult<T> = Result<T, SshError>;

#[derive(Debug, Serialize)]
struct PipeConfig {
    version: String,
    pipes: Vec<Pipe>,
}

#[derive(Debug, Serialize)]
struct Pipe {
    from: Vec<PipeFrom>,
    to: PipeTo,
}

#[derive(Debug, Serialize)]
struct PipeFrom {
    username: String,
    authorized_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PipeTo {
    host: String,
    username: String,
    ignore_hostkey: bool,
    private_key: String,
}

/// Writes `content` to `path` only if it differs from what's already there,
/// via a write-to-temp-then-rename so a reader never observes a partial
/// file. Returns whether the file was (re)written.
async fn write_if_changed(path: &Path, content: &[u8], mode: u32) -> SshResult<bool> {
    if let Ok(existing) = fs::read(path).await {
        if existing == content {
            return Ok(false);
        }
    }
    let tmp_path = path.with_file_name(format!(
        "{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("sentinel")
    ));
    fs::write(&tmp_path, content).await?;
    set_permissions(&tmp_path, mode).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(true)
}

#[cfg(unix)]
async fn set_permissions(path: &Path, mode: u32) -> SshResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_permissions(_path: &Path, _mode: u32) -> SshResult<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
async fn restart_service(name: &str) -> SshResult<()> {
    let output = tokio::process::Command::new("systemctl")
        .args(["restart", name])
        .output()
        .await?;
    if !output.status.success() {
        return Err(SshError::Service(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn restart_service(_name: &str) -> SshResult<()> {
    Ok(())
}

/// Owns the sync state and the filesystem layout rooted at `<etc>/sshpiper`.
pub struct SshKeyStore {
    etc_dir: PathBuf,
    service_name: String,
    client: reqwest::Client,
    users: RwLock<Vec<UserKeyWire>>,
    counters: RwLock<SyncCounters>,
}

impl SshKeyStore {
    pub fn new(etc_dir: impl Into<PathBuf>) -> SshResult<Self> {
        Ok(Self {
            etc_dir: etc_dir.into(),
            service_name: "sshpiper".to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            users: RwLock::new(Vec::new()),
            counters: RwLock::new(SyncCounters::default()),
        })
    }

    /// A snapshot of the introspection counters for the status endpoints.
    pub fn counters(&self) -> SyncCounters {
        self.counters.read().clone()
    }

    fn sshpiper_dir(&self) -> PathBuf {
        self.etc_dir.join("sshpiper")
    }

    fn users_dir(&self) -> PathBuf {
        self.sshpiper_dir().join("users")
    }

    fn config_path(&self) -> PathBuf {
        self.sshpiper_dir().join("config.yaml")
    }

    fn upstream_key_path(&self) -> PathBuf {
        self.sshpiper_dir().join("upstream_key")
    }

    fn upstream_pub_key_path(&self) -> PathBuf {
        self.sshpiper_dir().join("upstream_key.pub")
    }

    /// `GET .../authorized-keys`, replacing the in-memory user list in one
    /// write-lock acquisition.
    pub async fn sync(&self, backend_ip: &str, backend_port: u16) -> SshResult<usize> {
        match self.try_sync(backend_ip, backend_port).await {
            Ok(count) => {
                let mut counters = self.counters.write();
                counters.last_sync = Some(chrono::Utc::now());
                counters.last_error = None;
                counters.synced_count = count;
                Ok(count)
            }
            Err(e) => {
                self.counters.write().last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn try_sync(&self, backend_ip: &str, backend_port: u16) -> SshResult<usize> {
        let url = format!("http://{backend_ip}:{backend_port}/authorized-keys");
        let response: AuthorizedKeysResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let count = response.keys.len();
        *self.users.write() = response.keys;
        info!(count, "ssh key store synced from backend");
        Ok(count)
    }

    /// Reads this host's upstream public key and POSTs it to the backend so
    /// proxied connections are recognized as coming from this sentinel.
    pub async fn push_sentinel_key(&self, backend_ip: &str, backend_port: u16) -> SshResult<()> {
        let public_key = fs::read_to_string(self.upstream_pub_key_path()).await?;
        let url = format!("http://{backend_ip}:{backend_port}/authorized-keys/sentinel");
        let response: PushSentinelKeyResponse = self
            .client
            .post(&url)
            .json(&PushSentinelKeyRequest {
                public_key: public_key.trim().to_string(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(updated = response.updated, "pushed sentinel upstream key");
        Ok(())
    }

    /// Writes each user's `authorized_keys` file and the sshpiper routing
    /// config, skipping any file whose content hasn't changed. A user whose
    /// own write fails is logged and skipped rather than aborting the whole
    /// call — the config document is still rendered and written from
    /// whatever users succeeded, so already-synced users stay reachable.
    /// Returns whether the config document itself changed — the signal the
    /// caller uses to decide whether a restart is warranted.
    pub async fn apply(&self, backend_ip: &str) -> SshResult<bool> {
        let users = self.users.read().clone();
        let users_dir = self.users_dir();
        fs::create_dir_all(&users_dir).await?;

        let mut pipes = Vec::with_capacity(users.len());
        for user in &users {
            match self.write_user(&users_dir, user, backend_ip).await {
                Ok(pipe) => pipes.push(pipe),
                Err(e) => {
                    warn!(username = %user.username, error = %e, "skipping user after write failure");
                    continue;
                }
            }
        }

        let config = PipeConfig {
            version: "1.0".to_string(),
            pipes,
        };
        let rendered = serde_yaml::to_string(&config)?;
        let config_changed =
            write_if_changed(&self.config_path(), rendered.as_bytes(), CONFIG_FILE_MODE).await?;
        Ok(config_changed)
    }

    async fn write_user(&self, users_dir: &Path, user: &UserKeyWire, backend_ip: &str) -> SshResult<Pipe> {
        let user_dir = users_dir.join(&user.username);
        fs::create_dir_all(&user_dir).await?;
        set_permissions(&user_dir, USER_DIR_MODE).await?;

        let key_path = user_dir.join("authorized_keys");
        write_if_changed(&key_path, user.authorized_keys.as_bytes(), KEY_FILE_MODE).await?;

        Ok(Pipe {
            from: vec![PipeFrom {
                username: user.username.clone(),
                authorized_keys: vec![key_path.to_string_lossy().into_owned()],
            }],
            to: PipeTo {
                host: format!("{backend_ip}:{BACKEND_SSH_PORT}"),
                username: user.username.clone(),
                ignore_hostkey: true,
                private_key: self.upstream_key_path().to_string_lossy().into_owned(),
            },
        })
    }

    /// Restarts the sibling SSH proxy service on Linux; a no-op elsewhere.
    pub async fn restart_sshpiper(&self) -> SshResult<()> {
        restart_service(&self.service_name).await
    }

    /// `Sync`, `PushSentinelKey`, `Apply`, and a conditional restart, run
    /// once per tick with an immediate first run. Errors are logged and do
    /// not stop the loop. `on_sync` is invoked with the fresh counters after
    /// every attempt (success or failure) so a caller can mirror them into
    /// its own jointly-locked state without re-acquiring this store's lock
    /// later.
    pub async fn run_sync_loop(
        self: Arc<Self>,
        backend_ip: String,
        backend_port: u16,
        interval: Duration,
        cancel: CancellationToken,
        on_sync: impl Fn(SyncCounters) + Send + Sync + 'static,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ssh key sync loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_cycle(&backend_ip, backend_port).await {
                        warn!(error = %e, "ssh key sync cycle failed");
                    }
                    on_sync(self.counters());
                }
            }
        }
    }

    /// Runs the four composed steps once; `RestartSSHPiper` only fires when
    /// `Apply` actually rewrote the on-disk config, so a steady-state tick
    /// that changes nothing never drops a live SSH session.
    pub async fn sync_cycle(&self, backend_ip: &str, backend_port: u16) -> SshResult<()> {
        self.sync(backend_ip, backend_port).await?;
        self.push_sentinel_key(backend_ip, backend_port).await?;
        let config_changed = self.apply(backend_ip).await?;
        if config_changed {
            self.restart_sshpiper().await?;
        }
        Ok(())
    }
}
