use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Startup-time configuration for the supervisor. `sentineld` builds this
/// from its own CLI/TOML configuration after validating the invariants
/// spec'd as fatal startup errors (no duplicate reserved port, non-empty
/// forwarded-port set, non-zero thresholds) — this struct itself trusts its
/// caller and does no further validation.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probe_port: u16,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub forwarded_ports: Vec<u16>,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    /// `None` disables the internal status/binary surface (C9) entirely.
    pub binary_addr: Option<SocketAddr>,
    /// `None` disables binary self-bootstrap; `/containarium` returns 404.
    pub binary_path: Option<PathBuf>,
    /// `None` disables the recovery-timeout warning.
    pub recovery_timeout: Option<Duration>,
    pub cert_sync_interval: Duration,
    pub key_sync_interval: Duration,
    /// Port the backend's `/certs` and `/authorized-keys` HTTP endpoints
    /// listen on — distinct from `probe_port`, which only needs a TCP
    /// handshake to succeed.
    pub backend_api_port: u16,
}

impl SupervisorConfig {
    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
}
