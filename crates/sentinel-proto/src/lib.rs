//! Wire types and data model shared across the sentinel crates.
//!
//! Defines the message shapes exchanged with the backend (certs, authorized
//! keys), the cloud provider's lifecycle events, and the status snapshot
//! served by the maintenance and binary HTTP surfaces.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Mode ─────────────────────────────────────────────────────────────────────

/// The sentinel's two operating modes. See `sentinel-core::Supervisor` for
/// the state machine that drives transitions between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Proxy,
    Maintenance,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proxy => write!(f, "PROXY"),
            Self::Maintenance => write!(f, "MAINTENANCE"),
        }
    }
}

// ─── Backend target ───────────────────────────────────────────────────────────

/// Resolved once at startup from the cloud provider; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTarget {
    pub private_ip: String,
    pub ports: Vec<u16>,
}

impl BackendTarget {
    /// The SSH-proxy port is never forwarded through the NAT actuator; it is
    /// always filtered out of the configured port set.
    pub const SSH_PROXY_PORT: u16 = 22;

    pub fn new(private_ip: String, mut ports: Vec<u16>) -> Self {
        ports.retain(|p| *p != Self::SSH_PROXY_PORT);
        ports.sort_unstable();
        ports.dedup();
        Self { private_ip, ports }
    }
}

// ─── Instance status / VM lifecycle events ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Terminated,
    Provisioning,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmEventKind {
    Preempted,
    Stopped,
    Started,
    Terminated,
    Provisioning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmEvent {
    #[serde(rename = "type")]
    pub kind: VmEventKind,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

// ─── Certificate sync wire shapes (GET /certs) ───────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertsResponse {
    pub certs: Vec<CertEntryWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertEntryWire {
    pub domain: String,
    pub cert_pem: String,
    pub key_pem: String,
}

// ─── SSH key sync wire shapes (GET /authorized-keys) ─────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedKeysResponse {
    pub keys: Vec<UserKeyWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKeyWire {
    pub username: String,
    pub authorized_keys: String,
}

// ─── Sentinel key push (POST /authorized-keys/sentinel) ─────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSentinelKeyRequest {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSentinelKeyResponse {
    pub updated: i64,
}

// ─── Status snapshot (GET /status, and the HTML status page) ────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub mode: Mode,
    pub backend_ip: String,
    pub preempt_count: u64,
    pub outage_start: Option<DateTime<Utc>>,
    pub outage_seconds: Option<i64>,
    pub last_preemption: Option<DateTime<Utc>>,
    pub cert_sync: SyncCounters,
    pub key_sync: SyncCounters,
}

/// Introspection counters shared by the certificate and key stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncCounters {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub synced_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_target_filters_ssh_port() {
        let target = BackendTarget::new("10.0.0.5".to_string(), vec![22, 80, 443, 50051]);
        assert_eq!(target.ports, vec![80, 443, 50051]);
    }

    #[test]
    fn backend_target_dedups_and_sorts() {
        let target = BackendTarget::new("10.0.0.5".to_string(), vec![443, 80, 80, 22]);
        assert_eq!(target.ports, vec![80, 443]);
    }

    #[test]
    fn mode_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Mode::Proxy).unwrap(), "\"PROXY\"");
        assert_eq!(
            serde_json::to_string(&Mode::Maintenance).unwrap(),
            "\"MAINTENANCE\""
        );
    }
}
