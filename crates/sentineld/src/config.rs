use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("forward.ports must not be empty")]
    NoForwardedPorts,
    #[error("forward.ports must not contain port 22 (reserved for SSH)")]
    ReservedSshPort,
    #[error("probe.healthy_threshold must be non-zero")]
    ZeroHealthyThreshold,
    #[error("probe.unhealthy_threshold must be non-zero")]
    ZeroUnhealthyThreshold,
    #[error("cloud.provider is \"hetzner\" but cloud.hetzner.api_token is empty (set it in the config file or SENTINEL_HETZNER_API_TOKEN)")]
    MissingHetznerToken,
    #[error("unknown cloud.provider {0:?}, expected \"hetzner\" or \"noop\"")]
    UnknownProvider(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub port: u16,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: 22,
            interval_secs: 5,
            timeout_secs: 5,
            healthy_threshold: 3,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub ports: Vec<u16>,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            ports: vec![80, 443],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:80".parse().unwrap(),
            https_addr: "0.0.0.0:443".parse().unwrap(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BinaryConfig {
    /// Internal status/binary surface (C9) address. `None` disables it.
    pub addr: Option<SocketAddr>,
    /// Directory `/containarium` serves. `None` makes that route 404.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub cert_interval_secs: u64,
    pub key_interval_secs: u64,
    /// Port on the backend VM that exposes `/certs` and `/authorized-keys`.
    pub backend_api_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cert_interval_secs: 6 * 60 * 60,
            key_interval_secs: 120,
            backend_api_port: 9000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Root directory sshpiper config/authorized_keys files are rendered
    /// under, mirroring the backend's own `/etc` layout.
    pub etc_dir: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            etc_dir: PathBuf::from("/etc"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    pub bridge_iface: String,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            bridge_iface: "docker0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// `0` (the default) disables the recovery-timeout warning.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HetznerConfig {
    pub api_token: String,
    pub server_id: u64,
}

impl Default for HetznerConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            server_id: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NoopConfig {
    pub instance_ip: String,
}

impl Default for NoopConfig {
    fn default() -> Self {
        Self {
            instance_ip: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub provider: String,
    pub hetzner: HetznerConfig,
    pub noop: NoopConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub probe: ProbeConfig,
    pub forward: ForwardConfig,
    pub web: WebConfig,
    pub binary: BinaryConfig,
    pub recovery: RecoveryConfig,
    pub sync: SyncConfig,
    pub ssh: SshConfig,
    pub nat: NatConfig,
    pub cloud: CloudConfig,
}

impl Config {
    /// Reads and parses `path`, then applies environment overrides for the
    /// Hetzner API token so it never has to sit in the TOML file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Ok(token) = std::env::var("SENTINEL_HETZNER_API_TOKEN") {
            config.cloud.hetzner.api_token = token;
        }
        Ok(config)
    }

    /// Rejects configurations that would violate a startup invariant:
    /// an empty or port-22-containing forwarded-port set, a zero health
    /// threshold, or a selected cloud provider missing its credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.forward.ports.is_empty() {
            return Err(ConfigError::NoForwardedPorts);
        }
        if self.forward.ports.contains(&22) {
            return Err(ConfigError::ReservedSshPort);
        }
        if self.probe.healthy_threshold == 0 {
            return Err(ConfigError::ZeroHealthyThreshold);
        }
        if self.probe.unhealthy_threshold == 0 {
            return Err(ConfigError::ZeroUnhealthyThreshold);
        }
        match self.cloud.provider.as_str() {
            "hetzner" => {
                if self.cloud.hetzner.api_token.is_empty() {
                    return Err(ConfigError::MissingHetznerToken);
                }
            }
            "noop" => {}
            other => return Err(ConfigError::UnknownProvider(other.to_string())),
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_secs)
    }

    pub fn cert_sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.cert_interval_secs)
    }

    pub fn key_sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.key_interval_secs)
    }

    pub fn recovery_timeout(&self) -> Option<Duration> {
        (self.recovery.timeout_secs > 0).then(|| Duration::from_secs(self.recovery.timeout_secs))
    }
}
