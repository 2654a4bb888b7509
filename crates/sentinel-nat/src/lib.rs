//! NAT actuator (C3): installs and tears down the kernel rules that forward
//! the public-facing ports to the backend VM while it is reachable. Grounded
//! on the async `tokio::process::Command` invocation pattern used by the
//! reference TLS trust-store helper for shelling out to system tools
//! (`update-ca-certificates`/`update-ca-trust`) rather than blocking the
//! runtime with `std::process::Command`.

#![forbid(unsafe_code)]

use std::net::Ipv4Addr;
use std::process::Output;
use std::str::FromStr;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NatError {
    #[error("iptables exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
}

pub type NatResult<T> = Result<T, NatError>;

/// Installs/removes the NAT rules forwarding `ports` on this host to a
/// backend's IP. One actuator instance owns exactly one dedicated chain, so
/// multiple sentinels on the same host (unlikely, but cheap to support) do
/// not clobber each other's rules.
#[derive(Debug, Clone)]
pub struct NatActuator {
    iptables_bin: String,
    dnat_chain: String,
    comment_tag: String,
    bridge_iface: String,
}

impl Default for NatActuator {
    fn default() -> Self {
        Self {
            iptables_bin: "iptables".to_string(),
            dnat_chain: "SENTINEL-DNAT".to_string(),
            comment_tag: "sentinel-managed".to_string(),
            bridge_iface: "docker0".to_string(),
        }
    }
}

impl NatActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the bridge interface used for the loopback-bridge CIDR
    /// exclusion. Defaults to `docker0`.
    pub fn with_bridge_iface(mut self, iface: impl Into<String>) -> Self {
        self.bridge_iface = iface.into();
        self
    }

    async fn available(&self) -> bool {
        Command::new(&self.iptables_bin)
            .arg("--version")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn run(&self, args: &[&str]) -> NatResult<Output> {
        debug!(bin = %self.iptables_bin, args = ?args, "running iptables");
        let output = Command::new(&self.iptables_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| NatError::Spawn(self.iptables_bin.clone(), e))?;
        if !output.status.success() {
            return Err(NatError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Best-effort invocation used during cleanup, where a missing rule or
    /// chain (for instance on first-ever start) is not an error.
    async fn run_best_effort(&self, args: &[&str]) {
        if let Err(e) = self.run(args).await {
            debug!(error = %e, args = ?args, "iptables cleanup step was a no-op");
        }
    }

    /// Installs DNAT rules forwarding `target_ip:port` for every port in
    /// `ports`, a POSTROUTING masquerade rule, and bidirectional FORWARD
    /// accept rules. Idempotent: any rules from a previous `enable()` call
    /// are flushed first.
    pub async fn enable(&self, target_ip: &str, ports: &[u16]) -> NatResult<()> {
        if !self.available().await {
            warn!("iptables not available on this host; NAT forwarding is a no-op");
            return Ok(());
        }

        self.disable().await?;

        self.run_best_effort(&["-t", "nat", "-N", &self.dnat_chain])
            .await;

        let bridge_cidr = detect_bridge_cidr(&self.bridge_iface).await;
        match &bridge_cidr {
            Some(cidr) => {
                self.run(&[
                    "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "!", "-s", cidr, "-j",
                    &self.dnat_chain, "-m", "comment", "--comment", &self.comment_tag,
                ])
                .await?;
            }
            None => {
                debug!(iface = %self.bridge_iface, "bridge CIDR not detected; installing PREROUTING jump without exclusion");
                self.run(&[
                    "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "-j", &self.dnat_chain, "-m",
                    "comment", "--comment", &self.comment_tag,
                ])
                .await?;
            }
        }

        for port in ports {
            let dport = port.to_string();
            let destination = format!("{target_ip}:{port}");
            self.run(&[
                "-t",
                "nat",
                "-A",
                &self.dnat_chain,
                "-p",
                "tcp",
                "--dport",
                &dport,
                "-j",
                "DNAT",
                "--to-destination",
                &destination,
                "-m",
                "comment",
                "--comment",
                &self.comment_tag,
            ])
            .await?;
        }

        self.run(&[
            "-t", "nat", "-A", "POSTROUTING", "-p", "tcp", "-d", target_ip, "-j", "MASQUERADE",
            "-m", "comment", "--comment", &self.comment_tag,
        ])
        .await?;

        self.run(&[
            "-I", "FORWARD", "-p", "tcp", "-d", target_ip, "-j", "ACCEPT", "-m", "comment",
            "--comment", &self.comment_tag,
        ])
        .await?;
        self.run(&[
            "-I", "FORWARD", "-p", "tcp", "-s", target_ip, "-j", "ACCEPT", "-m", "comment",
            "--comment", &self.comment_tag,
        ])
        .await?;

        info!(target_ip, ports = ?ports, "NAT forwarding enabled");
        Ok(())
    }

    /// Removes every rule this actuator has ever installed, identified by
    /// `comment_tag`, then flushes and deletes the dedicated chain. Safe to
    /// call when nothing is installed.
    pub async fn disable(&self) -> NatResult<()> {
        if !self.available().await {
            return Ok(());
        }

        self.delete_tagged_rules("nat", "PREROUTING").await;
        self.delete_tagged_rules("nat", "POSTROUTING").await;
        self.delete_tagged_rules("filter", "FORWARD").await;

        self.run_best_effort(&["-t", "nat", "-F", &self.dnat_chain])
            .await;
        self.run_best_effort(&["-t", "nat", "-X", &self.dnat_chain])
            .await;

        info!("NAT forwarding disabled");
        Ok(())
    }

    /// Lists `chain` in `table`, finds every rule carrying this actuator's
    /// comment tag, then deletes them by line number from the bottom up so
    /// earlier deletions don't shift the indices of later ones.
    async fn delete_tagged_rules(&self, table: &str, chain: &str) {
        let Ok(output) = Command::new(&self.iptables_bin)
            .args(["-t", table, "-L", chain, "--line-numbers", "-n"])
            .output()
            .await
        else {
            return;
        };
        if !output.status.success() {
            return;
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        let mut line_numbers: Vec<u32> = listing
            .lines()
            .filter(|line| line.contains(&self.comment_tag))
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|n| n.parse().ok())
            .collect();
        line_numbers.sort_unstable_by(|a, b| b.cmp(a));
        for line_number in line_numbers {
            self.run_best_effort(&["-t", table, "-D", chain, &line_number.to_string()])
                .await;
        }
    }
}

/// Auto-detects the bridge's IPv4 network so the PREROUTING jump excludes
/// traffic that already originates from containers on the bridge (which
/// should route directly, not through the public DNAT path). Returns `None`
/// if the interface is absent or unparseable; callers treat that as "install
/// without an exclusion" rather than a hard failure.
async fn detect_bridge_cidr(iface: &str) -> Option<String> {
    let output = Command::new("ip")
        .args(["-4", "-o", "addr", "show", "dev", iface])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let inet_field = text.split_whitespace().find(|tok| tok.contains('/'))?;
    parse_cidr_network(inet_field)
}

/// Given an `address/prefix` string, zeroes the host bits and returns the
/// resulting network in the same notation, e.g. `172.17.0.1/16` -> `172.17.0.0/16`.
fn parse_cidr_network(addr_slash_prefix: &str) -> Option<String> {
    let (addr, prefix) = addr_slash_prefix.split_once('/')?;
    let ip = Ipv4Addr::from_str(addr).ok()?;
    let prefix_len: u32 = prefix.parse().ok()?;
    if prefix_len > 32 {
        return None;
    }
    let mask: u32 = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    let network = u32::from(ip) & mask;
    Some(format!("{}/{}", Ipv4Addr::from(network), prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_address_with_host_bits_set() {
        assert_eq!(
            parse_cidr_network("172.17.0.1/16"),
            Some("172.17.0.0/16".to_string())
        );
    }

    #[test]
    fn parses_address_already_a_network() {
        assert_eq!(
            parse_cidr_network("10.0.0.0/8"),
            Some("10.0.0.0/8".to_string())
        );
    }

    #[test]
    fn rejects_prefix_over_32() {
        assert_eq!(parse_cidr_network("10.0.0.1/33"), None);
    }

    #[test]
    fn rejects_unparseable_address() {
        assert_eq!(parse_cidr_network("not-an-ip/16"), None);
    }

    #[test]
    fn slash_zero_masks_to_the_zero_network() {
        assert_eq!(
            parse_cidr_network("192.168.1.5/0"),
            Some("0.0.0.0/0".to_string())
        );
    }

    #[test]
    fn default_actuator_uses_expected_chain_and_tag() {
        let actuator = NatActuator::new();
        assert_eq!(actuator.dnat_chain, "SENTINEL-DNAT");
        assert_eq!(actuator.comment_tag, "sentinel-managed");
        assert_eq!(actuator.bridge_iface, "docker0");
    }

    #[test]
    fn with_bridge_iface_overrides_default() {
        let actuator = NatActuator::new().with_bridge_iface("br0");
        assert_eq!(actuator.bridge_iface, "br0");
    }
}
