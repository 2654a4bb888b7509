//! TCP health probing (C2) and the healthy/unhealthy streak window used by
//! the mode manager to decouple a mode transition from a single spurious
//! probe result.

#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

/// Attempts a TCP three-way handshake to `(ip, port)` within `probe_timeout`.
/// The connection is immediately dropped on success. This is deliberately
/// the only cloud-agnostic liveness test: the cloud API is touched only when
/// this probe fails, to keep per-tick cost to a single local syscall plus
/// one network round trip.
///
/// Does not log — per-probe logging at a 5s-or-faster interval would flood
/// the log at steady state; failures are surfaced by the caller once a
/// threshold is crossed, not per attempt.
pub async fn probe(ip: &str, port: u16, probe_timeout: Duration) -> bool {
    let addr = format!("{ip}:{port}");
    match timeout(probe_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        _ => false,
    }
}

/// Consecutive same-result probe counters plus the thresholds that turn a
/// streak into a mode transition. Invariant: at most one of
/// `healthy_streak`/`unhealthy_streak` is non-zero at any instant.
#[derive(Debug, Clone, Copy)]
pub struct HealthWindow {
    pub healthy_streak: u32,
    pub unhealthy_streak: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl HealthWindow {
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            healthy_streak: 0,
            unhealthy_streak: 0,
            healthy_threshold,
            unhealthy_threshold,
        }
    }

    /// Record a successful probe: zeros `unhealthy_streak`, increments
    /// `healthy_streak`. Returns `true` once the healthy threshold is met.
    pub fn record_success(&mut self) -> bool {
        self.unhealthy_streak = 0;
        self.healthy_streak = self.healthy_streak.saturating_add(1);
        self.healthy_streak >= self.healthy_threshold
    }

    /// Record a failed probe: zeros `healthy_streak`, increments
    /// `unhealthy_streak`. Returns `true` once the unhealthy threshold is met.
    pub fn record_failure(&mut self) -> bool {
        self.healthy_streak = 0;
        self.unhealthy_streak = self.unhealthy_streak.saturating_add(1);
        self.unhealthy_streak >= self.unhealthy_threshold
    }

    /// A mode transition consumes the streak that triggered it so the next
    /// crossing needs a fresh run of `threshold` consecutive results.
    pub fn reset(&mut self) {
        self.healthy_streak = 0;
        self.unhealthy_streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[tokio::test]
    async fn probe_succeeds_against_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // accept in the background so the handshake completes
        tokio::task::spawn_blocking(move || {
            let _ = listener.accept();
        });
        assert!(probe("127.0.0.1", port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn probe_fails_against_a_closed_port() {
        // Port 1 is reserved and almost certainly not listening in test envs.
        assert!(!probe("127.0.0.1", 1, Duration::from_millis(200)).await);
    }

    #[test]
    fn streaks_are_never_both_positive() {
        let mut window = HealthWindow::new(2, 3);
        window.record_success();
        assert_eq!(window.unhealthy_streak, 0);
        window.record_failure();
        assert_eq!(window.healthy_streak, 0);
    }

    #[test]
    fn healthy_threshold_crossed_after_exact_count() {
        let mut window = HealthWindow::new(2, 3);
        assert!(!window.record_success());
        assert!(window.record_success());
    }

    #[test]
    fn unhealthy_threshold_crossed_after_exact_count() {
        let mut window = HealthWindow::new(2, 3);
        assert!(!window.record_failure());
        assert!(!window.record_failure());
        assert!(window.record_failure());
    }

    #[test]
    fn reset_clears_both_streaks() {
        let mut window = HealthWindow::new(2, 3);
        window.record_success();
        window.reset();
        assert_eq!(window.healthy_streak, 0);
        assert_eq!(window.unhealthy_streak, 0);
    }
}
