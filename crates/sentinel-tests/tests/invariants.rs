//! Cross-crate invariants that don't belong to a single crate's own unit
//! tests: NAT idempotence, cert-store fallback serving fed by a real sync
//! against a backend, and SSH sync/apply/restart no-churn across a synced
//! cycle.

mod common;

use std::sync::Arc;

use common::MockBackend;
use sentinel_nat::NatActuator;
use sentinel_proto::{CertEntryWire, UserKeyWire};
use sentinel_ssh::SshKeyStore;

/// `enable; disable; enable` must never error, whether or not iptables is
/// actually present on the host running the test — `NatActuator` degrades to
/// a no-op rather than failing when the binary is missing.
#[tokio::test]
async fn nat_enable_disable_enable_is_idempotent() {
    let nat = NatActuator::new();
    nat.enable("10.0.0.5", &[80, 443]).await.unwrap();
    nat.disable().await.unwrap();
    nat.enable("10.0.0.5", &[80, 443]).await.unwrap();
    nat.disable().await.unwrap();
}

/// Before any sync, and for any name the backend never reports a cert for,
/// `CertStore::resolve` must still return a usable certified key — the
/// fallback — rather than `None` or a panic.
#[tokio::test]
async fn cert_store_serves_fallback_before_first_sync_and_for_unknown_names() {
    let store = sentinel_certs::CertStore::new().unwrap();
    let fallback = store.resolve(None);
    assert!(Arc::ptr_eq(&fallback, &store.resolve(Some("nonexistent.example"))));
    assert!(Arc::ptr_eq(&fallback, &store.resolve(None)));
}

/// After a sync populates an exact match and a wildcard entry, `resolve`
/// must prefer the exact match, fall back to the first-dot wildcard, and
/// still serve the fallback for names matching neither.
#[tokio::test]
async fn cert_store_sync_prefers_exact_match_then_wildcard_then_fallback() {
    let backend = MockBackend::spawn("127.0.0.1:19201".parse().unwrap()).await;
    {
        let mut certs = backend.certs.lock();
        certs.push(CertEntryWire {
            domain: "api.example.com".to_string(),
            cert_pem: TEST_CERT_PEM.to_string(),
            key_pem: TEST_KEY_PEM.to_string(),
        });
        certs.push(CertEntryWire {
            domain: "*.example.com".to_string(),
            cert_pem: TEST_CERT_PEM.to_string(),
            key_pem: TEST_KEY_PEM.to_string(),
        });
    }

    let store = sentinel_certs::CertStore::new().unwrap();
    let synced = store.sync("127.0.0.1", 19201).await.unwrap();
    assert_eq!(synced, 2);

    let exact = store.resolve(Some("api.example.com"));
    let wildcard_hit = store.resolve(Some("other.example.com"));
    let fallback_hit = store.resolve(Some("unrelated.org"));
    let fallback = store.resolve(None);

    assert!(!Arc::ptr_eq(&exact, &fallback), "an exact match must not serve the fallback");
    assert!(!Arc::ptr_eq(&wildcard_hit, &fallback), "a wildcard match must not serve the fallback");
    assert!(!Arc::ptr_eq(&exact, &wildcard_hit), "exact and wildcard entries are distinct map entries");
    assert!(Arc::ptr_eq(&fallback_hit, &fallback), "a name matching neither entry must serve the fallback");

    backend.shutdown().await;
}

/// `sync_cycle` run twice with an unchanged user set must not rewrite the
/// sshpiper config or restart the service the second time — the signal
/// `apply` returns governs whether `restart_sshpiper` is even attempted, and
/// this proves that plumbing survives a real sync from the backend rather
/// than a hand-seeded user list.
#[tokio::test]
async fn ssh_sync_cycle_has_no_churn_when_backend_content_is_unchanged() {
    let backend = MockBackend::spawn("127.0.0.1:19202".parse().unwrap()).await;
    backend.keys.lock().push(UserKeyWire {
        username: "alice".to_string(),
        authorized_keys: "ssh-ed25519 AAAA alice@host".to_string(),
    });

    let etc = tempfile::tempdir().unwrap();
    let sshpiper_dir = etc.path().join("sshpiper");
    tokio::fs::create_dir_all(&sshpiper_dir).await.unwrap();
    tokio::fs::write(sshpiper_dir.join("upstream_key.pub"), "ssh-ed25519 AAAA sentinel\n")
        .await
        .unwrap();

    let store = SshKeyStore::new(etc.path()).unwrap();
    store.sync("127.0.0.1", 19202).await.unwrap();
    store.push_sentinel_key("127.0.0.1", 19202).await.unwrap();
    let first_apply_changed = store.apply("127.0.0.1").await.unwrap();
    assert!(first_apply_changed, "first apply must write the config");

    store.sync("127.0.0.1", 19202).await.unwrap();
    store.push_sentinel_key("127.0.0.1", 19202).await.unwrap();
    let second_apply_changed = store.apply("127.0.0.1").await.unwrap();
    assert!(
        !second_apply_changed,
        "second apply with unchanged backend content must not rewrite the config"
    );

    let counters = store.counters();
    assert_eq!(counters.synced_count, 1);
    assert!(counters.last_error.is_none());

    backend.shutdown().await;
}

// A minimal self-signed ECDSA P-256 cert/key pair, generated once for use as
// fixture data across these tests (any leaf the mock backend's PEM decoder
// can parse is sufficient — sentinel-certs never validates the chain).
const TEST_CERT_PEM: &str = include_str!("fixtures/leaf.crt.pem");
const TEST_KEY_PEM: &str = include_str!("fixtures/leaf.key.pem");
