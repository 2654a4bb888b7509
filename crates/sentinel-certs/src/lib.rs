//! Certificate store (C4): an in-memory `domain -> leaf cert` map, kept
//! current by polling the backend's `/certs` endpoint, with a self-signed
//! fallback used whenever the backend is unreachable or has no entry for the
//! requested name. Exposed to the HTTPS listener as a
//! `rustls::server::ResolvesServerCert` so SNI lookups are a single read
//! lock away from the hot path.
//!
//! PEM parsing and self-signed cert generation are grounded on the reference
//! kftray SSL module (`rustls-pemfile` for decode, `rcgen` for the fallback
//! leaf), simplified here since the sentinel has no CA hierarchy or
//! OS-keychain requirement: certs are re-fetched from the backend on every
//! sync tick rather than persisted locally.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sentinel_proto::{CertsResponse, SyncCounters};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const FALLBACK_COMMON_NAME: &str = "Containarium Sentinel";
const FALLBACK_VALIDITY_DAYS: i64 = 365 * 10;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// Installs the process-wide rustls crypto provider exactly once. Both the
/// fallback cert generator and the HTTPS listener's `ServerConfig` need one
/// installed before their first use.
pub fn ensure_crypto_provider_installed() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            rustls::crypto::ring::default_provider()
                .install_default()
                .expect("failed to install rustls crypto provider");
        }
    });
}

#[derive(Debug, Error)]
pub enum CertError {
    #[error("network error talking to backend: {0}")]
    Network(#[from] reqwest::Error),
    #[error("backend returned an unparseable cert entry: {0}")]
    Decode(String),
    #[error("tls error: {0}")]
    Tls(String),
}

pub type CertResult<T> = Result<T, CertError>;

/// Decodes a PEM certificate chain + private key into a ring-backed
/// `CertifiedKey` rustls can hand straight to a TLS handshake.
fn build_certified_key(cert_pem: &str, key_pem: &str) -> CertResult<CertifiedKey> {
    let mut cert_reader = cert_pem.as_bytes();
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| CertError::Decode(format!("certificate chain: {e}")))?;
    if chain.is_empty() {
        return Err(CertError::Decode("no certificates in PEM".to_string()));
    }

    let mut key_reader = key_pem.as_bytes();
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| CertError::Decode(format!("private key: {e}")))?
        .ok_or_else(|| CertError::Decode("no private key in PEM".to_string()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertError::Tls(e.to_string()))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Generates the self-signed leaf served when no domain-specific cert is
/// available: ECDSA P-256, ten-year validity, `CN=Containarium Sentinel`
/// with a wildcard SAN so any SNI name still gets a cert the client can at
/// least attempt (and reject, if it verifies).
fn generate_fallback() -> CertResult<CertifiedKey> {
    let sans = vec![
        "localhost".to_string(),
        "*".to_string(),
    ];
    let mut params = rcgen::CertificateParams::new(sans)
        .map_err(|e| CertError::Tls(format!("fallback cert params: {e}")))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, FALLBACK_COMMON_NAME);
    params
        .subject_alt_names
        .push(rcgen::SanType::IpAddress(std::net::IpAddr::V4(
            std::net::Ipv4Addr::UNSPECIFIED,
        )));
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(1);
    params.not_after = now + time::Duration::days(FALLBACK_VALIDITY_DAYS);

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| CertError::Tls(format!("keypair: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Tls(format!("self-sign: {e}")))?;

    let chain = vec![cert.der().clone()];
    let key_der: PrivateKeyDer<'static> =
        PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into();
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| CertError::Tls(e.to_string()))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// `domain -> leaf cert` map with a fallback, swapped in atomically on every
/// sync so an in-progress handshake never observes half of a new batch.
pub struct CertStore {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    fallback: Arc<CertifiedKey>,
    client: reqwest::Client,
    counters: RwLock<SyncCounters>,
}

impl CertStore {
    pub fn new() -> CertResult<Self> {
        ensure_crypto_provider_installed();
        Ok(Self {
            certs: RwLock::new(HashMap::new()),
            fallback: Arc::new(generate_fallback()?),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            counters: RwLock::new(SyncCounters::default()),
        })
    }

    /// A snapshot of the introspection counters for the status endpoints.
    pub fn counters(&self) -> SyncCounters {
        self.counters.read().clone()
    }

    /// Fetches the backend's current cert set and replaces the whole map in
    /// one write-lock acquisition. A failed fetch leaves the existing map
    /// (or the fallback, if this is the first sync) in place.
    pub async fn sync(&self, backend_ip: &str, backend_port: u16) -> CertResult<usize> {
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

    async fn try_sync(&self, backend_ip: &str, backend_port: u16) -> CertResult<usize> {
        let url = format!("http://{backend_ip}:{backend_port}/certs");
        let response: CertsResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut fresh = HashMap::with_capacity(response.certs.len());
        for entry in &response.certs {
            match build_certified_key(&entry.cert_pem, &entry.key_pem) {
                Ok(certified) => {
                    fresh.insert(entry.domain.clone(), Arc::new(certified));
                }
                Err(e) => warn!(domain = %entry.domain, error = %e, "skipping unparseable cert entry"),
            }
        }

        let count = fresh.len();
        *self.certs.write() = fresh;
        info!(count, "cert store synced from backend");
        Ok(count)
    }

    /// Exact match, then first-dot wildcard (`api.example.com` ->
    /// `*.example.com`), then the self-signed fallback. Never fails: a
    /// missing/unparseable SNI name still gets a cert back. Synchronous so
    /// it can be called directly from the rustls SNI resolution hook.
    pub fn resolve(&self, sni: Option<&str>) -> Arc<CertifiedKey> {
        let Some(name) = sni else {
            return self.fallback.clone();
        };
        let certs = self.certs.read();
        if let Some(certified) = certs.get(name) {
            return certified.clone();
        }
        if let Some((_, rest)) = name.split_once('.') {
            let wildcard = format!("*.{rest}");
            if let Some(certified) = certs.get(&wildcard) {
                return certified.clone();
            }
        }
        debug!(sni = name, "no match in cert store; serving fallback");
        self.fallback.clone()
    }

    /// Runs `sync` on `interval`, starting with an immediate sync, until
    /// `cancel` fires. Sync errors are logged and do not stop the loop.
    /// `on_sync` is invoked with the fresh counters after every attempt
    /// (success or failure) so a caller can mirror them into its own
    /// jointly-locked state without re-acquiring this store's lock later.
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
                    info!("cert sync loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync(&backend_ip, backend_port).await {
                        warn!(error = %e, "cert sync failed; keeping previous certs");
                    }
                    on_sync(self.counters());
                }
            }
        }
    }
}

/// Adapts `CertStore` to rustls's SNI resolution hook.
pub struct SniResolver(pub Arc<CertStore>);

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.resolve(client_hello.server_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_served_when_store_is_empty() {
        let store = CertStore::new().unwrap();
        let resolved = store.resolve(Some("unknown.example.com"));
        assert!(Arc::ptr_eq(&resolved, &store.fallback));
    }

    #[test]
    fn fallback_is_served_when_sni_is_absent() {
        let store = CertStore::new().unwrap();
        let resolved = store.resolve(None);
        assert!(Arc::ptr_eq(&resolved, &store.fallback));
    }

    #[test]
    fn exact_domain_match_wins_over_fallback() {
        let store = CertStore::new().unwrap();
        let fallback_for_other = generate_fallback().unwrap();
        store
            .certs
            .write()
            .insert("api.example.com".to_string(), Arc::new(fallback_for_other));
        let resolved = store.resolve(Some("api.example.com"));
        assert!(!Arc::ptr_eq(&resolved, &store.fallback));
    }

    #[test]
    fn wildcard_fallback_matches_first_dot_subdomain() {
        let store = CertStore::new().unwrap();
        let wildcard_cert = generate_fallback().unwrap();
        store
            .certs
            .write()
            .insert("*.example.com".to_string(), Arc::new(wildcard_cert));
        let resolved = store.resolve(Some("api.example.com"));
        assert!(!Arc::ptr_eq(&resolved, &store.fallback));
    }

    #[test]
    fn sibling_wildcard_does_not_match_a_deeper_subdomain() {
        let store = CertStore::new().unwrap();
        let wildcard_cert = generate_fallback().unwrap();
        store
            .certs
            .write()
            .insert("*.example.com".to_string(), Arc::new(wildcard_cert));
        // a.b.example.com splits to ("a", "b.example.com"), so the wildcard
        // key constructed is "*.b.example.com", which isn't in the map.
        let resolved = store.resolve(Some("a.b.example.com"));
        assert!(Arc::ptr_eq(&resolved, &store.fallback));
    }

    #[test]
    fn fallback_generation_succeeds() {
        assert!(generate_fallback().is_ok());
    }
}
