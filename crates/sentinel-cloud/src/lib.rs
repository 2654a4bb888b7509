//! Cloud provider abstraction (C1) and lifecycle event ingestion (C7).
//!
//! The supervisor never talks to a cloud API directly; it goes through a
//! [`CloudProvider`], feature-testing `supports_events` at startup to decide
//! whether to spawn the event-ingestion task.

#![forbid(unsafe_code)]

mod hetzner;
mod noop;

pub use hetzner::HetznerProvider;
pub use noop::NoopProvider;
pub use sentinel_proto::{BackendTarget, InstanceStatus, VmEvent, VmEventKind};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("network error talking to cloud API: {0}")]
    Network(#[from] reqwest::Error),
    #[error("cloud API returned an error: {0}")]
    Api(String),
    #[error("failed to decode cloud API response: {0}")]
    Decode(String),
}

pub type CloudResult<T> = Result<T, CloudError>;

/// Capability set a cloud provider must expose. All required methods are
/// cancellable through the caller's own timeout/select — the trait itself
/// does not carry a cancellation token for them since a single request is
/// always bounded by the HTTP client's own deadline.
#[async_trait]
pub trait CloudProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn get_instance_status(&self) -> CloudResult<InstanceStatus>;

    async fn get_instance_ip(&self) -> CloudResult<String>;

    async fn start_instance(&self) -> CloudResult<()>;

    /// Whether this provider can stream lifecycle events. The supervisor
    /// feature-tests this at startup rather than calling `watch_events`
    /// unconditionally.
    fn supports_events(&self) -> bool {
        false
    }

    /// Stream VM lifecycle events into `sink` until `cancel` fires. The
    /// default implementation is a no-op that returns as soon as cancelled;
    /// providers with `supports_events() == true` must override it. The
    /// producer never closes `sink` itself — it only stops producing.
    async fn watch_events(
        &self,
        _sink: mpsc::Sender<VmEvent>,
        cancel: CancellationToken,
    ) -> CloudResult<()> {
        cancel.cancelled().await;
        Ok(())
    }
}
