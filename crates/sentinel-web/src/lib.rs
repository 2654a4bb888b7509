//! Maintenance HTTP/HTTPS listeners (C6) and the internal status/binary HTTP
//! surface (C9). Both are thin axum routers composed the way the reference
//! proxy server builds its router: `Router::new().route(...)`, bound with
//! `tokio::net::TcpListener`, served with `axum::serve(...).with_graceful_shutdown(...)`.

#![forbid(unsafe_code)]

mod binary;
mod html;
mod maintenance;

pub use binary::StatusBinaryServer;
pub use maintenance::MaintenanceServers;

use async_trait::async_trait;
use sentinel_proto::StatusSnapshot;

/// Implemented by the mode manager so the web surfaces can render a status
/// snapshot without depending on `sentinel-core` (which depends on this
/// crate for its listeners).
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn snapshot(&self) -> StatusSnapshot;
}
