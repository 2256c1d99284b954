//! The raw transport seam. Concrete socket transports (TCP, WebSocket, USB) live outside this
//!  crate behind these traits; [local::LocalTransport] is the in-process implementation used
//!  by demos and tests.

pub mod local;

use crate::protocol::Frame;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;

/// Factory for transport sessions: `connect` on the client side, `bind` on the service side.
///
/// Passed around as `Arc<dyn Transport>` to keep channel code independent of the concrete
///  transport implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn TransportSession>>;

    async fn bind(&self, address: &str) -> anyhow::Result<Box<dyn TransportListener>>;
}

/// One established point-to-point connection carrying [Frame]s in both directions.
///
/// Disconnection is a distinguishable terminal event - `recv` returns `Ok(None)` - and not an
///  error: an `Err` from `recv` means the transport itself failed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportSession: Send + Sync + 'static {
    async fn send(&self, frame: Frame) -> anyhow::Result<()>;

    async fn recv(&self) -> anyhow::Result<Option<Frame>>;

    /// closes both directions; the peer's `recv` sees EOF. Idempotent.
    async fn close(&self);
}

/// The service-side accept loop handle. `accept` returns `Ok(None)` once the listener is
///  closed and drained.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportListener: Send + Sync + 'static {
    /// the next accepted session, together with the peer's address
    async fn accept(&self) -> anyhow::Result<Option<(Arc<dyn TransportSession>, String)>>;

    async fn close(&self);
}
