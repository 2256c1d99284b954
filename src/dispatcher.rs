use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::warn;

/// A boxed unit of callback work, ready to be scheduled.
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Decides where notification callbacks run.
///
/// Every component in this crate invokes its registered handlers through an attached
///  [Dispatcher] instead of a hard-coded threading primitive, so the same channel code serves
///  worker-pool, dedicated-worker and synchronous deployments. Dispatchers are constructed
///  explicitly and passed in - there is no ambient global.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn invoke(&self, callback: CallbackFuture);
}

/// Runs callbacks on the invoking task, completing them before `invoke` returns.
///
/// Under a multithreaded runtime this is the shared-worker-pool deployment: each connection's
///  receive loop is its own task, so frames of one connection dispatch in arrival order while
///  different connections proceed in parallel. On a current-thread runtime the same dispatcher
///  gives fully synchronous delivery.
pub struct InlineDispatcher;

#[async_trait]
impl Dispatcher for InlineDispatcher {
    async fn invoke(&self, callback: CallbackFuture) {
        callback.await;
    }
}

/// Funnels all callbacks through one dedicated worker task, in strict submission order even
///  when callers live on different tasks.
///
/// Must be created inside a tokio runtime. Dropping the dispatcher stops the worker; callbacks
///  still queued at that point are discarded.
pub struct QueuedDispatcher {
    queue: mpsc::UnboundedSender<CallbackFuture>,
    worker: tokio::task::JoinHandle<()>,
}

impl QueuedDispatcher {
    pub fn new() -> QueuedDispatcher {
        let (queue, mut rx) = mpsc::unbounded_channel::<CallbackFuture>();
        let worker = tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                callback.await;
            }
        });
        QueuedDispatcher { queue, worker }
    }
}

impl Default for QueuedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for QueuedDispatcher {
    async fn invoke(&self, callback: CallbackFuture) {
        if self.queue.send(callback).is_err() {
            warn!("dispatcher worker is gone - discarding callback");
        }
    }
}

impl Drop for QueuedDispatcher {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
