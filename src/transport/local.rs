use crate::error::ChannelError;
use crate::protocol::Frame;
use crate::transport::{Transport, TransportListener, TransportSession};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

type AcceptQueue = mpsc::UnboundedSender<(Arc<dyn TransportSession>, String)>;

/// In-process transport: sessions are pairs of unbounded channels, listeners live in an
///  instance-owned address registry. Both sides of a conversation must share the same
///  `LocalTransport` instance - there is deliberately no process-wide registry.
pub struct LocalTransport {
    listeners: Mutex<FxHashMap<String, AcceptQueue>>,
}

impl LocalTransport {
    pub fn new() -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            listeners: Mutex::new(FxHashMap::default()),
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, address: &str) -> anyhow::Result<Arc<dyn TransportSession>> {
        let listeners = self.listeners.lock().await;
        let acceptor = listeners.get(address)
            .filter(|acceptor| !acceptor.is_closed())
            .ok_or_else(|| ChannelError::ConnectFailed(format!("nothing is listening on {:?}", address)))?;

        let (to_service, from_client) = mpsc::unbounded_channel();
        let (to_client, from_service) = mpsc::unbounded_channel();

        let client_side: Arc<dyn TransportSession> = Arc::new(LocalSession::new(to_service, from_service));
        let service_side: Arc<dyn TransportSession> = Arc::new(LocalSession::new(to_client, from_client));

        let sender_address = format!("local://{}", Uuid::new_v4());
        acceptor.send((service_side, sender_address))
            .map_err(|_| ChannelError::ConnectFailed(format!("listener on {:?} is shutting down", address)))?;

        Ok(client_side)
    }

    async fn bind(&self, address: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let (acceptor, accept_queue) = mpsc::unbounded_channel();

        match self.listeners.lock().await.entry(address.to_string()) {
            Entry::Occupied(mut e) => {
                if !e.get().is_closed() {
                    bail!("address {:?} is already bound", address);
                }
                // a previous listener was closed - take over its address
                e.insert(acceptor);
            }
            Entry::Vacant(e) => {
                e.insert(acceptor);
            }
        }

        debug!("bound local listener on {:?}", address);
        Ok(Box::new(LocalListener {
            accept_queue: Mutex::new(accept_queue),
        }))
    }
}

struct LocalListener {
    accept_queue: Mutex<mpsc::UnboundedReceiver<(Arc<dyn TransportSession>, String)>>,
}

#[async_trait]
impl TransportListener for LocalListener {
    async fn accept(&self) -> anyhow::Result<Option<(Arc<dyn TransportSession>, String)>> {
        Ok(self.accept_queue.lock().await.recv().await)
    }

    async fn close(&self) {
        self.accept_queue.lock().await.close();
    }
}

struct LocalSession {
    outgoing: std::sync::Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    incoming: Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl LocalSession {
    fn new(outgoing: mpsc::UnboundedSender<Frame>, incoming: mpsc::UnboundedReceiver<Frame>) -> LocalSession {
        LocalSession {
            outgoing: std::sync::Mutex::new(Some(outgoing)),
            incoming: Mutex::new(incoming),
        }
    }
}

#[async_trait]
impl TransportSession for LocalSession {
    async fn send(&self, frame: Frame) -> anyhow::Result<()> {
        let outgoing = self.outgoing.lock().unwrap().clone();
        match outgoing {
            Some(sender) => sender.send(frame)
                .map_err(|_| anyhow!("peer closed the session")),
            None => Err(anyhow!("session is closed")),
        }
    }

    async fn recv(&self) -> anyhow::Result<Option<Frame>> {
        Ok(self.incoming.lock().await.recv().await)
    }

    async fn close(&self) {
        // dropping the sender is what the peer observes as EOF
        self.outgoing.lock().unwrap().take();
        self.incoming.lock().await.close();
    }
}
