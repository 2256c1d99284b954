use crate::channel::{DuplexOutputChannel, OutputChannelEvent};
use crate::config::ChannelConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ChannelError;
use crate::events::HandlerRegistry;
use crate::protocol::{MessageKind, ProtocolFormatter, ProtocolMessage};
use crate::transport::{Transport, TransportSession};
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

enum ConnState {
    Detached,
    Open {
        session: Arc<dyn TransportSession>,
        recv_task: JoinHandle<()>,
    },
    Closed,
}

struct OutputShared {
    response_receiver_id: String,
    formatter: Arc<dyn ProtocolFormatter>,
    events: HandlerRegistry<OutputChannelEvent>,
    state: Mutex<ConnState>,
    is_open: AtomicBool,
}

impl OutputShared {
    /// transitions open -> closed if the connection ended remotely; the caller fires the
    ///  `Disconnected` notification iff this returns true, which keeps it exactly-once
    async fn mark_remotely_closed(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            ConnState::Open { .. } => {
                *state = ConnState::Closed;
                self.is_open.store(false, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    async fn recv_loop(self: Arc<Self>, session: Arc<dyn TransportSession>) {
        loop {
            match session.recv().await {
                Ok(Some(frame)) => match self.formatter.decode(frame) {
                    Ok(message) => {
                        if !self.on_message(message).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("undecodable frame on {:?} - closing the connection: {}",
                            self.response_receiver_id, e);
                        break;
                    }
                },
                Ok(None) => {
                    debug!("transport disconnected for {:?}", self.response_receiver_id);
                    break;
                }
                Err(e) => {
                    warn!("transport receive failed for {:?}: {}", self.response_receiver_id, e);
                    break;
                }
            }
        }

        session.close().await;
        if self.mark_remotely_closed().await {
            self.events.dispatch(OutputChannelEvent::Disconnected).await;
        }
    }

    /// returns false when the connection should end
    async fn on_message(&self, message: ProtocolMessage) -> bool {
        match message.kind {
            MessageKind::Data => {
                if message.response_receiver_id == self.response_receiver_id {
                    self.events.dispatch(OutputChannelEvent::ResponseReceived(message.payload)).await;
                } else {
                    debug!("response for foreign receiver {:?} - ignoring", message.response_receiver_id);
                }
                true
            }
            MessageKind::CloseConnection => {
                debug!("service closed the connection for {:?}", self.response_receiver_id);
                false
            }
            kind => {
                debug!("unexpected {:?} frame on an output channel - ignoring", kind);
                true
            }
        }
    }
}

/// [DuplexOutputChannel] over a raw [Transport] and a [ProtocolFormatter].
pub struct TransportOutputChannel {
    address: String,
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    shared: Arc<OutputShared>,
}

impl TransportOutputChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        formatter: Arc<dyn ProtocolFormatter>,
        address: &str,
        dispatcher: Arc<dyn Dispatcher>,
        config: ChannelConfig,
    ) -> anyhow::Result<TransportOutputChannel> {
        config.validate()?;

        Ok(TransportOutputChannel {
            address: address.to_string(),
            transport,
            config,
            shared: Arc::new(OutputShared {
                response_receiver_id: format!("{}_{}", address, Uuid::new_v4()),
                formatter,
                events: HandlerRegistry::new(dispatcher),
                state: Mutex::new(ConnState::Detached),
                is_open: AtomicBool::new(false),
            }),
        })
    }
}

#[async_trait]
impl DuplexOutputChannel for TransportOutputChannel {
    fn response_receiver_id(&self) -> &str {
        &self.shared.response_receiver_id
    }

    fn events(&self) -> &HandlerRegistry<OutputChannelEvent> {
        &self.shared.events
    }

    fn is_open(&self) -> bool {
        self.shared.is_open.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().await;
        if let ConnState::Open { .. } = *state {
            bail!("output channel to {:?} is already connected", self.address);
        }

        trace!("connecting to {:?} as {:?}", self.address, self.shared.response_receiver_id);

        let session = tokio::time::timeout(self.config.connect_timeout, self.transport.connect(&self.address))
            .await
            .map_err(|_| ChannelError::ConnectFailed(format!("{:?}: connect timed out", self.address)))?
            .map_err(|e| {
                if crate::error::channel_error(&e).is_some() {
                    e
                } else {
                    e.context(ChannelError::ConnectFailed(self.address.clone()))
                }
            })?;

        let open = self.shared.formatter.encode(&ProtocolMessage::open(&self.shared.response_receiver_id))?;
        if let Err(e) = session.send(open).await {
            session.close().await;
            return Err(e.context(ChannelError::ConnectFailed(self.address.clone())));
        }

        let recv_task = tokio::spawn(self.shared.clone().recv_loop(session.clone()));

        *state = ConnState::Open { session, recv_task };
        self.shared.is_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.shared.state.lock().await;
        if let ConnState::Open { session, recv_task } = std::mem::replace(&mut *state, ConnState::Closed) {
            self.shared.is_open.store(false, Ordering::SeqCst);
            recv_task.abort();

            // best effort: the remote end also detects the transport drop
            match self.shared.formatter.encode(&ProtocolMessage::close(&self.shared.response_receiver_id)) {
                Ok(frame) => {
                    if let Err(e) = session.send(frame).await {
                        debug!("could not deliver close-connection message for {:?}: {}",
                            self.shared.response_receiver_id, e);
                    }
                }
                Err(e) => debug!("could not encode close-connection message: {}", e),
            }
            session.close().await;
        }
    }

    async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        let session = {
            match &*self.shared.state.lock().await {
                ConnState::Open { session, .. } => session.clone(),
                _ => return Err(ChannelError::NotConnected.into()),
            }
        };

        let frame = self.shared.formatter
            .encode(&ProtocolMessage::data(&self.shared.response_receiver_id, payload))?;
        session.send(frame).await
    }
}
