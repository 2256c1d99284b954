//! The authentication decorator: a challenge/response handshake before a connection is
//!  surfaced to the application.
//!
//! The mechanism is pluggable and the decorator only orchestrates it: the service produces an
//!  opaque challenge per connection, the client answers it, and the service validates the
//!  answer. Until validation succeeds the service side does not fire `Opened`, does not
//!  deliver messages and refuses `send_response` for the connection.

use crate::channel::{DuplexInputChannel, DuplexOutputChannel, InputChannelEvent, OutputChannelEvent};
use crate::config::HandshakeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ChannelError;
use crate::events::{handler, HandlerRegistry};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// produces the challenge for a freshly opened connection, keyed by its response receiver id
pub type ChallengeFn = Arc<dyn Fn(&str) -> Bytes + Send + Sync>;
/// computes the client's answer to a challenge
pub type RespondFn = Arc<dyn Fn(&Bytes) -> Bytes + Send + Sync>;
/// decides whether an answer proves the connection; arguments are the response receiver id,
///  the challenge that was issued and the answer that came back
pub type ValidateFn = Arc<dyn Fn(&str, &Bytes, &Bytes) -> bool + Send + Sync>;

enum ClientPhase {
    Idle,
    /// `connect()` is waiting for the service's challenge
    AwaitingChallenge(Option<oneshot::Sender<Bytes>>),
    Open,
}

struct AuthenticatedOutputShared {
    inner: Arc<dyn DuplexOutputChannel>,
    events: HandlerRegistry<OutputChannelEvent>,
    phase: Mutex<ClientPhase>,
}

/// [DuplexOutputChannel] decorator: runs the client side of the handshake inside `connect()`.
pub struct AuthenticatedOutputChannel {
    shared: Arc<AuthenticatedOutputShared>,
    respond: RespondFn,
    config: HandshakeConfig,
}

impl AuthenticatedOutputChannel {
    pub fn new(
        inner: Arc<dyn DuplexOutputChannel>,
        respond: RespondFn,
        config: HandshakeConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> anyhow::Result<AuthenticatedOutputChannel> {
        config.validate()?;

        let shared = Arc::new(AuthenticatedOutputShared {
            inner: inner.clone(),
            events: HandlerRegistry::new(dispatcher),
            phase: Mutex::new(ClientPhase::Idle),
        });

        let weak = shared.clone();
        inner.events().add(handler(move |event: OutputChannelEvent| {
            let shared = weak.clone();
            async move {
                match event {
                    OutputChannelEvent::ResponseReceived(payload) => {
                        let challenge_waiter = {
                            let mut phase = shared.phase.lock().unwrap();
                            match &mut *phase {
                                ClientPhase::AwaitingChallenge(tx) => tx.take(),
                                _ => None,
                            }
                        };
                        match challenge_waiter {
                            Some(tx) => {
                                let _ = tx.send(payload);
                            }
                            None => shared.events.dispatch(OutputChannelEvent::ResponseReceived(payload)).await,
                        }
                    }
                    OutputChannelEvent::Disconnected => {
                        // mid-handshake the failure surfaces through connect(), not as an event
                        let was_open = {
                            let mut phase = shared.phase.lock().unwrap();
                            matches!(std::mem::replace(&mut *phase, ClientPhase::Idle), ClientPhase::Open)
                        };
                        if was_open {
                            shared.events.dispatch(OutputChannelEvent::Disconnected).await;
                        }
                    }
                    other => shared.events.dispatch(other).await,
                }
            }
        }));

        Ok(AuthenticatedOutputChannel { shared, respond, config })
    }
}

#[async_trait]
impl DuplexOutputChannel for AuthenticatedOutputChannel {
    fn response_receiver_id(&self) -> &str {
        self.shared.inner.response_receiver_id()
    }

    fn events(&self) -> &HandlerRegistry<OutputChannelEvent> {
        &self.shared.events
    }

    fn is_open(&self) -> bool {
        matches!(*self.shared.phase.lock().unwrap(), ClientPhase::Open) && self.shared.inner.is_open()
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        *self.shared.phase.lock().unwrap() = ClientPhase::AwaitingChallenge(Some(tx));

        if let Err(e) = self.shared.inner.connect().await {
            *self.shared.phase.lock().unwrap() = ClientPhase::Idle;
            return Err(e);
        }

        trace!("waiting for the challenge on {:?}", self.response_receiver_id());
        let challenge = match tokio::time::timeout(self.config.handshake_timeout, rx).await {
            Ok(Ok(challenge)) => challenge,
            Ok(Err(_)) | Err(_) => {
                *self.shared.phase.lock().unwrap() = ClientPhase::Idle;
                self.shared.inner.close().await;
                return Err(ChannelError::ConnectFailed(
                    format!("{:?}: no challenge within the handshake timeout", self.response_receiver_id()),
                ).into());
            }
        };

        let answer = (self.respond)(&challenge);
        if let Err(e) = self.shared.inner.send(answer).await {
            *self.shared.phase.lock().unwrap() = ClientPhase::Idle;
            self.shared.inner.close().await;
            return Err(e.context(ChannelError::ConnectFailed("handshake answer undeliverable".to_string())));
        }

        *self.shared.phase.lock().unwrap() = ClientPhase::Open;
        Ok(())
    }

    async fn close(&self) {
        *self.shared.phase.lock().unwrap() = ClientPhase::Idle;
        self.shared.inner.close().await;
    }

    async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        if !matches!(*self.shared.phase.lock().unwrap(), ClientPhase::Open) {
            return Err(ChannelError::NotConnected.into());
        }
        self.shared.inner.send(payload).await
    }
}

enum ServicePhase {
    /// challenge sent, answer outstanding; the task tears the connection down if the answer
    ///  never comes
    Pending {
        challenge: Bytes,
        sender_address: String,
        timeout_task: JoinHandle<()>,
    },
    Trusted,
}

struct AuthenticatedInputShared {
    inner: Arc<dyn DuplexInputChannel>,
    challenge: ChallengeFn,
    validate: ValidateFn,
    config: Arc<HandshakeConfig>,
    events: HandlerRegistry<InputChannelEvent>,
    connections: Mutex<FxHashMap<String, ServicePhase>>,
}

impl AuthenticatedInputShared {
    async fn on_inner_opened(self: Arc<Self>, response_receiver_id: String, sender_address: String) {
        let challenge = (self.challenge)(&response_receiver_id);

        {
            let timeout_task = self.clone().spawn_handshake_timeout(response_receiver_id.clone());
            self.connections.lock().unwrap().insert(
                response_receiver_id.clone(),
                ServicePhase::Pending { challenge: challenge.clone(), sender_address, timeout_task },
            );
        }

        trace!("sending challenge to {:?}", response_receiver_id);
        if let Err(e) = self.inner.send_response(&response_receiver_id, challenge).await {
            debug!("challenge to {:?} undeliverable - disconnecting: {}", response_receiver_id, e);
            self.drop_connection(&response_receiver_id).await;
        }
    }

    async fn on_inner_message(self: Arc<Self>, response_receiver_id: String, payload: Bytes) {
        enum Verdict {
            Forward,
            Accepted(String),
            Rejected,
            Unknown,
        }

        let verdict = {
            let mut connections = self.connections.lock().unwrap();
            match connections.remove(&response_receiver_id) {
                Some(ServicePhase::Trusted) => {
                    connections.insert(response_receiver_id.clone(), ServicePhase::Trusted);
                    Verdict::Forward
                }
                Some(ServicePhase::Pending { challenge, sender_address, timeout_task }) => {
                    timeout_task.abort();
                    if (self.validate)(&response_receiver_id, &challenge, &payload) {
                        connections.insert(response_receiver_id.clone(), ServicePhase::Trusted);
                        Verdict::Accepted(sender_address)
                    } else {
                        Verdict::Rejected
                    }
                }
                None => Verdict::Unknown,
            }
        };

        match verdict {
            Verdict::Forward => {
                self.events.dispatch(InputChannelEvent::MessageReceived { response_receiver_id, payload }).await;
            }
            Verdict::Accepted(sender_address) => {
                info!("connection {:?} authenticated", response_receiver_id);
                self.events.dispatch(InputChannelEvent::Opened { response_receiver_id, sender_address }).await;
            }
            Verdict::Rejected => {
                warn!("authentication of {:?} failed - disconnecting", response_receiver_id);
                self.inner.disconnect_receiver(&response_receiver_id).await;
            }
            Verdict::Unknown => {
                debug!("message from untracked receiver {:?} - ignoring", response_receiver_id);
            }
        }
    }

    async fn on_inner_closed(self: Arc<Self>, response_receiver_id: String) {
        let was_trusted = match self.connections.lock().unwrap().remove(&response_receiver_id) {
            Some(ServicePhase::Trusted) => true,
            Some(ServicePhase::Pending { timeout_task, .. }) => {
                timeout_task.abort();
                false
            }
            None => false,
        };
        // a connection that never authenticated also never opened, so it does not close
        if was_trusted {
            self.events.dispatch(InputChannelEvent::Closed { response_receiver_id }).await;
        }
    }

    fn spawn_handshake_timeout(self: Arc<Self>, response_receiver_id: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(self.config.handshake_timeout).await;
            let still_pending = matches!(
                self.connections.lock().unwrap().get(&response_receiver_id),
                Some(ServicePhase::Pending { .. })
            );
            if still_pending {
                warn!("no handshake answer from {:?} - disconnecting", response_receiver_id);
                self.drop_connection(&response_receiver_id).await;
            }
        })
    }

    async fn drop_connection(&self, response_receiver_id: &str) {
        if let Some(ServicePhase::Pending { timeout_task, .. }) =
            self.connections.lock().unwrap().remove(response_receiver_id)
        {
            timeout_task.abort();
        }
        self.inner.disconnect_receiver(response_receiver_id).await;
    }
}

/// [DuplexInputChannel] decorator: runs the service side of the handshake and hides every
///  connection that has not proven itself.
pub struct AuthenticatedInputChannel {
    shared: Arc<AuthenticatedInputShared>,
}

impl AuthenticatedInputChannel {
    pub fn new(
        inner: Arc<dyn DuplexInputChannel>,
        challenge: ChallengeFn,
        validate: ValidateFn,
        config: HandshakeConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> anyhow::Result<AuthenticatedInputChannel> {
        config.validate()?;

        let shared = Arc::new(AuthenticatedInputShared {
            inner: inner.clone(),
            challenge,
            validate,
            config: Arc::new(config),
            events: HandlerRegistry::new(dispatcher),
            connections: Mutex::new(FxHashMap::default()),
        });

        let weak = shared.clone();
        inner.events().add(handler(move |event: InputChannelEvent| {
            let shared = weak.clone();
            async move {
                match event {
                    InputChannelEvent::Opened { response_receiver_id, sender_address } => {
                        shared.on_inner_opened(response_receiver_id, sender_address).await;
                    }
                    InputChannelEvent::MessageReceived { response_receiver_id, payload } => {
                        shared.on_inner_message(response_receiver_id, payload).await;
                    }
                    InputChannelEvent::Closed { response_receiver_id } => {
                        shared.on_inner_closed(response_receiver_id).await;
                    }
                }
            }
        }));

        Ok(AuthenticatedInputChannel { shared })
    }
}

#[async_trait]
impl DuplexInputChannel for AuthenticatedInputChannel {
    fn address(&self) -> &str {
        self.shared.inner.address()
    }

    fn events(&self) -> &HandlerRegistry<InputChannelEvent> {
        &self.shared.events
    }

    async fn start_listening(&self) -> anyhow::Result<()> {
        self.shared.inner.start_listening().await
    }

    async fn stop_listening(&self) {
        let drained: Vec<ServicePhase> = {
            let mut connections = self.shared.connections.lock().unwrap();
            connections.drain().map(|(_, phase)| phase).collect()
        };
        for phase in drained {
            if let ServicePhase::Pending { timeout_task, .. } = phase {
                timeout_task.abort();
            }
        }
        self.shared.inner.stop_listening().await;
    }

    async fn send_response(&self, response_receiver_id: &str, payload: Bytes) -> anyhow::Result<()> {
        let trusted = matches!(
            self.shared.connections.lock().unwrap().get(response_receiver_id),
            Some(ServicePhase::Trusted)
        );
        if !trusted {
            return Err(ChannelError::UnknownReceiver(response_receiver_id.to_string()).into());
        }
        self.shared.inner.send_response(response_receiver_id, payload).await
    }

    async fn disconnect_receiver(&self, response_receiver_id: &str) {
        self.shared.drop_connection(response_receiver_id).await;
    }
}
