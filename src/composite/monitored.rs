//! The liveness decorator: ping/pong probing on top of any duplex channel pair.
//!
//! Every payload travels with a one-byte tag so probe traffic and application traffic share
//!  the wrapped channel. The output side sends pings on a fixed interval and declares the
//!  connection dead when nothing has been heard for the receive timeout; the input side
//!  answers pings immediately and sweeps out receivers whose pings stopped coming.

use crate::channel::{DuplexInputChannel, DuplexOutputChannel, InputChannelEvent, OutputChannelEvent};
use crate::config::MonitorConfig;
use crate::dispatcher::Dispatcher;
use crate::events::{handler, HandlerRegistry};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

fn tagged(tag: u8, payload: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(tag);
    buf.put_slice(payload);
    buf.freeze()
}

struct MonitoredOutputShared {
    inner: Arc<dyn DuplexOutputChannel>,
    config: Arc<MonitorConfig>,
    events: HandlerRegistry<OutputChannelEvent>,
    /// any frame from the remote side counts as a liveness signal
    last_heard: Mutex<Instant>,
    alive: AtomicBool,
}

impl MonitoredOutputShared {
    /// alive -> dead transition; whoever wins it fires the single `Disconnected`
    async fn declare_dead(self: &Arc<Self>, reason: &str) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!("connection {:?} is dead ({}) - closing", self.inner.response_receiver_id(), reason);
            self.inner.close().await;
            self.events.dispatch(OutputChannelEvent::Disconnected).await;
        }
    }

    async fn ping_loop(self: Arc<Self>) {
        let mut ticks = tokio::time::interval(self.config.ping_interval);
        loop {
            ticks.tick().await;
            if !self.alive.load(Ordering::SeqCst) {
                return;
            }

            let silent_for = self.last_heard.lock().unwrap().elapsed();
            if silent_for > self.config.receive_timeout {
                self.declare_dead("receive timeout elapsed").await;
                return;
            }

            let ping = Bytes::copy_from_slice(&[self.config.ping_tag]);
            if let Err(e) = self.inner.send(ping).await {
                debug!("ping for {:?} failed: {}", self.inner.response_receiver_id(), e);
                self.declare_dead("ping could not be sent").await;
                return;
            }
        }
    }

    async fn on_response(self: Arc<Self>, payload: Bytes) {
        *self.last_heard.lock().unwrap() = Instant::now();

        match payload.first() {
            Some(&tag) if tag == self.config.pong_tag => {
                trace!("pong on {:?}", self.inner.response_receiver_id());
            }
            Some(&tag) if tag == self.config.data_tag => {
                self.events.dispatch(OutputChannelEvent::ResponseReceived(payload.slice(1..))).await;
            }
            tag => {
                warn!("response with unexpected liveness tag {:?} on {:?} - ignoring",
                    tag, self.inner.response_receiver_id());
            }
        }
    }
}

/// [DuplexOutputChannel] decorator: detects a silently dead connection and surfaces it as
///  a regular `Disconnected`.
pub struct MonitoredOutputChannel {
    shared: Arc<MonitoredOutputShared>,
    ping_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MonitoredOutputChannel {
    pub fn new(
        inner: Arc<dyn DuplexOutputChannel>,
        config: MonitorConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> anyhow::Result<MonitoredOutputChannel> {
        config.validate()?;

        let shared = Arc::new(MonitoredOutputShared {
            inner: inner.clone(),
            config: Arc::new(config),
            events: HandlerRegistry::new(dispatcher),
            last_heard: Mutex::new(Instant::now()),
            alive: AtomicBool::new(false),
        });

        let weak = shared.clone();
        inner.events().add(handler(move |event: OutputChannelEvent| {
            let shared = weak.clone();
            async move {
                match event {
                    OutputChannelEvent::ResponseReceived(payload) => shared.on_response(payload).await,
                    OutputChannelEvent::Disconnected => {
                        if shared.alive.swap(false, Ordering::SeqCst) {
                            shared.events.dispatch(OutputChannelEvent::Disconnected).await;
                        }
                    }
                    other => shared.events.dispatch(other).await,
                }
            }
        }));

        Ok(MonitoredOutputChannel { shared, ping_task: tokio::sync::Mutex::new(None) })
    }
}

#[async_trait]
impl DuplexOutputChannel for MonitoredOutputChannel {
    fn response_receiver_id(&self) -> &str {
        self.shared.inner.response_receiver_id()
    }

    fn events(&self) -> &HandlerRegistry<OutputChannelEvent> {
        &self.shared.events
    }

    fn is_open(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst) && self.shared.inner.is_open()
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.shared.inner.connect().await?;
        *self.shared.last_heard.lock().unwrap() = Instant::now();
        self.shared.alive.store(true, Ordering::SeqCst);

        let mut task = self.ping_task.lock().await;
        if let Some(old) = task.take() {
            old.abort();
        }
        *task = Some(tokio::spawn(self.shared.clone().ping_loop()));
        Ok(())
    }

    async fn close(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.ping_task.lock().await.take() {
            task.abort();
        }
        self.shared.inner.close().await;
    }

    async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        self.shared.inner.send(tagged(self.shared.config.data_tag, &payload)).await
    }
}

struct MonitoredInputShared {
    inner: Arc<dyn DuplexInputChannel>,
    config: Arc<MonitorConfig>,
    events: HandlerRegistry<InputChannelEvent>,
    last_heard: Mutex<FxHashMap<String, Instant>>,
}

impl MonitoredInputShared {
    async fn on_message(self: Arc<Self>, response_receiver_id: String, payload: Bytes) {
        self.last_heard.lock().unwrap().insert(response_receiver_id.clone(), Instant::now());

        match payload.first() {
            Some(&tag) if tag == self.config.ping_tag => {
                trace!("ping from {:?}", response_receiver_id);
                let pong = Bytes::copy_from_slice(&[self.config.pong_tag]);
                if let Err(e) = self.inner.send_response(&response_receiver_id, pong).await {
                    debug!("pong to {:?} failed: {}", response_receiver_id, e);
                }
            }
            Some(&tag) if tag == self.config.data_tag => {
                self.events.dispatch(InputChannelEvent::MessageReceived {
                    response_receiver_id,
                    payload: payload.slice(1..),
                }).await;
            }
            tag => {
                warn!("message with unexpected liveness tag {:?} from {:?} - ignoring",
                    tag, response_receiver_id);
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticks = tokio::time::interval(self.config.ping_interval);
        loop {
            ticks.tick().await;

            let timed_out: Vec<String> = self.last_heard.lock().unwrap().iter()
                .filter(|(_, last)| last.elapsed() > self.config.receive_timeout)
                .map(|(id, _)| id.clone())
                .collect();

            for id in timed_out {
                warn!("receiver {:?} stopped pinging - disconnecting", id);
                self.inner.disconnect_receiver(&id).await;
            }
        }
    }
}

/// [DuplexInputChannel] decorator: answers pings and disconnects receivers that went silent.
pub struct MonitoredInputChannel {
    shared: Arc<MonitoredInputShared>,
    sweep_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MonitoredInputChannel {
    pub fn new(
        inner: Arc<dyn DuplexInputChannel>,
        config: MonitorConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> anyhow::Result<MonitoredInputChannel> {
        config.validate()?;

        let shared = Arc::new(MonitoredInputShared {
            inner: inner.clone(),
            config: Arc::new(config),
            events: HandlerRegistry::new(dispatcher),
            last_heard: Mutex::new(FxHashMap::default()),
        });

        let weak = shared.clone();
        inner.events().add(handler(move |event: InputChannelEvent| {
            let shared = weak.clone();
            async move {
                match event {
                    InputChannelEvent::MessageReceived { response_receiver_id, payload } => {
                        shared.on_message(response_receiver_id, payload).await;
                    }
                    InputChannelEvent::Opened { response_receiver_id, sender_address } => {
                        shared.last_heard.lock().unwrap()
                            .insert(response_receiver_id.clone(), Instant::now());
                        shared.events.dispatch(InputChannelEvent::Opened {
                            response_receiver_id, sender_address,
                        }).await;
                    }
                    InputChannelEvent::Closed { response_receiver_id } => {
                        shared.last_heard.lock().unwrap().remove(&response_receiver_id);
                        shared.events.dispatch(InputChannelEvent::Closed { response_receiver_id }).await;
                    }
                }
            }
        }));

        Ok(MonitoredInputChannel { shared, sweep_task: tokio::sync::Mutex::new(None) })
    }
}

#[async_trait]
impl DuplexInputChannel for MonitoredInputChannel {
    fn address(&self) -> &str {
        self.shared.inner.address()
    }

    fn events(&self) -> &HandlerRegistry<InputChannelEvent> {
        &self.shared.events
    }

    async fn start_listening(&self) -> anyhow::Result<()> {
        self.shared.inner.start_listening().await?;
        let mut task = self.sweep_task.lock().await;
        if let Some(old) = task.take() {
            old.abort();
        }
        *task = Some(tokio::spawn(self.shared.clone().sweep_loop()));
        Ok(())
    }

    async fn stop_listening(&self) {
        if let Some(task) = self.sweep_task.lock().await.take() {
            task.abort();
        }
        self.shared.last_heard.lock().unwrap().clear();
        self.shared.inner.stop_listening().await;
    }

    async fn send_response(&self, response_receiver_id: &str, payload: Bytes) -> anyhow::Result<()> {
        self.shared.inner
            .send_response(response_receiver_id, tagged(self.shared.config.data_tag, &payload))
            .await
    }

    async fn disconnect_receiver(&self, response_receiver_id: &str) {
        self.shared.last_heard.lock().unwrap().remove(response_receiver_id);
        self.shared.inner.disconnect_receiver(response_receiver_id).await;
    }
}
