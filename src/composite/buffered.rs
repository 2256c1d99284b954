//! The buffered reliability decorator: bounded-time buffering plus automatic reconnection.
//!
//! The guarantee is at-most-once, best-effort and bounded in time: messages are flushed in
//!  enqueue order after a reconnect, a message older than the offline budget is dropped with a
//!  `DeliveryFailed` notification instead of being sent, and if reconnection itself does not
//!  succeed within the budget the whole connection surfaces as closed.

use crate::channel::{DuplexInputChannel, DuplexOutputChannel, InputChannelEvent, OutputChannelEvent};
use crate::config::BufferConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{channel_error, ChannelError};
use crate::events::{handler, HandlerRegistry};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

struct Pending {
    payload: Bytes,
    enqueued_at: Instant,
}

struct OutputState {
    queue: VecDeque<Pending>,
    /// set when the first message is queued (or the inner channel drops), cleared when the
    ///  queue is fully flushed; the give-up budget is measured from here
    offline_since: Option<Instant>,
    reconnect_task: Option<JoinHandle<()>>,
    /// true after a give-up or an application close; only an explicit `connect()` resets it
    terminated: bool,
}

struct BufferedOutputShared {
    inner: Arc<dyn DuplexOutputChannel>,
    config: Arc<BufferConfig>,
    events: HandlerRegistry<OutputChannelEvent>,
    state: Mutex<OutputState>,
    /// what `is_open()` reports; cleared on close and on give-up so stacked decorators
    ///  see the terminal disconnect
    open_requested: AtomicBool,
}

impl BufferedOutputShared {
    fn ensure_reconnect_task(self: &Arc<Self>, state: &mut OutputState) {
        if state.terminated || state.reconnect_task.is_some() {
            return;
        }
        state.offline_since.get_or_insert_with(Instant::now);
        state.reconnect_task = Some(tokio::spawn(self.clone().reconnect_loop()));
    }

    async fn on_inner_disconnected(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.terminated {
            return;
        }
        debug!("connection {:?} dropped - buffering until it is back", self.inner.response_receiver_id());
        state.offline_since.get_or_insert_with(Instant::now);
        self.ensure_reconnect_task(&mut state);
    }

    /// pops everything older than the offline budget off the front of the queue
    fn take_expired(&self, state: &mut OutputState) -> Vec<Bytes> {
        let mut expired = Vec::new();
        while let Some(front) = state.queue.front() {
            if front.enqueued_at.elapsed() > self.config.max_offline_time {
                expired.push(state.queue.pop_front().unwrap().payload);
            } else {
                break;
            }
        }
        expired
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.reconnect_interval).await;

            let expired = {
                let mut state = self.state.lock().await;
                self.take_expired(&mut state)
            };
            for payload in expired {
                warn!("dropping message for {:?} - older than the offline budget", self.inner.response_receiver_id());
                self.events.dispatch(OutputChannelEvent::DeliveryFailed(payload)).await;
            }

            let give_up = {
                let state = self.state.lock().await;
                match state.offline_since {
                    Some(since) => since.elapsed() > self.config.max_offline_time,
                    None => false,
                }
            };
            if give_up {
                self.give_up().await;
                return;
            }

            if !self.inner.is_open() {
                if let Err(e) = self.inner.connect().await {
                    trace!("reconnect attempt for {:?} failed: {}", self.inner.response_receiver_id(), e);
                    continue;
                }
                let queued = self.state.lock().await.queue.len();
                info!("connection {:?} re-established, flushing {} buffered messages",
                    self.inner.response_receiver_id(), queued);
            }

            if self.flush().await {
                return;
            }
        }
    }

    /// flushes the queue strictly in order; true means everything is out and the loop may end
    async fn flush(self: &Arc<Self>) -> bool {
        loop {
            let (expired, next) = {
                let mut state = self.state.lock().await;
                let expired = self.take_expired(&mut state);
                let next = state.queue.front().map(|p| p.payload.clone());
                if next.is_none() && expired.is_empty() {
                    // fully flushed - back to plain forwarding
                    state.offline_since = None;
                    state.reconnect_task = None;
                    return true;
                }
                (expired, next)
            };

            for payload in expired {
                warn!("dropping message for {:?} - older than the offline budget", self.inner.response_receiver_id());
                self.events.dispatch(OutputChannelEvent::DeliveryFailed(payload)).await;
            }

            let Some(payload) = next else {
                continue;
            };
            match self.inner.send(payload).await {
                Ok(()) => {
                    self.state.lock().await.queue.pop_front();
                }
                Err(e) => {
                    debug!("flush for {:?} failed, treating the connection as dropped again: {}",
                        self.inner.response_receiver_id(), e);
                    return false;
                }
            }
        }
    }

    async fn give_up(self: &Arc<Self>) {
        let drained: Vec<Pending> = {
            let mut state = self.state.lock().await;
            state.terminated = true;
            state.offline_since = None;
            state.reconnect_task = None;
            state.queue.drain(..).collect()
        };

        self.open_requested.store(false, Ordering::SeqCst);
        warn!("reconnection for {:?} did not succeed within the offline budget - giving up, dropping {} messages",
            self.inner.response_receiver_id(), drained.len());
        for pending in drained {
            self.events.dispatch(OutputChannelEvent::DeliveryFailed(pending.payload)).await;
        }
        self.inner.close().await;
        self.events.dispatch(OutputChannelEvent::Disconnected).await;
    }
}

/// [DuplexOutputChannel] decorator: forwards while the wrapped channel is open, buffers and
///  reconnects while it is not.
pub struct BufferedOutputChannel {
    shared: Arc<BufferedOutputShared>,
}

impl BufferedOutputChannel {
    pub fn new(
        inner: Arc<dyn DuplexOutputChannel>,
        config: BufferConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> anyhow::Result<BufferedOutputChannel> {
        config.validate()?;

        let shared = Arc::new(BufferedOutputShared {
            inner: inner.clone(),
            config: Arc::new(config),
            events: HandlerRegistry::new(dispatcher),
            state: Mutex::new(OutputState {
                queue: VecDeque::new(),
                offline_since: None,
                reconnect_task: None,
                terminated: false,
            }),
            open_requested: AtomicBool::new(false),
        });

        let weak = shared.clone();
        inner.events().add(handler(move |event: OutputChannelEvent| {
            let shared = weak.clone();
            async move {
                match event {
                    OutputChannelEvent::Disconnected => shared.on_inner_disconnected().await,
                    other => shared.events.dispatch(other).await,
                }
            }
        }));

        Ok(BufferedOutputChannel { shared })
    }

    /// test-only observation: number of currently buffered messages
    pub async fn buffered_message_count(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }
}

#[async_trait]
impl DuplexOutputChannel for BufferedOutputChannel {
    fn response_receiver_id(&self) -> &str {
        self.shared.inner.response_receiver_id()
    }

    fn events(&self) -> &HandlerRegistry<OutputChannelEvent> {
        &self.shared.events
    }

    fn is_open(&self) -> bool {
        self.shared.open_requested.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> anyhow::Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            state.terminated = false;
        }
        self.shared.inner.connect().await?;
        self.shared.open_requested.store(true, Ordering::SeqCst);

        let mut state = self.shared.state.lock().await;
        if !state.queue.is_empty() {
            self.shared.ensure_reconnect_task(&mut state);
        }
        Ok(())
    }

    async fn close(&self) {
        self.shared.open_requested.store(false, Ordering::SeqCst);
        let (task, drained) = {
            let mut state = self.shared.state.lock().await;
            state.terminated = true;
            state.offline_since = None;
            (state.reconnect_task.take(), state.queue.drain(..).collect::<Vec<_>>())
        };
        if let Some(task) = task {
            task.abort();
        }
        // queued messages are never silently retained past a close
        for pending in drained {
            self.shared.events.dispatch(OutputChannelEvent::DeliveryFailed(pending.payload)).await;
        }
        self.shared.inner.close().await;
    }

    async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.terminated {
            return Err(ChannelError::NotConnected.into());
        }

        if state.queue.is_empty() && state.offline_since.is_none() && self.shared.inner.is_open() {
            match self.shared.inner.send(payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if channel_error(&e) == Some(&ChannelError::NotConnected) => {
                    trace!("inner channel reports not connected - buffering");
                }
                Err(e) => {
                    debug!("send on {:?} failed - buffering: {}", self.response_receiver_id(), e);
                }
            }
        }

        state.queue.push_back(Pending { payload, enqueued_at: Instant::now() });
        self.shared.ensure_reconnect_task(&mut state);
        Ok(())
    }
}

struct OfflineReceiver {
    queued: VecDeque<Pending>,
    expire_task: JoinHandle<()>,
}

struct BufferedInputShared {
    inner: Arc<dyn DuplexInputChannel>,
    config: Arc<BufferConfig>,
    events: HandlerRegistry<InputChannelEvent>,
    offline: Mutex<FxHashMap<String, OfflineReceiver>>,
}

impl BufferedInputShared {
    async fn on_inner_opened(self: Arc<Self>, response_receiver_id: String, sender_address: String) {
        let mut offline = self.offline.lock().await;
        let Some(entry) = offline.remove(&response_receiver_id) else {
            drop(offline);
            self.events.dispatch(InputChannelEvent::Opened { response_receiver_id, sender_address }).await;
            return;
        };

        // the receiver is back within its offline window: flush, and surface neither the
        //  Closed nor the repeated Opened
        entry.expire_task.abort();
        debug!("receiver {:?} reconnected, flushing {} buffered responses",
            response_receiver_id, entry.queued.len());

        let mut remaining = entry.queued;
        while let Some(pending) = remaining.pop_front() {
            if pending.enqueued_at.elapsed() > self.config.max_offline_time {
                warn!("dropping buffered response for {:?} - older than the offline budget", response_receiver_id);
                continue;
            }
            if let Err(e) = self.inner.send_response(&response_receiver_id, pending.payload.clone()).await {
                debug!("flush to {:?} failed - keeping the rest buffered: {}", response_receiver_id, e);
                remaining.push_front(pending);
                let expire_task = self.clone().spawn_expire_task(response_receiver_id.clone());
                offline.insert(response_receiver_id, OfflineReceiver { queued: remaining, expire_task });
                return;
            }
        }
    }

    async fn on_inner_closed(self: Arc<Self>, response_receiver_id: String) {
        let mut offline = self.offline.lock().await;
        if offline.contains_key(&response_receiver_id) {
            return;
        }
        trace!("receiver {:?} disconnected, withholding the notification for {:?}",
            response_receiver_id, self.config.max_offline_time);
        let expire_task = self.clone().spawn_expire_task(response_receiver_id.clone());
        offline.insert(response_receiver_id, OfflineReceiver { queued: VecDeque::new(), expire_task });
    }

    fn spawn_expire_task(self: Arc<Self>, response_receiver_id: String) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(self.config.max_offline_time).await;
            let removed = self.offline.lock().await.remove(&response_receiver_id);
            if let Some(entry) = removed {
                if !entry.queued.is_empty() {
                    warn!("receiver {:?} did not come back - dropping {} buffered responses",
                        response_receiver_id, entry.queued.len());
                }
                self.events.dispatch(InputChannelEvent::Closed { response_receiver_id }).await;
            }
        })
    }
}

/// [DuplexInputChannel] decorator: buffers responses across a client's transport reconnects.
///
/// Relies on the response receiver id being stable across reconnects: a `Closed` from the
///  wrapped channel is withheld for the offline budget, and if the same id reopens in time the
///  outage is invisible to the application.
pub struct BufferedInputChannel {
    shared: Arc<BufferedInputShared>,
}

impl BufferedInputChannel {
    pub fn new(
        inner: Arc<dyn DuplexInputChannel>,
        config: BufferConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> anyhow::Result<BufferedInputChannel> {
        config.validate()?;

        let shared = Arc::new(BufferedInputShared {
            inner: inner.clone(),
            config: Arc::new(config),
            events: HandlerRegistry::new(dispatcher),
            offline: Mutex::new(FxHashMap::default()),
        });

        let weak = shared.clone();
        inner.events().add(handler(move |event: InputChannelEvent| {
            let shared = weak.clone();
            async move {
                match event {
                    InputChannelEvent::Opened { response_receiver_id, sender_address } => {
                        shared.on_inner_opened(response_receiver_id, sender_address).await;
                    }
                    InputChannelEvent::Closed { response_receiver_id } => {
                        shared.on_inner_closed(response_receiver_id).await;
                    }
                    other => shared.events.dispatch(other).await,
                }
            }
        }));

        Ok(BufferedInputChannel { shared })
    }
}

#[async_trait]
impl DuplexInputChannel for BufferedInputChannel {
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
        let drained: Vec<(String, OfflineReceiver)> = self.shared.offline.lock().await.drain().collect();
        for (id, entry) in drained {
            entry.expire_task.abort();
            if !entry.queued.is_empty() {
                debug!("dropping {} buffered responses for {:?} on stop", entry.queued.len(), id);
            }
        }
        self.shared.inner.stop_listening().await;
    }

    async fn send_response(&self, response_receiver_id: &str, payload: Bytes) -> anyhow::Result<()> {
        {
            let mut offline = self.shared.offline.lock().await;
            if let Some(entry) = offline.get_mut(response_receiver_id) {
                entry.queued.push_back(Pending { payload, enqueued_at: Instant::now() });
                return Ok(());
            }
        }

        match self.shared.inner.send_response(response_receiver_id, payload.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(channel_error(&e), Some(ChannelError::UnknownReceiver(_))) => Err(e),
            Err(e) => {
                // the connection is open but the write failed: the transport drop is about to
                //  surface as Closed - start buffering right away
                debug!("response to {:?} failed - buffering: {}", response_receiver_id, e);
                let mut offline = self.shared.offline.lock().await;
                let entry = offline.entry(response_receiver_id.to_string()).or_insert_with(|| OfflineReceiver {
                    queued: VecDeque::new(),
                    expire_task: self.shared.clone().spawn_expire_task(response_receiver_id.to_string()),
                });
                entry.queued.push_back(Pending { payload, enqueued_at: Instant::now() });
                Ok(())
            }
        }
    }

    async fn disconnect_receiver(&self, response_receiver_id: &str) {
        if let Some(entry) = self.shared.offline.lock().await.remove(response_receiver_id) {
            entry.expire_task.abort();
            self.shared.events.dispatch(InputChannelEvent::Closed {
                response_receiver_id: response_receiver_id.to_string(),
            }).await;
            return;
        }
        self.shared.inner.disconnect_receiver(response_receiver_id).await;
    }
}
