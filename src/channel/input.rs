use crate::channel::{DuplexInputChannel, InputChannelEvent};
use crate::dispatcher::Dispatcher;
use crate::error::ChannelError;
use crate::events::HandlerRegistry;
use crate::protocol::{MessageKind, ProtocolFormatter, ProtocolMessage};
use crate::transport::{Transport, TransportListener, TransportSession};
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// state of one open logical client connection, owned exclusively by the input channel
struct Connection {
    session: Arc<dyn TransportSession>,
    sender_address: String,
}

struct InputShared {
    address: String,
    formatter: Arc<dyn ProtocolFormatter>,
    events: HandlerRegistry<InputChannelEvent>,
    connections: Mutex<FxHashMap<String, Connection>>,
}

impl InputShared {
    async fn register(
        &self,
        response_receiver_id: &str,
        session: Arc<dyn TransportSession>,
        sender_address: &str,
    ) -> anyhow::Result<()> {
        match self.connections.lock().await.entry(response_receiver_id.to_string()) {
            Entry::Occupied(_) => {
                Err(ChannelError::DuplicateConnection(response_receiver_id.to_string()).into())
            }
            Entry::Vacant(e) => {
                e.insert(Connection {
                    session,
                    sender_address: sender_address.to_string(),
                });
                Ok(())
            }
        }
    }

    /// returns true only for the call that actually removed the record, which keeps the
    ///  `Closed` notification exactly-once per open id
    async fn unregister(&self, response_receiver_id: &str) -> bool {
        self.connections.lock().await.remove(response_receiver_id).is_some()
    }

    async fn serve_connection(self: Arc<Self>, session: Arc<dyn TransportSession>, sender_address: String) {
        let mut receiver_id: Option<String> = None;

        loop {
            match session.recv().await {
                Ok(Some(frame)) => match self.formatter.decode(frame) {
                    Ok(message) => {
                        if !self.on_message(&session, &sender_address, &mut receiver_id, message).await {
                            break;
                        }
                    }
                    Err(e) => {
                        // connection-level failure, not message-level
                        warn!("undecodable frame from {:?} - closing the connection: {}", sender_address, e);
                        break;
                    }
                },
                Ok(None) => {
                    trace!("transport disconnect from {:?}", sender_address);
                    break;
                }
                Err(e) => {
                    error!("transport receive failed for {:?}: {}", sender_address, e);
                    break;
                }
            }
        }

        session.close().await;
        if let Some(id) = receiver_id {
            if self.unregister(&id).await {
                self.events.dispatch(InputChannelEvent::Closed { response_receiver_id: id }).await;
            }
        }
    }

    /// returns false when the connection should end
    async fn on_message(
        &self,
        session: &Arc<dyn TransportSession>,
        sender_address: &str,
        receiver_id: &mut Option<String>,
        message: ProtocolMessage,
    ) -> bool {
        match message.kind {
            MessageKind::OpenConnection => {
                if receiver_id.is_some() {
                    debug!("repeated open-connection on one session from {:?} - ignoring", sender_address);
                    return true;
                }
                match self.register(&message.response_receiver_id, session.clone(), sender_address).await {
                    Ok(()) => {
                        info!("connection {:?} opened from {:?}", message.response_receiver_id, sender_address);
                        *receiver_id = Some(message.response_receiver_id.clone());
                        self.events.dispatch(InputChannelEvent::Opened {
                            response_receiver_id: message.response_receiver_id,
                            sender_address: sender_address.to_string(),
                        }).await;
                        true
                    }
                    Err(e) => {
                        // refuse this session; the existing connection is unaffected
                        warn!("refusing connection from {:?}: {}", sender_address, e);
                        false
                    }
                }
            }
            MessageKind::CloseConnection => false,
            MessageKind::Data => {
                match receiver_id {
                    Some(id) => {
                        self.events.dispatch(InputChannelEvent::MessageReceived {
                            response_receiver_id: id.clone(),
                            payload: message.payload,
                        }).await;
                    }
                    None => debug!("data frame before open-connection from {:?} - dropping", sender_address),
                }
                true
            }
            kind => {
                debug!("unexpected {:?} frame on an input channel - ignoring", kind);
                true
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: Box<dyn TransportListener>) {
        info!("listening on {:?}", self.address);
        let mut connection_tasks = JoinSet::new();

        loop {
            while connection_tasks.try_join_next().is_some() {}

            match listener.accept().await {
                Ok(Some((session, sender_address))) => {
                    trace!("accepted transport connection from {:?}", sender_address);
                    connection_tasks.spawn(self.clone().serve_connection(session, sender_address));
                }
                Ok(None) => {
                    info!("listener on {:?} closed", self.address);
                    break;
                }
                Err(e) => {
                    error!("accept failed on {:?}: {}", self.address, e);
                    break;
                }
            }
        }
        // dropping the join set tears down all per-connection loops
    }
}

/// [DuplexInputChannel] over a raw [Transport] and a [ProtocolFormatter].
pub struct TransportInputChannel {
    transport: Arc<dyn Transport>,
    shared: Arc<InputShared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportInputChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        formatter: Arc<dyn ProtocolFormatter>,
        address: &str,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> TransportInputChannel {
        TransportInputChannel {
            transport,
            shared: Arc::new(InputShared {
                address: address.to_string(),
                formatter,
                events: HandlerRegistry::new(dispatcher),
                connections: Mutex::new(FxHashMap::default()),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// test-only observation: ids of all currently open logical connections
    pub async fn open_receiver_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.connections.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl DuplexInputChannel for TransportInputChannel {
    fn address(&self) -> &str {
        &self.shared.address
    }

    fn events(&self) -> &HandlerRegistry<InputChannelEvent> {
        &self.shared.events
    }

    async fn start_listening(&self) -> anyhow::Result<()> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() {
            bail!("input channel on {:?} is already listening", self.shared.address);
        }

        let listener = self.transport.bind(&self.shared.address).await?;
        *accept_task = Some(tokio::spawn(self.shared.clone().accept_loop(listener)));
        Ok(())
    }

    async fn stop_listening(&self) {
        let mut accept_task = self.accept_task.lock().await;
        if let Some(task) = accept_task.take() {
            task.abort();

            let mut connections = self.shared.connections.lock().await;
            for (id, connection) in connections.drain() {
                trace!("dropping connection {:?} on stop", id);
                connection.session.close().await;
            }
        }
    }

    async fn send_response(&self, response_receiver_id: &str, payload: Bytes) -> anyhow::Result<()> {
        let session = self.shared.connections.lock().await
            .get(response_receiver_id)
            .map(|c| c.session.clone())
            .ok_or_else(|| ChannelError::UnknownReceiver(response_receiver_id.to_string()))?;

        let frame = self.shared.formatter
            .encode(&ProtocolMessage::data(response_receiver_id, payload))?;
        session.send(frame).await
    }

    async fn disconnect_receiver(&self, response_receiver_id: &str) {
        let session = self.shared.connections.lock().await
            .get(response_receiver_id)
            .map(|c| c.session.clone());

        if let Some(session) = session {
            debug!("disconnecting receiver {:?}", response_receiver_id);
            match self.shared.formatter.encode(&ProtocolMessage::close(response_receiver_id)) {
                Ok(frame) => {
                    if let Err(e) = session.send(frame).await {
                        debug!("could not deliver close-connection message to {:?}: {}", response_receiver_id, e);
                    }
                }
                Err(e) => debug!("could not encode close-connection message: {}", e),
            }
            // the connection's serve loop observes the EOF, unregisters and fires `Closed`
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::output::TransportOutputChannel;
    use crate::channel::{DuplexOutputChannel, OutputChannelEvent};
    use crate::config::ChannelConfig;
    use crate::dispatcher::InlineDispatcher;
    use crate::error::channel_error;
    use crate::events::handler;
    use crate::protocol::{Frame, ObjectFormatter, StreamFormatter};
    use crate::transport::local::LocalTransport;
    use tokio::sync::mpsc;

    fn pair(transport: &Arc<LocalTransport>, address: &str) -> (TransportInputChannel, TransportOutputChannel) {
        let input = TransportInputChannel::new(
            transport.clone(),
            Arc::new(ObjectFormatter),
            address,
            Arc::new(InlineDispatcher),
        );
        let output = TransportOutputChannel::new(
            transport.clone(),
            Arc::new(ObjectFormatter),
            address,
            Arc::new(InlineDispatcher),
            ChannelConfig::default_config(),
        ).unwrap();
        (input, output)
    }

    fn collect_events(channel: &TransportInputChannel) -> mpsc::UnboundedReceiver<InputChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.events().add(handler(move |event: InputChannelEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        }));
        rx
    }

    #[tokio::test]
    async fn test_round_trip_order_and_payload_integrity() {
        let transport = LocalTransport::new();
        let (input, output) = pair(&transport, "svc");
        let mut events = collect_events(&input);
        input.start_listening().await.unwrap();

        output.connect().await.unwrap();
        let payloads: Vec<Bytes> = vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(&[0, 1, 255]),
            Bytes::new(),
            Bytes::from_static(b"last"),
        ];
        for p in &payloads {
            output.send(p.clone()).await.unwrap();
        }

        match events.recv().await.unwrap() {
            InputChannelEvent::Opened { response_receiver_id, .. } => {
                assert_eq!(response_receiver_id, output.response_receiver_id());
            }
            other => panic!("expected Opened, got {:?}", other),
        }
        for expected in &payloads {
            match events.recv().await.unwrap() {
                InputChannelEvent::MessageReceived { payload, response_receiver_id } => {
                    assert_eq!(&payload, expected);
                    assert_eq!(response_receiver_id, output.response_receiver_id());
                }
                other => panic!("expected MessageReceived, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_responses_reach_the_right_client() {
        let transport = LocalTransport::new();
        let (input, output_a) = pair(&transport, "svc");
        let output_b = TransportOutputChannel::new(
            transport.clone(),
            Arc::new(ObjectFormatter),
            "svc",
            Arc::new(InlineDispatcher),
            ChannelConfig::default_config(),
        ).unwrap();
        input.start_listening().await.unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        output_a.events().add(handler(move |event: OutputChannelEvent| {
            let tx = tx_a.clone();
            async move {
                if let OutputChannelEvent::ResponseReceived(payload) = event {
                    tx.send(payload).unwrap();
                }
            }
        }));
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        output_b.events().add(handler(move |event: OutputChannelEvent| {
            let tx = tx_b.clone();
            async move {
                if let OutputChannelEvent::ResponseReceived(payload) = event {
                    tx.send(payload).unwrap();
                }
            }
        }));

        let mut events = collect_events(&input);
        output_a.connect().await.unwrap();
        output_b.connect().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), InputChannelEvent::Opened { .. }));
        assert!(matches!(events.recv().await.unwrap(), InputChannelEvent::Opened { .. }));

        input.send_response(output_a.response_receiver_id(), Bytes::from_static(b"for a")).await.unwrap();
        input.send_response(output_b.response_receiver_id(), Bytes::from_static(b"for b")).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), Bytes::from_static(b"for a"));
        assert_eq!(rx_b.recv().await.unwrap(), Bytes::from_static(b"for b"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_response_to_unknown_receiver_fails() {
        let transport = LocalTransport::new();
        let (input, _) = pair(&transport, "svc");
        input.start_listening().await.unwrap();

        let e = input.send_response("nobody", Bytes::from_static(b"m")).await.unwrap_err();
        assert!(matches!(channel_error(&e), Some(ChannelError::UnknownReceiver(_))));
    }

    #[tokio::test]
    async fn test_duplicate_open_is_refused_and_existing_connection_survives() {
        let transport = LocalTransport::new();
        let (input, output) = pair(&transport, "svc");
        let mut events = collect_events(&input);
        input.start_listening().await.unwrap();

        output.connect().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), InputChannelEvent::Opened { .. }));

        // a second session claiming the same receiver id
        let intruder = transport.connect("svc").await.unwrap();
        intruder.send(Frame::Object(ProtocolMessage::open(output.response_receiver_id()))).await.unwrap();
        // the intruder's session ends without any Opened notification
        assert_eq!(intruder.recv().await.unwrap(), None);

        // the original connection still works
        output.send(Bytes::from_static(b"still alive")).await.unwrap();
        match events.recv().await.unwrap() {
            InputChannelEvent::MessageReceived { payload, .. } => {
                assert_eq!(payload, Bytes::from_static(b"still alive"));
            }
            other => panic!("expected MessageReceived, got {:?}", other),
        }
        assert_eq!(input.open_receiver_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_message_received_after_closed() {
        let transport = LocalTransport::new();
        let (input, output) = pair(&transport, "svc");
        let mut events = collect_events(&input);
        input.start_listening().await.unwrap();

        output.connect().await.unwrap();
        output.close().await;

        assert!(matches!(events.recv().await.unwrap(), InputChannelEvent::Opened { .. }));
        match events.recv().await.unwrap() {
            InputChannelEvent::Closed { response_receiver_id } => {
                assert_eq!(response_receiver_id, output.response_receiver_id());
            }
            other => panic!("expected Closed, got {:?}", other),
        }
        // open-then-close produces exactly those two notifications
        assert!(events.try_recv().is_err());
        assert!(input.open_receiver_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_protocol_violation_is_connection_fatal() {
        let transport = LocalTransport::new();
        let input = TransportInputChannel::new(
            transport.clone(),
            Arc::new(StreamFormatter),
            "svc",
            Arc::new(InlineDispatcher),
        );
        let mut events = collect_events(&input);
        input.start_listening().await.unwrap();

        let session = transport.connect("svc").await.unwrap();
        session.send(StreamFormatter.encode(&ProtocolMessage::open("c1")).unwrap()).await.unwrap();
        match events.recv().await.unwrap() {
            InputChannelEvent::Opened { response_receiver_id, .. } => assert_eq!(response_receiver_id, "c1"),
            other => panic!("expected Opened, got {:?}", other),
        }

        session.send(Frame::Bytes(Bytes::from_static(&[77, 1, 2]))).await.unwrap();

        match events.recv().await.unwrap() {
            InputChannelEvent::Closed { response_receiver_id } => assert_eq!(response_receiver_id, "c1"),
            other => panic!("expected Closed, got {:?}", other),
        }
        assert_eq!(session.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_listening_twice_is_harmless() {
        let transport = LocalTransport::new();
        let (input, output) = pair(&transport, "svc");
        let mut events = collect_events(&input);
        input.start_listening().await.unwrap();
        output.connect().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), InputChannelEvent::Opened { .. }));

        input.stop_listening().await;
        input.stop_listening().await;

        assert!(input.open_receiver_ids().await.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_receiver_fires_closed() {
        let transport = LocalTransport::new();
        let (input, output) = pair(&transport, "svc");
        let mut events = collect_events(&input);
        input.start_listening().await.unwrap();
        output.connect().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), InputChannelEvent::Opened { .. }));

        input.disconnect_receiver(output.response_receiver_id()).await;

        match events.recv().await.unwrap() {
            InputChannelEvent::Closed { response_receiver_id } => {
                assert_eq!(response_receiver_id, output.response_receiver_id());
            }
            other => panic!("expected Closed, got {:?}", other),
        }
    }
}
