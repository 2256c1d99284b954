//! Publish/subscribe fan-out on top of one duplex input channel.
//!
//! The broker sits on the service side of a channel. Clients talk to it with
//!  [BrokerRequest] messages; published messages are fanned out as [BrokerNotification]s to
//!  every response receiver currently subscribed to the message type. Subscriptions die with
//!  the connection that made them.

use crate::channel::{DuplexInputChannel, InputChannelEvent};
use crate::error::ChannelError;
use crate::events::handler;
use crate::protocol::wire::{put_prefixed, put_str, try_get_prefixed, try_get_str};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::TryFromPrimitive;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
enum RequestKind {
    Subscribe = 1,
    Unsubscribe = 2,
    UnsubscribeAll = 3,
    Publish = 4,
}

/// What a client asks the broker to do.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BrokerRequest {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    UnsubscribeAll,
    Publish { message_type: String, payload: Bytes },
}

impl BrokerRequest {
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            BrokerRequest::Subscribe(types) => {
                buf.put_u8(RequestKind::Subscribe as u8);
                put_str_list(&mut buf, types);
            }
            BrokerRequest::Unsubscribe(types) => {
                buf.put_u8(RequestKind::Unsubscribe as u8);
                put_str_list(&mut buf, types);
            }
            BrokerRequest::UnsubscribeAll => {
                buf.put_u8(RequestKind::UnsubscribeAll as u8);
            }
            BrokerRequest::Publish { message_type, payload } => {
                buf.put_u8(RequestKind::Publish as u8);
                put_str(&mut buf, message_type);
                put_prefixed(&mut buf, payload);
            }
        }
        buf.freeze()
    }

    pub fn try_deserialize(mut raw: Bytes) -> anyhow::Result<BrokerRequest> {
        let kind = raw.try_get_u8()
            .map_err(|_| ChannelError::ProtocolViolation("empty broker request".to_string()))?;
        let kind = RequestKind::try_from(kind)
            .map_err(|_| ChannelError::ProtocolViolation(format!("unknown broker request kind {}", kind)))?;

        let request = match kind {
            RequestKind::Subscribe => BrokerRequest::Subscribe(try_get_str_list(&mut raw)?),
            RequestKind::Unsubscribe => BrokerRequest::Unsubscribe(try_get_str_list(&mut raw)?),
            RequestKind::UnsubscribeAll => BrokerRequest::UnsubscribeAll,
            RequestKind::Publish => BrokerRequest::Publish {
                message_type: try_get_str(&mut raw)?,
                payload: try_get_prefixed(&mut raw)?,
            },
        };
        if raw.has_remaining() {
            return Err(ChannelError::ProtocolViolation(
                format!("{} trailing bytes in a broker request", raw.remaining()),
            ).into());
        }
        Ok(request)
    }
}

fn put_str_list(buf: &mut BytesMut, items: &[String]) {
    buf.put_u32_varint(items.len() as u32);
    for item in items {
        put_str(buf, item);
    }
}

fn try_get_str_list(buf: &mut impl Buf) -> anyhow::Result<Vec<String>> {
    let len = buf.try_get_u32_varint()
        .map_err(|e| ChannelError::ProtocolViolation(format!("invalid list length: {}", e)))?;
    let mut items = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        items.push(try_get_str(buf)?);
    }
    Ok(items)
}

/// What a subscriber receives when a matching message is published.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BrokerNotification {
    pub message_type: String,
    pub payload: Bytes,
}

impl BrokerNotification {
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.message_type);
        put_prefixed(&mut buf, &self.payload);
        buf.freeze()
    }

    pub fn try_deserialize(mut raw: Bytes) -> anyhow::Result<BrokerNotification> {
        Ok(BrokerNotification {
            message_type: try_get_str(&mut raw)?,
            payload: try_get_prefixed(&mut raw)?,
        })
    }
}

#[derive(Default)]
struct BrokerState {
    /// message type -> subscribed response receiver ids, kept sorted for deterministic fan-out
    by_type: FxHashMap<String, BTreeSet<String>>,
    /// reverse index for connection cleanup
    by_subscriber: FxHashMap<String, BTreeSet<String>>,
}

struct BrokerShared {
    channel: Arc<dyn DuplexInputChannel>,
    state: Mutex<BrokerState>,
}

impl BrokerShared {
    fn subscribe(&self, response_receiver_id: &str, message_types: Vec<String>) {
        let mut state = self.state.lock().unwrap();
        for message_type in message_types {
            trace!("{:?} subscribes to {:?}", response_receiver_id, message_type);
            state.by_type.entry(message_type.clone()).or_default()
                .insert(response_receiver_id.to_string());
            state.by_subscriber.entry(response_receiver_id.to_string()).or_default()
                .insert(message_type);
        }
    }

    fn unsubscribe(&self, response_receiver_id: &str, message_types: &[String]) {
        let mut state = self.state.lock().unwrap();
        for message_type in message_types {
            if let Some(subscribers) = state.by_type.get_mut(message_type) {
                subscribers.remove(response_receiver_id);
                if subscribers.is_empty() {
                    state.by_type.remove(message_type);
                }
            }
            if let Some(types) = state.by_subscriber.get_mut(response_receiver_id) {
                types.remove(message_type);
                if types.is_empty() {
                    state.by_subscriber.remove(response_receiver_id);
                }
            }
        }
    }

    fn unsubscribe_all(&self, response_receiver_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(types) = state.by_subscriber.remove(response_receiver_id) {
            debug!("dropping {} subscriptions of {:?}", types.len(), response_receiver_id);
            for message_type in types {
                if let Some(subscribers) = state.by_type.get_mut(&message_type) {
                    subscribers.remove(response_receiver_id);
                    if subscribers.is_empty() {
                        state.by_type.remove(&message_type);
                    }
                }
            }
        }
    }

    /// fan-out: every current subscriber of the type, including the publisher itself if it is
    ///  subscribed. A failed delivery is logged and skipped, the rest of the fan-out continues.
    async fn publish(&self, message_type: String, payload: Bytes) {
        let targets: Vec<String> = {
            let state = self.state.lock().unwrap();
            match state.by_type.get(&message_type) {
                Some(subscribers) => subscribers.iter().cloned().collect(),
                None => {
                    trace!("no subscribers for {:?} - dropping the message", message_type);
                    return;
                }
            }
        };

        let notification = BrokerNotification { message_type, payload }.serialize();
        for target in targets {
            if let Err(e) = self.channel.send_response(&target, notification.clone()).await {
                warn!("delivery to subscriber {:?} failed - skipping: {}", target, e);
            }
        }
    }

    async fn on_request(self: &Arc<Self>, response_receiver_id: String, raw: Bytes) {
        match BrokerRequest::try_deserialize(raw) {
            Ok(BrokerRequest::Subscribe(types)) => self.subscribe(&response_receiver_id, types),
            Ok(BrokerRequest::Unsubscribe(types)) => self.unsubscribe(&response_receiver_id, &types),
            Ok(BrokerRequest::UnsubscribeAll) => self.unsubscribe_all(&response_receiver_id),
            Ok(BrokerRequest::Publish { message_type, payload }) => {
                self.publish(message_type, payload).await;
            }
            // a malformed request costs the request, not the connection
            Err(e) => warn!("undecodable broker request from {:?} - ignoring: {}", response_receiver_id, e),
        }
    }
}

/// The broker service. Attach it to an input channel (raw or decorated), start listening, and
///  every connected client can subscribe and publish.
pub struct Broker {
    shared: Arc<BrokerShared>,
}

impl Broker {
    pub fn new(channel: Arc<dyn DuplexInputChannel>) -> Broker {
        let shared = Arc::new(BrokerShared {
            channel: channel.clone(),
            state: Mutex::new(BrokerState::default()),
        });

        let weak = shared.clone();
        channel.events().add(handler(move |event: InputChannelEvent| {
            let shared = weak.clone();
            async move {
                match event {
                    InputChannelEvent::MessageReceived { response_receiver_id, payload } => {
                        shared.on_request(response_receiver_id, payload).await;
                    }
                    InputChannelEvent::Closed { response_receiver_id } => {
                        shared.unsubscribe_all(&response_receiver_id);
                    }
                    InputChannelEvent::Opened { response_receiver_id, .. } => {
                        trace!("broker client {:?} connected", response_receiver_id);
                    }
                }
            }
        }));

        Broker { shared }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.shared.channel.start_listening().await
    }

    pub async fn stop(&self) {
        self.shared.channel.stop_listening().await;
        // both tables drop together, nobody observes a half-cleared pair
        let mut state = self.shared.state.lock().unwrap();
        state.by_type.clear();
        state.by_subscriber.clear();
    }

    /// subscribes a connected response receiver directly, without a request message
    pub fn subscribe(&self, response_receiver_id: &str, message_types: Vec<String>) {
        self.shared.subscribe(response_receiver_id, message_types);
    }

    pub fn unsubscribe(&self, response_receiver_id: &str, message_types: &[String]) {
        self.shared.unsubscribe(response_receiver_id, message_types);
    }

    pub fn unsubscribe_all(&self, response_receiver_id: &str) {
        self.shared.unsubscribe_all(response_receiver_id);
    }

    /// publishes directly from the service process, as if a client had sent a publish request
    pub async fn publish(&self, message_type: &str, payload: Bytes) {
        self.shared.publish(message_type.to_string(), payload).await;
    }

    /// the message types a subscriber currently holds, sorted
    pub fn subscriptions_of(&self, response_receiver_id: &str) -> Vec<String> {
        self.shared.state.lock().unwrap()
            .by_subscriber
            .get(response_receiver_id)
            .map(|types| types.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DuplexOutputChannel, OutputChannelEvent, TransportInputChannel, TransportOutputChannel};
    use crate::config::ChannelConfig;
    use crate::dispatcher::InlineDispatcher;
    use crate::error::channel_error;
    use crate::protocol::ObjectFormatter;
    use crate::transport::local::LocalTransport;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn broker_on(transport: &Arc<LocalTransport>) -> Broker {
        Broker::new(Arc::new(TransportInputChannel::new(
            transport.clone(),
            Arc::new(ObjectFormatter),
            "broker",
            Arc::new(InlineDispatcher),
        )))
    }

    fn client(transport: &Arc<LocalTransport>) -> TransportOutputChannel {
        TransportOutputChannel::new(
            transport.clone(),
            Arc::new(ObjectFormatter),
            "broker",
            Arc::new(InlineDispatcher),
            ChannelConfig::default_config(),
        ).unwrap()
    }

    fn notifications(channel: &dyn DuplexOutputChannel) -> mpsc::UnboundedReceiver<BrokerNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.events().add(handler(move |event: OutputChannelEvent| {
            let tx = tx.clone();
            async move {
                if let OutputChannelEvent::ResponseReceived(payload) = event {
                    tx.send(BrokerNotification::try_deserialize(payload).unwrap()).unwrap();
                }
            }
        }));
        rx
    }

    async fn wait_for_subscription(broker: &Broker, response_receiver_id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.subscriptions_of(response_receiver_id).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.expect("subscription never registered");
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_subscribers_of_the_type_and_nobody_else() {
        let transport = LocalTransport::new();
        let broker = broker_on(&transport);
        broker.start().await.unwrap();

        let sub_a = client(&transport);
        let sub_b = client(&transport);
        let bystander = client(&transport);
        let mut rx_a = notifications(&sub_a);
        let mut rx_b = notifications(&sub_b);
        let mut rx_bystander = notifications(&bystander);

        for c in [&sub_a, &sub_b, &bystander] {
            c.connect().await.unwrap();
        }
        sub_a.send(BrokerRequest::Subscribe(vec!["weather".to_string()]).serialize()).await.unwrap();
        sub_b.send(BrokerRequest::Subscribe(vec!["weather".to_string(), "news".to_string()]).serialize()).await.unwrap();
        bystander.send(BrokerRequest::Subscribe(vec!["news".to_string()]).serialize()).await.unwrap();
        for c in [&sub_a, &sub_b, &bystander] {
            wait_for_subscription(&broker, c.response_receiver_id()).await;
        }

        sub_a.send(BrokerRequest::Publish {
            message_type: "weather".to_string(),
            payload: Bytes::from_static(b"sunny"),
        }.serialize()).await.unwrap();

        let expected = BrokerNotification {
            message_type: "weather".to_string(),
            payload: Bytes::from_static(b"sunny"),
        };
        // the publisher is itself subscribed to the type, so it receives its own message
        assert_eq!(rx_a.recv().await.unwrap(), expected);
        assert_eq!(rx_b.recv().await.unwrap(), expected);
        assert!(rx_bystander.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let transport = LocalTransport::new();
        let broker = broker_on(&transport);
        broker.start().await.unwrap();

        let subscriber = client(&transport);
        let mut rx = notifications(&subscriber);
        subscriber.connect().await.unwrap();

        subscriber.send(BrokerRequest::Subscribe(vec!["a".to_string(), "b".to_string()]).serialize()).await.unwrap();
        wait_for_subscription(&broker, subscriber.response_receiver_id()).await;

        broker.publish("a", Bytes::from_static(b"1")).await;
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"1"));

        subscriber.send(BrokerRequest::Unsubscribe(vec!["a".to_string()]).serialize()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.subscriptions_of(subscriber.response_receiver_id()).len() > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        broker.publish("a", Bytes::from_static(b"2")).await;
        broker.publish("b", Bytes::from_static(b"3")).await;
        // only the "b" message arrives
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"3"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_drops_all_subscriptions() {
        let transport = LocalTransport::new();
        let broker = broker_on(&transport);
        broker.start().await.unwrap();

        let subscriber = client(&transport);
        subscriber.connect().await.unwrap();
        subscriber.send(BrokerRequest::Subscribe(vec!["t".to_string()]).serialize()).await.unwrap();
        wait_for_subscription(&broker, subscriber.response_receiver_id()).await;

        broker.stop().await;
        assert!(broker.subscriptions_of(subscriber.response_receiver_id()).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_drops_all_subscriptions() {
        let transport = LocalTransport::new();
        let broker = broker_on(&transport);
        broker.start().await.unwrap();

        let subscriber = client(&transport);
        subscriber.connect().await.unwrap();
        let id = subscriber.response_receiver_id().to_string();

        subscriber.send(BrokerRequest::Subscribe(vec!["a".to_string()]).serialize()).await.unwrap();
        wait_for_subscription(&broker, &id).await;

        subscriber.close().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !broker.subscriptions_of(&id).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.expect("subscriptions survived the disconnect");
    }

    #[tokio::test]
    async fn test_malformed_request_does_not_kill_the_connection() {
        let transport = LocalTransport::new();
        let broker = broker_on(&transport);
        broker.start().await.unwrap();

        let subscriber = client(&transport);
        subscriber.connect().await.unwrap();

        subscriber.send(Bytes::from_static(&[99, 1, 2, 3])).await.unwrap();

        // the connection is still usable for a proper request
        subscriber.send(BrokerRequest::Subscribe(vec!["a".to_string()]).serialize()).await.unwrap();
        wait_for_subscription(&broker, subscriber.response_receiver_id()).await;
    }

    #[test]
    fn test_request_codec_rejects_trailing_garbage() {
        let mut raw = BytesMut::from(BrokerRequest::UnsubscribeAll.serialize().as_ref());
        raw.put_u8(7);
        let e = BrokerRequest::try_deserialize(raw.freeze()).unwrap_err();
        assert!(matches!(channel_error(&e), Some(ChannelError::ProtocolViolation(_))));
    }

    #[test]
    fn test_request_codec_round_trip() {
        for request in [
            BrokerRequest::Subscribe(vec!["a".to_string(), "b".to_string()]),
            BrokerRequest::Unsubscribe(vec![]),
            BrokerRequest::UnsubscribeAll,
            BrokerRequest::Publish { message_type: "t".to_string(), payload: Bytes::from_static(b"p") },
        ] {
            assert_eq!(BrokerRequest::try_deserialize(request.serialize()).unwrap(), request);
        }
    }
}
