//! Address indirection: services register with the bus under a logical address, clients attach
//!  to that address, and the bus relays the conversation between them.
//!
//! The bus owns two input channels: one the services connect to, one the clients connect to.
//!  Neither side ever learns the other's transport address.

use crate::channel::{DuplexInputChannel, InputChannelEvent};
use crate::error::ChannelError;
use crate::events::handler;
use crate::protocol::wire::{put_prefixed, put_str, try_get_prefixed, try_get_str};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
enum BusMessageKind {
    Register = 1,
    Attach = 2,
    Request = 3,
    ToService = 4,
    FromService = 5,
    ClientDetached = 6,
}

/// The frames exchanged with the bus itself.
///
/// Services send `Register` once and then `FromService` per response; they receive
///  `ToService` and `ClientDetached`. Clients send `Attach` once and then `Request` per
///  message; responses come back to them as the raw payload, unframed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BusMessage {
    /// service -> bus: claim a logical service address
    Register(String),
    /// client -> bus: bind this connection to the service under an address
    Attach(String),
    /// client -> bus: one application message for the attached service
    Request(Bytes),
    /// bus -> service: one application message from a client
    ToService { client_id: String, payload: Bytes },
    /// service -> bus: one response for a client
    FromService { client_id: String, payload: Bytes },
    /// bus -> service: a client connection is gone
    ClientDetached(String),
}

impl BusMessage {
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            BusMessage::Register(address) => {
                buf.put_u8(BusMessageKind::Register as u8);
                put_str(&mut buf, address);
            }
            BusMessage::Attach(address) => {
                buf.put_u8(BusMessageKind::Attach as u8);
                put_str(&mut buf, address);
            }
            BusMessage::Request(payload) => {
                buf.put_u8(BusMessageKind::Request as u8);
                put_prefixed(&mut buf, payload);
            }
            BusMessage::ToService { client_id, payload } => {
                buf.put_u8(BusMessageKind::ToService as u8);
                put_str(&mut buf, client_id);
                put_prefixed(&mut buf, payload);
            }
            BusMessage::FromService { client_id, payload } => {
                buf.put_u8(BusMessageKind::FromService as u8);
                put_str(&mut buf, client_id);
                put_prefixed(&mut buf, payload);
            }
            BusMessage::ClientDetached(client_id) => {
                buf.put_u8(BusMessageKind::ClientDetached as u8);
                put_str(&mut buf, client_id);
            }
        }
        buf.freeze()
    }

    pub fn try_deserialize(mut raw: Bytes) -> anyhow::Result<BusMessage> {
        let kind = raw.try_get_u8()
            .map_err(|_| ChannelError::ProtocolViolation("empty bus message".to_string()))?;
        let kind = BusMessageKind::try_from(kind)
            .map_err(|_| ChannelError::ProtocolViolation(format!("unknown bus message kind {}", kind)))?;

        Ok(match kind {
            BusMessageKind::Register => BusMessage::Register(try_get_str(&mut raw)?),
            BusMessageKind::Attach => BusMessage::Attach(try_get_str(&mut raw)?),
            BusMessageKind::Request => BusMessage::Request(try_get_prefixed(&mut raw)?),
            BusMessageKind::ToService => BusMessage::ToService {
                client_id: try_get_str(&mut raw)?,
                payload: try_get_prefixed(&mut raw)?,
            },
            BusMessageKind::FromService => BusMessage::FromService {
                client_id: try_get_str(&mut raw)?,
                payload: try_get_prefixed(&mut raw)?,
            },
            BusMessageKind::ClientDetached => BusMessage::ClientDetached(try_get_str(&mut raw)?),
        })
    }
}

#[derive(Default)]
struct BusState {
    /// logical service address -> the service's response receiver id
    services: FxHashMap<String, String>,
    /// reverse lookup for connection cleanup
    address_of: FxHashMap<String, String>,
    /// client response receiver id -> the logical address it attached to
    attached_to: FxHashMap<String, String>,
}

struct BusShared {
    service_channel: Arc<dyn DuplexInputChannel>,
    client_channel: Arc<dyn DuplexInputChannel>,
    state: Mutex<BusState>,
}

impl BusShared {
    async fn on_service_message(self: &Arc<Self>, service_id: String, raw: Bytes) {
        match BusMessage::try_deserialize(raw) {
            Ok(BusMessage::Register(address)) => self.register_service(service_id, address).await,
            Ok(BusMessage::FromService { client_id, payload }) => {
                // responses travel to the client unframed
                if let Err(e) = self.client_channel.send_response(&client_id, payload).await {
                    debug!("response for detached client {:?} - dropping: {}", client_id, e);
                }
            }
            Ok(other) => {
                warn!("unexpected {:?} from service connection {:?} - disconnecting", other, service_id);
                self.service_channel.disconnect_receiver(&service_id).await;
            }
            Err(e) => {
                warn!("undecodable message from service connection {:?} - disconnecting: {}", service_id, e);
                self.service_channel.disconnect_receiver(&service_id).await;
            }
        }
    }

    async fn register_service(self: &Arc<Self>, service_id: String, address: String) {
        let refusal = {
            let mut state = self.state.lock().unwrap();
            if state.address_of.contains_key(&service_id) {
                // one address per connection; a re-register would leave the old entry dangling
                Some("the connection already holds a registration")
            } else if state.services.contains_key(&address) {
                Some("the address is already registered")
            } else {
                state.services.insert(address.clone(), service_id.clone());
                state.address_of.insert(service_id.clone(), address.clone());
                None
            }
        };
        match refusal {
            None => info!("service {:?} is now available on the bus", address),
            Some(reason) => {
                warn!("refusing registration of {:?} by connection {:?} - {}", address, service_id, reason);
                self.service_channel.disconnect_receiver(&service_id).await;
            }
        }
    }

    async fn on_service_closed(self: &Arc<Self>, service_id: String) {
        let orphaned: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            let Some(address) = state.address_of.remove(&service_id) else {
                return;
            };
            state.services.remove(&address);
            info!("service {:?} left the bus", address);
            let orphaned = state.attached_to.iter()
                .filter(|(_, attached)| **attached == address)
                .map(|(client_id, _)| client_id.clone())
                .collect();
            state.attached_to.retain(|_, attached| *attached != address);
            orphaned
        };

        // clients of a vanished service are disconnected rather than left hanging
        for client_id in orphaned {
            self.client_channel.disconnect_receiver(&client_id).await;
        }
    }

    async fn on_client_message(self: &Arc<Self>, client_id: String, raw: Bytes) {
        match BusMessage::try_deserialize(raw) {
            Ok(BusMessage::Attach(address)) => self.attach_client(client_id, address).await,
            Ok(BusMessage::Request(payload)) => self.forward_request(client_id, payload).await,
            Ok(other) => {
                warn!("unexpected {:?} from client connection {:?} - disconnecting", other, client_id);
                self.client_channel.disconnect_receiver(&client_id).await;
            }
            Err(e) => {
                warn!("undecodable message from client connection {:?} - disconnecting: {}", client_id, e);
                self.client_channel.disconnect_receiver(&client_id).await;
            }
        }
    }

    async fn attach_client(self: &Arc<Self>, client_id: String, address: String) {
        let known = {
            let mut state = self.state.lock().unwrap();
            if state.services.contains_key(&address) {
                trace!("client {:?} attached to {:?}", client_id, address);
                state.attached_to.insert(client_id.clone(), address.clone());
                true
            } else {
                false
            }
        };
        if !known {
            warn!("client {:?} asked for unknown service {:?} - disconnecting", client_id, address);
            self.client_channel.disconnect_receiver(&client_id).await;
        }
    }

    async fn forward_request(self: &Arc<Self>, client_id: String, payload: Bytes) {
        let service_id = {
            let state = self.state.lock().unwrap();
            state.attached_to.get(&client_id)
                .and_then(|address| state.services.get(address))
                .cloned()
        };

        let Some(service_id) = service_id else {
            warn!("request from client {:?} before an attach - disconnecting", client_id);
            self.client_channel.disconnect_receiver(&client_id).await;
            return;
        };

        let forwarded = BusMessage::ToService { client_id: client_id.clone(), payload }.serialize();
        if let Err(e) = self.service_channel.send_response(&service_id, forwarded).await {
            warn!("service connection for client {:?} is gone - disconnecting the client: {}", client_id, e);
            self.client_channel.disconnect_receiver(&client_id).await;
        }
    }

    async fn on_client_closed(self: &Arc<Self>, client_id: String) {
        let service_id = {
            let mut state = self.state.lock().unwrap();
            state.attached_to.remove(&client_id)
                .and_then(|address| state.services.get(&address).cloned())
        };

        if let Some(service_id) = service_id {
            let notice = BusMessage::ClientDetached(client_id.clone()).serialize();
            if let Err(e) = self.service_channel.send_response(&service_id, notice).await {
                debug!("could not notify the service about detached client {:?}: {}", client_id, e);
            }
        }
    }
}

/// The message bus service: relays between registered services and attached clients.
pub struct MessageBus {
    shared: Arc<BusShared>,
}

impl MessageBus {
    pub fn new(
        service_channel: Arc<dyn DuplexInputChannel>,
        client_channel: Arc<dyn DuplexInputChannel>,
    ) -> MessageBus {
        let shared = Arc::new(BusShared {
            service_channel: service_channel.clone(),
            client_channel: client_channel.clone(),
            state: Mutex::new(BusState::default()),
        });

        let weak = shared.clone();
        service_channel.events().add(handler(move |event: InputChannelEvent| {
            let shared = weak.clone();
            async move {
                match event {
                    InputChannelEvent::MessageReceived { response_receiver_id, payload } => {
                        shared.on_service_message(response_receiver_id, payload).await;
                    }
                    InputChannelEvent::Closed { response_receiver_id } => {
                        shared.on_service_closed(response_receiver_id).await;
                    }
                    InputChannelEvent::Opened { response_receiver_id, .. } => {
                        trace!("service connection {:?} opened, awaiting registration", response_receiver_id);
                    }
                }
            }
        }));

        let weak = shared.clone();
        client_channel.events().add(handler(move |event: InputChannelEvent| {
            let shared = weak.clone();
            async move {
                match event {
                    InputChannelEvent::MessageReceived { response_receiver_id, payload } => {
                        shared.on_client_message(response_receiver_id, payload).await;
                    }
                    InputChannelEvent::Closed { response_receiver_id } => {
                        shared.on_client_closed(response_receiver_id).await;
                    }
                    InputChannelEvent::Opened { response_receiver_id, .. } => {
                        trace!("client connection {:?} opened, awaiting attach", response_receiver_id);
                    }
                }
            }
        }));

        MessageBus { shared }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.shared.service_channel.start_listening().await?;
        if let Err(e) = self.shared.client_channel.start_listening().await {
            self.shared.service_channel.stop_listening().await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.shared.client_channel.stop_listening().await;
        self.shared.service_channel.stop_listening().await;
        let mut state = self.shared.state.lock().unwrap();
        state.services.clear();
        state.address_of.clear();
        state.attached_to.clear();
    }

    /// the logical addresses currently registered, sorted
    pub fn registered_services(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.shared.state.lock().unwrap()
            .services.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DuplexOutputChannel, OutputChannelEvent, TransportInputChannel, TransportOutputChannel};
    use crate::config::ChannelConfig;
    use crate::dispatcher::InlineDispatcher;
    use crate::protocol::ObjectFormatter;
    use crate::transport::local::LocalTransport;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn bus_on(transport: &Arc<LocalTransport>) -> MessageBus {
        let service_channel = Arc::new(TransportInputChannel::new(
            transport.clone(),
            Arc::new(ObjectFormatter),
            "bus-services",
            Arc::new(InlineDispatcher),
        ));
        let client_channel = Arc::new(TransportInputChannel::new(
            transport.clone(),
            Arc::new(ObjectFormatter),
            "bus-clients",
            Arc::new(InlineDispatcher),
        ));
        MessageBus::new(service_channel, client_channel)
    }

    fn connection(transport: &Arc<LocalTransport>, address: &str) -> TransportOutputChannel {
        TransportOutputChannel::new(
            transport.clone(),
            Arc::new(ObjectFormatter),
            address,
            Arc::new(InlineDispatcher),
            ChannelConfig::default_config(),
        ).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.expect("condition never became true");
    }

    fn collect_output(channel: &dyn DuplexOutputChannel) -> mpsc::UnboundedReceiver<OutputChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.events().add(handler(move |event: OutputChannelEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        }));
        rx
    }

    #[tokio::test]
    async fn test_request_response_through_the_bus() {
        let transport = LocalTransport::new();
        let bus = bus_on(&transport);
        bus.start().await.unwrap();

        // the service registers under a logical address and echoes requests
        let service = Arc::new(connection(&transport, "bus-services"));
        let service_for_handler = service.clone();
        service.events().add(handler(move |event: OutputChannelEvent| {
            let service = service_for_handler.clone();
            async move {
                if let OutputChannelEvent::ResponseReceived(raw) = event {
                    if let Ok(BusMessage::ToService { client_id, payload }) = BusMessage::try_deserialize(raw) {
                        let mut reply = BytesMut::from(payload.as_ref());
                        reply.put_slice(b"-echoed");
                        let frame = BusMessage::FromService { client_id, payload: reply.freeze() }.serialize();
                        service.send(frame).await.unwrap();
                    }
                }
            }
        }));
        service.connect().await.unwrap();
        service.send(BusMessage::Register("echo".to_string()).serialize()).await.unwrap();
        wait_until(|| bus.registered_services() == vec!["echo".to_string()]).await;

        // the client attaches by address and talks to the service without knowing where it is
        let client = connection(&transport, "bus-clients");
        let mut client_events = collect_output(&client);
        client.connect().await.unwrap();
        client.send(BusMessage::Attach("echo".to_string()).serialize()).await.unwrap();
        client.send(BusMessage::Request(Bytes::from_static(b"hello")).serialize()).await.unwrap();

        loop {
            match client_events.recv().await.unwrap() {
                OutputChannelEvent::ResponseReceived(payload) => {
                    assert_eq!(payload, Bytes::from_static(b"hello-echoed"));
                    break;
                }
                OutputChannelEvent::Disconnected => panic!("client was disconnected"),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_attach_to_an_unknown_service_disconnects_the_client() {
        let transport = LocalTransport::new();
        let bus = bus_on(&transport);
        bus.start().await.unwrap();

        let client = connection(&transport, "bus-clients");
        let mut client_events = collect_output(&client);
        client.connect().await.unwrap();
        client.send(BusMessage::Attach("no-such-service".to_string()).serialize()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), client_events.recv()).await
            .expect("client was not disconnected")
            .unwrap();
        assert_eq!(event, OutputChannelEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_service_departure_disconnects_its_clients() {
        let transport = LocalTransport::new();
        let bus = bus_on(&transport);
        bus.start().await.unwrap();

        let service = connection(&transport, "bus-services");
        service.connect().await.unwrap();
        service.send(BusMessage::Register("svc".to_string()).serialize()).await.unwrap();
        wait_until(|| !bus.registered_services().is_empty()).await;

        let client = connection(&transport, "bus-clients");
        let mut client_events = collect_output(&client);
        client.connect().await.unwrap();
        client.send(BusMessage::Attach("svc".to_string()).serialize()).await.unwrap();
        // make sure the attach is processed before the service goes away
        client.send(BusMessage::Request(Bytes::from_static(b"warm-up")).serialize()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        service.close().await;

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client_events.recv().await.unwrap() {
                    OutputChannelEvent::Disconnected => return OutputChannelEvent::Disconnected,
                    _ => continue,
                }
            }
        }).await.expect("client outlived its service");
        assert_eq!(event, OutputChannelEvent::Disconnected);
        assert!(bus.registered_services().is_empty());
    }

    #[tokio::test]
    async fn test_client_departure_is_announced_to_the_service() {
        let transport = LocalTransport::new();
        let bus = bus_on(&transport);
        bus.start().await.unwrap();

        let service = connection(&transport, "bus-services");
        let mut service_events = collect_output(&service);
        service.connect().await.unwrap();
        service.send(BusMessage::Register("svc".to_string()).serialize()).await.unwrap();
        wait_until(|| !bus.registered_services().is_empty()).await;

        let client = connection(&transport, "bus-clients");
        client.connect().await.unwrap();
        client.send(BusMessage::Attach("svc".to_string()).serialize()).await.unwrap();
        client.send(BusMessage::Request(Bytes::from_static(b"hi")).serialize()).await.unwrap();

        // the request proves the attach went through
        loop {
            match service_events.recv().await.unwrap() {
                OutputChannelEvent::ResponseReceived(raw) => {
                    match BusMessage::try_deserialize(raw).unwrap() {
                        BusMessage::ToService { payload, .. } => {
                            assert_eq!(payload, Bytes::from_static(b"hi"));
                            break;
                        }
                        other => panic!("unexpected {:?}", other),
                    }
                }
                _ => continue,
            }
        }

        client.close().await;

        loop {
            match tokio::time::timeout(Duration::from_secs(5), service_events.recv()).await
                .expect("the service was never told").unwrap()
            {
                OutputChannelEvent::ResponseReceived(raw) => {
                    match BusMessage::try_deserialize(raw).unwrap() {
                        BusMessage::ClientDetached(_) => break,
                        other => panic!("unexpected {:?}", other),
                    }
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_second_registration_for_the_same_address_is_refused() {
        let transport = LocalTransport::new();
        let bus = bus_on(&transport);
        bus.start().await.unwrap();

        let first = connection(&transport, "bus-services");
        first.connect().await.unwrap();
        first.send(BusMessage::Register("svc".to_string()).serialize()).await.unwrap();
        wait_until(|| !bus.registered_services().is_empty()).await;

        let second = connection(&transport, "bus-services");
        let mut second_events = collect_output(&second);
        second.connect().await.unwrap();
        second.send(BusMessage::Register("svc".to_string()).serialize()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), second_events.recv()).await
            .expect("the duplicate was not disconnected")
            .unwrap();
        assert_eq!(event, OutputChannelEvent::Disconnected);
        // the original registration is untouched
        assert_eq!(bus.registered_services(), vec!["svc".to_string()]);
    }

    #[tokio::test]
    async fn test_re_registration_on_the_same_connection_is_refused() {
        let transport = LocalTransport::new();
        let bus = bus_on(&transport);
        bus.start().await.unwrap();

        let service = connection(&transport, "bus-services");
        let mut service_events = collect_output(&service);
        service.connect().await.unwrap();
        service.send(BusMessage::Register("first".to_string()).serialize()).await.unwrap();
        wait_until(|| bus.registered_services() == vec!["first".to_string()]).await;

        // the connection tries to claim a second address
        service.send(BusMessage::Register("second".to_string()).serialize()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), service_events.recv()).await
            .expect("the re-registering service was not disconnected")
            .unwrap();
        assert_eq!(event, OutputChannelEvent::Disconnected);
        // and its disconnect cleans up the original address too
        wait_until(|| bus.registered_services().is_empty()).await;
    }
}
