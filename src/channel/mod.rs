//! The duplex connection pair: a client-side output channel and a service-side input channel,
//!  talking through a [crate::protocol::ProtocolFormatter] over a raw transport.
//!
//! The two traits here are also the contract every reliability decorator in
//!  [crate::composite] implements, so decorators stack in any order.

pub mod input;
pub mod output;

use crate::events::HandlerRegistry;
use async_trait::async_trait;
use bytes::Bytes;

pub use input::TransportInputChannel;
pub use output::TransportOutputChannel;

/// Notifications surfaced by an output channel (and by decorators wrapping one).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OutputChannelEvent {
    /// a response message addressed to this channel's receiver id arrived
    ResponseReceived(Bytes),
    /// the logical connection ended: remote close, transport drop, protocol violation,
    ///  liveness timeout or a buffering give-up - deliberately indistinguishable
    Disconnected,
    /// a buffered message was dropped without having been delivered
    DeliveryFailed(Bytes),
}

/// Notifications surfaced by an input channel (and by decorators wrapping one).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum InputChannelEvent {
    Opened {
        response_receiver_id: String,
        sender_address: String,
    },
    Closed {
        response_receiver_id: String,
    },
    MessageReceived {
        response_receiver_id: String,
        payload: Bytes,
    },
}

/// The client side of a duplex connection.
///
/// State machine: detached -> connecting -> open -> closed; `connect` is legal again after a
///  close. Responses are delivered through the event registry in transport arrival order.
#[async_trait]
pub trait DuplexOutputChannel: Send + Sync + 'static {
    /// stable id of this logical connection, generated once per channel so it survives
    ///  transport-level reconnects
    fn response_receiver_id(&self) -> &str;

    fn events(&self) -> &HandlerRegistry<OutputChannelEvent>;

    /// true while in the open state - decorators use this to decide between forwarding
    ///  and buffering
    fn is_open(&self) -> bool;

    /// opens the transport connection and announces this receiver id to the service side.
    ///  Fails with `ConnectFailed` if the transport is unreachable within the connect timeout.
    async fn connect(&self) -> anyhow::Result<()>;

    /// sends a close-connection message (best effort) and tears the connection down.
    ///  Idempotent; does not fire `Disconnected` for a locally initiated close.
    async fn close(&self);

    /// sends one data message. Fails with `NotConnected` outside the open state.
    async fn send(&self, payload: Bytes) -> anyhow::Result<()>;
}

/// The service side of a duplex connection: accepts any number of logical client connections,
///  each identified by its response receiver id.
#[async_trait]
pub trait DuplexInputChannel: Send + Sync + 'static {
    /// the address this channel listens on
    fn address(&self) -> &str;

    fn events(&self) -> &HandlerRegistry<InputChannelEvent>;

    async fn start_listening(&self) -> anyhow::Result<()>;

    /// stops accepting and drops all open connections without `Closed` notifications.
    ///  Idempotent.
    async fn stop_listening(&self);

    /// sends one response message to an open logical connection. Fails with `UnknownReceiver`
    ///  if the id is not open.
    async fn send_response(&self, response_receiver_id: &str, payload: Bytes) -> anyhow::Result<()>;

    /// service-initiated close of one logical connection; the regular `Closed` notification
    ///  fires once the connection is down. A no-op for unknown ids.
    async fn disconnect_receiver(&self, response_receiver_id: &str);
}
