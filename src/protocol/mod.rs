//! The protocol layer: the three control message kinds a duplex connection is driven by, and
//!  the formatters that put them onto (and read them off) a raw transport.

pub mod message;
pub mod object_formatter;
pub mod stream_formatter;
pub mod wire;

pub use message::{Frame, MessageKind, ProtocolMessage};
pub use object_formatter::ObjectFormatter;
pub use stream_formatter::StreamFormatter;

/// Encodes control messages to transport frames and back.
///
/// Two families exist: [StreamFormatter] for transports that carry raw bytes, and
///  [ObjectFormatter] for transports that carry structured messages directly. A direction a
///  formatter does not support fails with `ChannelError::UnsupportedOperation`; malformed input
///  fails with `ChannelError::ProtocolViolation`, which the channel layer treats as fatal for
///  the connection the frame arrived on.
pub trait ProtocolFormatter: Send + Sync + 'static {
    fn encode(&self, message: &ProtocolMessage) -> anyhow::Result<Frame>;
    fn decode(&self, frame: Frame) -> anyhow::Result<ProtocolMessage>;
}
