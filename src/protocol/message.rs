use bytes::Bytes;
use num_enum::TryFromPrimitive;

/// Wire-level frame kinds. Ping and Pong belong to the liveness decorator; they share the enum
///  so a decoder can recognize them before looking at the payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    OpenConnection = 1,
    CloseConnection = 2,
    Data = 3,
    Ping = 10,
    Pong = 11,
}

/// One decoded control message. Immutable once constructed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProtocolMessage {
    pub kind: MessageKind,
    /// id of the logical client connection this message belongs to, generated by the client
    ///  side at connection-open time and stable across transport reconnects
    pub response_receiver_id: String,
    pub payload: Bytes,
}

impl ProtocolMessage {
    pub fn open(response_receiver_id: impl Into<String>) -> ProtocolMessage {
        ProtocolMessage {
            kind: MessageKind::OpenConnection,
            response_receiver_id: response_receiver_id.into(),
            payload: Bytes::new(),
        }
    }

    pub fn close(response_receiver_id: impl Into<String>) -> ProtocolMessage {
        ProtocolMessage {
            kind: MessageKind::CloseConnection,
            response_receiver_id: response_receiver_id.into(),
            payload: Bytes::new(),
        }
    }

    pub fn data(response_receiver_id: impl Into<String>, payload: Bytes) -> ProtocolMessage {
        ProtocolMessage {
            kind: MessageKind::Data,
            response_receiver_id: response_receiver_id.into(),
            payload,
        }
    }
}

/// What a transport session carries: raw bytes for socket-like transports, structured messages
///  for in-process and platform transports that never serialize.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Bytes(Bytes),
    Object(ProtocolMessage),
}
