use std::fmt::{Display, Formatter};

/// Failure taxonomy shared by channels, decorators, broker and message bus.
///
/// All fallible operations return `anyhow::Result`; the typed kind travels inside the
///  `anyhow::Error` so call sites that need to distinguish (e.g. a buffered decorator treating
///  `NotConnected` differently from a protocol violation) can [downcast](channel_error).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChannelError {
    /// the transport could not be reached when opening a connection
    ConnectFailed(String),
    /// `send` was called on a channel that is not in the `Open` state
    NotConnected,
    /// `send_response` was called for a response receiver id with no open connection record
    UnknownReceiver(String),
    /// a malformed or truncated frame - fatal for the connection it arrived on, not for the message
    ProtocolViolation(String),
    /// an open request for a response receiver id that is already open - refused, the existing
    ///  connection is unaffected
    DuplicateConnection(String),
    /// type or format mismatch in a serializer - the connection stays open
    SerializationError(String),
    /// the formatter (or another collaborator) does not implement the requested direction
    UnsupportedOperation(&'static str),
}

impl Display for ChannelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::ConnectFailed(details) => write!(f, "transport unreachable: {}", details),
            ChannelError::NotConnected => write!(f, "channel is not connected"),
            ChannelError::UnknownReceiver(id) => write!(f, "no open connection for response receiver {:?}", id),
            ChannelError::ProtocolViolation(details) => write!(f, "protocol violation: {}", details),
            ChannelError::DuplicateConnection(id) => write!(f, "response receiver {:?} is already connected", id),
            ChannelError::SerializationError(details) => write!(f, "serialization failed: {}", details),
            ChannelError::UnsupportedOperation(details) => write!(f, "unsupported operation: {}", details),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Extracts the typed error kind from an `anyhow::Error`, if there is one.
pub fn channel_error(e: &anyhow::Error) -> Option<&ChannelError> {
    e.downcast_ref::<ChannelError>()
}
