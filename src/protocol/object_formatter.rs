use crate::error::ChannelError;
use crate::protocol::message::{Frame, ProtocolMessage};
use crate::protocol::ProtocolFormatter;

/// The in-memory formatter: control messages pass through as structured objects, for
///  transports that never serialize (in-process, platform marshalling).
pub struct ObjectFormatter;

impl ProtocolFormatter for ObjectFormatter {
    fn encode(&self, message: &ProtocolMessage) -> anyhow::Result<Frame> {
        Ok(Frame::Object(message.clone()))
    }

    fn decode(&self, frame: Frame) -> anyhow::Result<ProtocolMessage> {
        match frame {
            Frame::Object(message) => Ok(message),
            Frame::Bytes(_) => Err(ChannelError::UnsupportedOperation(
                "object formatter cannot decode byte frames",
            ).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::channel_error;
    use bytes::Bytes;

    #[test]
    fn test_passes_messages_through_unchanged() {
        let message = ProtocolMessage::data("id-1", Bytes::from_static(b"payload"));
        let frame = ObjectFormatter.encode(&message).unwrap();
        assert_eq!(frame, Frame::Object(message.clone()));
        assert_eq!(ObjectFormatter.decode(frame).unwrap(), message);
    }

    #[test]
    fn test_refuses_byte_frames() {
        let e = ObjectFormatter.decode(Frame::Bytes(Bytes::from_static(&[1, 0, 0]))).unwrap_err();
        assert!(matches!(channel_error(&e), Some(ChannelError::UnsupportedOperation(_))));
    }
}
