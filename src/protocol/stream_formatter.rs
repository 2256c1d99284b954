use crate::error::ChannelError;
use crate::protocol::message::{Frame, MessageKind, ProtocolMessage};
use crate::protocol::wire;
use crate::protocol::ProtocolFormatter;
use bytes::{Buf, BufMut, BytesMut};

/// The byte-stream formatter: `[1-byte kind][varint-prefixed receiver id][varint-prefixed
///  payload]`, for transports that carry raw bytes.
pub struct StreamFormatter;

impl ProtocolFormatter for StreamFormatter {
    fn encode(&self, message: &ProtocolMessage) -> anyhow::Result<Frame> {
        let mut buf = BytesMut::with_capacity(
            1 + 5 + message.response_receiver_id.len() + 5 + message.payload.len(),
        );
        buf.put_u8(message.kind as u8);
        wire::put_str(&mut buf, &message.response_receiver_id);
        wire::put_prefixed(&mut buf, &message.payload);
        Ok(Frame::Bytes(buf.freeze()))
    }

    fn decode(&self, frame: Frame) -> anyhow::Result<ProtocolMessage> {
        let bytes = match frame {
            Frame::Bytes(bytes) => bytes,
            Frame::Object(_) => {
                return Err(ChannelError::UnsupportedOperation(
                    "stream formatter cannot decode object frames",
                ).into());
            }
        };

        let buf = &mut bytes.as_ref();
        let raw_kind = buf.try_get_u8()
            .map_err(|_| ChannelError::ProtocolViolation("empty frame".to_string()))?;
        let kind = MessageKind::try_from(raw_kind)
            .map_err(|_| ChannelError::ProtocolViolation(format!("unknown frame kind {}", raw_kind)))?;
        let response_receiver_id = wire::try_get_str(buf)?;
        let payload = wire::try_get_prefixed(buf)?;

        if buf.has_remaining() {
            return Err(ChannelError::ProtocolViolation(
                format!("{} trailing bytes after the payload", buf.remaining()),
            ).into());
        }

        Ok(ProtocolMessage { kind, response_receiver_id, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::channel_error;
    use bytes::Bytes;
    use rstest::rstest;

    #[rstest]
    #[case::open(ProtocolMessage::open("a1"), vec![1, 2, b'a', b'1', 0])]
    #[case::close(ProtocolMessage::close("a1"), vec![2, 2, b'a', b'1', 0])]
    #[case::data(ProtocolMessage::data("a1", Bytes::from_static(b"xyz")), vec![3, 2, b'a', b'1', 3, b'x', b'y', b'z'])]
    #[case::empty_payload(ProtocolMessage::data("b", Bytes::new()), vec![3, 1, b'b', 0])]
    fn test_encode(#[case] message: ProtocolMessage, #[case] expected: Vec<u8>) {
        match StreamFormatter.encode(&message).unwrap() {
            Frame::Bytes(bytes) => assert_eq!(bytes.as_ref(), expected.as_slice()),
            Frame::Object(_) => panic!("stream formatter must produce byte frames"),
        }
    }

    #[rstest]
    #[case::open(vec![1, 2, b'a', b'1', 0], ProtocolMessage::open("a1"))]
    #[case::data(vec![3, 2, b'a', b'1', 3, b'x', b'y', b'z'], ProtocolMessage::data("a1", Bytes::from_static(b"xyz")))]
    fn test_decode(#[case] raw: Vec<u8>, #[case] expected: ProtocolMessage) {
        let decoded = StreamFormatter.decode(Frame::Bytes(Bytes::from(raw))).unwrap();
        assert_eq!(decoded, expected);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_kind(vec![9, 1, b'a', 0])]
    #[case::truncated_id(vec![1, 5, b'a'])]
    #[case::truncated_payload(vec![3, 1, b'a', 4, b'x'])]
    #[case::trailing_garbage(vec![1, 1, b'a', 0, 99])]
    fn test_decode_rejects_malformed_frames(#[case] raw: Vec<u8>) {
        let e = StreamFormatter.decode(Frame::Bytes(Bytes::from(raw))).unwrap_err();
        assert!(matches!(channel_error(&e), Some(ChannelError::ProtocolViolation(_))));
    }

    #[test]
    fn test_decode_refuses_object_frames() {
        let e = StreamFormatter.decode(Frame::Object(ProtocolMessage::open("a"))).unwrap_err();
        assert!(matches!(channel_error(&e), Some(ChannelError::UnsupportedOperation(_))));
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let message = ProtocolMessage::data("tcp://1.2.3.4:80_f00", Bytes::from_static(&[0, 255, 17]));
        let frame = StreamFormatter.encode(&message).unwrap();
        assert_eq!(StreamFormatter.decode(frame).unwrap(), message);
    }
}
