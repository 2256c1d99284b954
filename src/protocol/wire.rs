//! Length-prefixed primitives shared by the stream formatter and the broker / message bus
//!  request codecs: varint length followed by the raw bytes.

use crate::error::ChannelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_prefixed(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32_varint(payload.len() as u32);
    buf.put_slice(payload);
}

pub fn try_get_prefixed(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_u32_varint()
        .map_err(|e| ChannelError::ProtocolViolation(format!("invalid length prefix: {}", e)))?
        as usize;
    if buf.remaining() < len {
        return Err(ChannelError::ProtocolViolation(
            format!("truncated frame: {} bytes announced, {} available", len, buf.remaining()),
        ).into());
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn put_str(buf: &mut BytesMut, s: &str) {
    put_prefixed(buf, s.as_bytes());
}

pub fn try_get_str(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_prefixed(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| ChannelError::ProtocolViolation("string is not valid utf-8".to_string()).into())
}
