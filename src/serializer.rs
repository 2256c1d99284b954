//! The serializer seam between typed application messages and the byte payloads the channels
//!  carry. Channels, decorators, broker and bus never look inside a payload; which serializer
//!  to plug in is purely an application decision.

use crate::error::ChannelError;
use bytes::Bytes;

/// Converts between an application value and its wire payload. `declared_type` is the
///  application-level type name both sides agreed on; a mismatch is a [ChannelError::SerializationError],
///  which never tears down the connection the payload arrived on.
pub trait Serializer: Send + Sync + 'static {
    fn serialize(&self, declared_type: &str, value: &[u8]) -> anyhow::Result<Bytes>;
    fn deserialize(&self, declared_type: &str, raw: Bytes) -> anyhow::Result<Bytes>;
}

/// The identity serializer: the application value already is its wire payload.
pub struct BytesSerializer;

impl BytesSerializer {
    pub const DECLARED_TYPE: &'static str = "bytes";

    fn check_type(declared_type: &str) -> anyhow::Result<()> {
        if declared_type != Self::DECLARED_TYPE {
            return Err(ChannelError::SerializationError(
                format!("byte serializer cannot handle type {:?}", declared_type),
            ).into());
        }
        Ok(())
    }
}

impl Serializer for BytesSerializer {
    fn serialize(&self, declared_type: &str, value: &[u8]) -> anyhow::Result<Bytes> {
        Self::check_type(declared_type)?;
        Ok(Bytes::copy_from_slice(value))
    }

    fn deserialize(&self, declared_type: &str, raw: Bytes) -> anyhow::Result<Bytes> {
        Self::check_type(declared_type)?;
        Ok(raw)
    }
}
