use anyhow::bail;
use std::time::Duration;

/// Configuration of a raw duplex channel pair.
pub struct ChannelConfig {
    /// upper bound for `connect()`, covering the transport handshake
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    pub fn default_config() -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        Ok(())
    }
}

/// Configuration of the buffered reliability decorator.
///
/// The decorator gives an at-most-once, best-effort, bounded-time guarantee: messages are
///  buffered and flushed in order after a reconnect, but nothing older than `max_offline_time`
///  is ever sent, and reconnection itself is abandoned after that same budget.
pub struct BufferConfig {
    /// the wall-clock age beyond which a buffered message is dropped rather than sent, and the
    ///  budget after which reconnection gives up and the connection surfaces as closed
    pub max_offline_time: Duration,
    /// fixed interval between reconnection attempts
    pub reconnect_interval: Duration,
}

impl BufferConfig {
    pub fn default_config() -> BufferConfig {
        BufferConfig {
            max_offline_time: Duration::from_secs(10),
            reconnect_interval: Duration::from_millis(300),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconnect_interval.is_zero() {
            bail!("reconnect interval must be positive");
        }
        if self.reconnect_interval >= self.max_offline_time {
            bail!("reconnect interval must be shorter than the offline budget");
        }
        Ok(())
    }
}

/// Configuration of the ping-based liveness decorator.
///
/// Ping, pong and data share the wrapped channel's payload stream, distinguished by a leading
///  tag byte. The tag values are configuration rather than constants so deployments that embed
///  this protocol in an existing tag space can move them.
pub struct MonitorConfig {
    /// fixed interval between pings sent by the initiating (output) side
    pub ping_interval: Duration,
    /// silence budget: with no pong (output side) or ping (input side) for this long, the
    ///  connection is treated as broken
    pub receive_timeout: Duration,
    pub data_tag: u8,
    pub ping_tag: u8,
    pub pong_tag: u8,
}

impl MonitorConfig {
    pub fn default_config() -> MonitorConfig {
        MonitorConfig {
            ping_interval: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(4),
            data_tag: 3,
            ping_tag: 10,
            pong_tag: 11,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_interval.is_zero() {
            bail!("ping interval must be positive");
        }
        if self.receive_timeout <= self.ping_interval {
            bail!("receive timeout must exceed the ping interval");
        }
        if self.data_tag == self.ping_tag || self.data_tag == self.pong_tag || self.ping_tag == self.pong_tag {
            bail!("monitor tags must be pairwise distinct");
        }
        Ok(())
    }
}

/// Configuration of the authenticated connection decorator.
pub struct HandshakeConfig {
    /// upper bound for the challenge / response round trip on the client side
    pub handshake_timeout: Duration,
}

impl HandshakeConfig {
    pub fn default_config() -> HandshakeConfig {
        HandshakeConfig {
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must be positive");
        }
        Ok(())
    }
}
