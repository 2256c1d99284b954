//! Composable duplex messaging channels with pluggable transports.
//!
//! The building blocks, from the bottom up:
//! * [transport] - the raw byte pipe abstraction plus an in-process implementation
//! * [protocol] - the three-message connection protocol and its wire encodings
//! * [channel] - the duplex pair: a client-side output channel, a service-side input channel
//! * [composite] - stackable reliability decorators: buffered, monitored, authenticated
//! * [broker] - publish/subscribe fan-out on top of one input channel
//! * [bus] - address indirection between registered services and attached clients
//!
//! Notifications are delivered through per-channel handler registries; the [dispatcher]
//!  seam decides on which task they run.

pub mod broker;
pub mod bus;
pub mod channel;
pub mod composite;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod protocol;
pub mod serializer;
pub mod transport;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
