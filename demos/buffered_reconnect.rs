//! A buffered output channel riding out a service outage: messages sent while the service is
//!  down are delivered, in order, once it is back.

use bytes::Bytes;
use duplexlink::channel::{DuplexInputChannel, DuplexOutputChannel, InputChannelEvent, TransportInputChannel, TransportOutputChannel};
use duplexlink::composite::buffered::BufferedOutputChannel;
use duplexlink::config::{BufferConfig, ChannelConfig};
use duplexlink::dispatcher::InlineDispatcher;
use duplexlink::events::handler;
use duplexlink::protocol::ObjectFormatter;
use duplexlink::transport::local::LocalTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

fn service(transport: &Arc<LocalTransport>) -> Arc<TransportInputChannel> {
    let channel = Arc::new(TransportInputChannel::new(
        transport.clone(),
        Arc::new(ObjectFormatter),
        "svc",
        Arc::new(InlineDispatcher),
    ));
    channel.events().add(handler(|event: InputChannelEvent| async move {
        if let InputChannelEvent::MessageReceived { payload, .. } = event {
            info!("service received {:?}", payload);
        }
    }));
    channel
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .try_init()
        .ok();

    let transport = LocalTransport::new();
    let service = service(&transport);
    service.start_listening().await?;

    let inner = Arc::new(TransportOutputChannel::new(
        transport.clone(),
        Arc::new(ObjectFormatter),
        "svc",
        Arc::new(InlineDispatcher),
        ChannelConfig::default_config(),
    )?);
    let client = BufferedOutputChannel::new(
        inner,
        BufferConfig {
            max_offline_time: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(200),
        },
        Arc::new(InlineDispatcher),
    )?;

    client.connect().await?;
    client.send(Bytes::from_static(b"while online")).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    info!("stopping the service");
    service.stop_listening().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 1..=3 {
        client.send(Bytes::from(format!("while offline #{}", i))).await?;
    }
    info!("{} messages buffered", client.buffered_message_count().await);

    info!("restarting the service");
    service.start_listening().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    client.close().await;
    service.stop_listening().await;
    Ok(())
}
