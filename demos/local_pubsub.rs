//! A broker with two subscribers and one publisher, all in one process over the local
//!  transport.

use bytes::Bytes;
use duplexlink::broker::{Broker, BrokerNotification, BrokerRequest};
use duplexlink::channel::{DuplexOutputChannel, OutputChannelEvent, TransportInputChannel, TransportOutputChannel};
use duplexlink::config::ChannelConfig;
use duplexlink::dispatcher::InlineDispatcher;
use duplexlink::events::handler;
use duplexlink::protocol::ObjectFormatter;
use duplexlink::transport::local::LocalTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

fn broker_client(transport: &Arc<LocalTransport>, name: &'static str) -> Arc<TransportOutputChannel> {
    let channel = Arc::new(TransportOutputChannel::new(
        transport.clone(),
        Arc::new(ObjectFormatter),
        "broker",
        Arc::new(InlineDispatcher),
        ChannelConfig::default_config(),
    ).expect("valid default config"));

    channel.events().add(handler(move |event: OutputChannelEvent| async move {
        if let OutputChannelEvent::ResponseReceived(raw) = event {
            match BrokerNotification::try_deserialize(raw) {
                Ok(notification) => info!(
                    "{} received {:?}: {:?}",
                    name, notification.message_type, notification.payload,
                ),
                Err(e) => info!("{} received an undecodable notification: {}", name, e),
            }
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

    let broker = Broker::new(Arc::new(TransportInputChannel::new(
        transport.clone(),
        Arc::new(ObjectFormatter),
        "broker",
        Arc::new(InlineDispatcher),
    )));
    broker.start().await?;

    let weather_watcher = broker_client(&transport, "weather-watcher");
    let news_watcher = broker_client(&transport, "news-watcher");
    let publisher = broker_client(&transport, "publisher");

    for client in [&weather_watcher, &news_watcher, &publisher] {
        client.connect().await?;
    }

    weather_watcher.send(BrokerRequest::Subscribe(vec!["weather".to_string()]).serialize()).await?;
    news_watcher.send(BrokerRequest::Subscribe(vec!["news".to_string()]).serialize()).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    publisher.send(BrokerRequest::Publish {
        message_type: "weather".to_string(),
        payload: Bytes::from_static(b"sunny, 24 degrees"),
    }.serialize()).await?;
    publisher.send(BrokerRequest::Publish {
        message_type: "news".to_string(),
        payload: Bytes::from_static(b"nothing happened today"),
    }.serialize()).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    for client in [&weather_watcher, &news_watcher, &publisher] {
        client.close().await;
    }
    broker.stop().await;
    Ok(())
}
