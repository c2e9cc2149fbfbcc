//! Listener fed by the in-process broker.
//!
//! A producer thread publishes JSON frames while the main thread accepts the
//! listener's channel and drains it.
//!
//! ```text
//! RUST_LOG=debug cargo run -p wharf-transport --example inmemory_listener
//! ```

use std::thread;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use wharf_transport::{
    BrokerListener, InMemoryBroker, JsonEncoder, ListenerConfig, Message, MessageEncoder,
    TransportError,
};

fn main() -> Result<(), TransportError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let broker = InMemoryBroker::new();
    let config = ListenerConfig::local_broker("wharf://localhost:61616/queue/orders")
        .with_receive_timeout(Duration::from_millis(500));
    let listener = BrokerListener::new(config, broker.clone(), JsonEncoder);
    listener.open_default()?;

    let producer = thread::spawn(move || {
        for i in 0..5 {
            let message = Message::text(format!("order-{i}"), format!("quantity={}", i * 10))
                .with_header("kind", "order");
            match JsonEncoder.encode(&message) {
                Ok(frame) => broker.publish("orders", frame),
                Err(e) => tracing::error!(error = %e, "failed to encode"),
            }
            thread::sleep(Duration::from_millis(100));
        }
    });

    let Some(channel) = listener.accept_channel_default()? else {
        return Ok(());
    };
    tracing::info!(channel = channel.id(), address = %channel.address(), "channel accepted");

    loop {
        match channel.receive_default() {
            Ok(Some(message)) => {
                tracing::info!(
                    id = %message.id,
                    kind = message.header("kind").unwrap_or("-"),
                    body = message.body_str().unwrap_or("<binary>"),
                    "received"
                );
            }
            Ok(None) => break,
            Err(e) if e.is_timeout() => {
                tracing::info!("no more messages");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if producer.join().is_err() {
        tracing::error!("producer thread panicked");
    }
    listener.close_default()
}
