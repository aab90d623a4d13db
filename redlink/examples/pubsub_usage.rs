//! Subscribe to a channel and print messages as they arrive

use redlink::pubsub::PubSubEvent;
use redlink::{Client, ConnectionConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ConnectionConfig::new("redis://localhost:6379");
    let client = Client::connect(config).await?;

    let subscriber = client.subscriber().await?;
    let mut listener = subscriber.subscribe("news").await?;

    println!("subscribed to 'news'; publish something with PUBLISH news <msg>");

    while let Some(event) = listener.next_event().await {
        match event {
            PubSubEvent::Message(message) => {
                println!(
                    "[{}] {}",
                    message.channel,
                    String::from_utf8_lossy(&message.payload)
                );
            }
            PubSubEvent::SubscriptionLost(reason) => {
                eprintln!("subscription lost: {reason}");
                break;
            }
        }
    }

    Ok(())
}
