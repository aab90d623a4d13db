//! Basic usage example for redlink

use redlink::{Client, Command, ConnectionConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt::init();

    // Create configuration
    let config = ConnectionConfig::new("redis://localhost:6379");

    // Connect (automatically detects Standalone vs Cluster)
    let client = Client::connect(config).await?;

    // Basic SET and GET
    client.set("mykey", "Hello!").await?;
    if let Some(value) = client.get("mykey").await? {
        println!("GET mykey: {}", value);
    }

    // SET with expiration
    client
        .set_ex("tempkey", "temporary value", Duration::from_secs(60))
        .await?;
    println!("SET tempkey with 60s expiration");

    // INCREMENT
    client.set("counter", "0").await?;
    let value = client.incr("counter").await?;
    println!("INCR counter: {}", value);

    // Anything without a typed helper goes through the command builder
    let reply = client
        .execute(&Command::new("APPEND").arg("mykey").arg(" More."))
        .await?;
    println!("APPEND mykey: {:?}", reply);

    // Batches ride one connection back-to-back
    let replies = client
        .execute_batch(&[
            Command::new("SET").arg("a").arg("1"),
            Command::new("INCR").arg("a"),
            Command::new("GET").arg("a"),
        ])
        .await?;
    println!("batch replies: {:?}", replies);

    // DELETE
    let deleted = client.del(&["mykey", "tempkey", "counter", "a"]).await?;
    println!("DEL: {} keys deleted", deleted);

    Ok(())
}
