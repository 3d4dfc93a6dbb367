use ably_realtime_rs::{ConnectionEvent, ConnectionState, RealtimeClient, RealtimeClientOptions};
use std::time::Duration;

/// Attach to a channel, subscribe to it and publish a few messages.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let key = std::env::var("ABLY_KEY").expect("ABLY_KEY must be set in .env");
    let channel_name = std::env::var("ABLY_CHANNEL").unwrap_or_else(|_| "demo".to_string());

    let client = RealtimeClient::new(RealtimeClientOptions {
        key: Some(key),
        ..Default::default()
    })?;

    client.once(
        Some(ConnectionEvent::State(ConnectionState::Connected)),
        |_| println!("✅ Connected"),
    );

    let channel = client.channel(&channel_name);
    let mut messages = channel.subscribe();
    channel.attach().await?;
    println!("✅ Attached to '{}'", channel.name());

    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            println!("📨 {:?}: {}", message.name, message.data);
        }
    });

    for i in 0..5 {
        channel
            .publish("tick", serde_json::json!({ "count": i }))?
            .await?;
        println!("📤 Published tick {} (acknowledged)", i);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("Press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;
    client.close();

    Ok(())
}
