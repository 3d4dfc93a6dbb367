use ably_realtime_rs::{RealtimeClient, RealtimeClientOptions};

/// Connect to Ably and print every connection state change until Ctrl-C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ably_realtime_rs=debug".into()),
        )
        .init();

    let key = std::env::var("ABLY_KEY").expect("ABLY_KEY must be set in .env");

    let client = RealtimeClient::new(RealtimeClientOptions {
        key: Some(key),
        recover: std::env::var("ABLY_RECOVER").ok(),
        ..Default::default()
    })?;

    client.on(None, |change| {
        println!("📡 {} -> {}", change.previous, change.current);
        if let Some(reason) = &change.reason {
            println!("   reason: {} ({})", reason.message, reason.code);
        }
        if let Some(retry_in) = change.retry_in {
            println!("   retrying in {:?}", retry_in);
        }
    });

    println!("Press Ctrl-C to close the connection");
    tokio::signal::ctrl_c().await?;

    if let Some(key) = client.recovery_key() {
        println!("🔑 Recovery key: {}", key);
    }

    client.close();
    let mut watch = client.watch();
    watch
        .wait_for(|snapshot| snapshot.state.is_terminal())
        .await?;
    println!("Closed");

    Ok(())
}
