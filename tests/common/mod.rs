#![allow(dead_code)]

use ably_realtime_rs::messaging::Action;
use ably_realtime_rs::transport::{MemoryServerConnection, MemoryTransport};
use ably_realtime_rs::types::ProtocolMessage;
use ably_realtime_rs::{ChannelState, ConnectionState, RealtimeClient, RealtimeClientOptions};
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use std::sync::Arc;

pub const FALLBACKS: [&str; 3] = ["fb-a.test", "fb-b.test", "fb-c.test"];

pub fn options() -> RealtimeClientOptions {
    RealtimeClientOptions {
        key: Some("app.key:secret".to_string()),
        realtime_host: Some("primary.test".to_string()),
        fallback_hosts: Some(FALLBACKS.iter().map(|host| host.to_string()).collect()),
        ..Default::default()
    }
}

pub fn client_with(transport: &MemoryTransport, options: RealtimeClientOptions) -> RealtimeClient {
    RealtimeClient::builder(options)
        .unwrap()
        .transport(Arc::new(transport.clone()))
        .build()
        .unwrap()
}

pub fn connected(id: &str, key: &str) -> ProtocolMessage {
    let mut frame = ProtocolMessage::new(Action::Connected);
    frame.connection_id = Some(id.to_string());
    frame.connection_key = Some(key.to_string());
    frame.connection_serial = Some(-1);
    frame
}

pub async fn accept(incoming: &mut UnboundedReceiver<MemoryServerConnection>) -> MemoryServerConnection {
    incoming.next().await.expect("transport dropped")
}

pub async fn wait_for_state(client: &RealtimeClient, state: ConnectionState) {
    let mut watch = client.watch();
    watch
        .wait_for(|snapshot| snapshot.state == state)
        .await
        .expect("client actor stopped");
}

pub async fn wait_for_channel(client: &RealtimeClient, channel: &str, state: ChannelState) {
    let mut watch = client.watch();
    watch
        .wait_for(|snapshot| snapshot.channels.get(channel) == Some(&state))
        .await
        .expect("client actor stopped");
}

/// Next frame from the client with the given action, skipping others.
pub async fn expect_frame(server: &mut MemoryServerConnection, action: Action) -> ProtocolMessage {
    loop {
        let frame = server.recv().await.expect("client closed the transport");
        if frame.action == action {
            return frame;
        }
    }
}

/// Lets the client actor drain everything that is ready.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
