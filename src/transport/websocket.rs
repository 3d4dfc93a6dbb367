use super::{Transport, TransportConnection};
use crate::types::{ProtocolMessage, RealtimeError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// WebSocket transport backed by tokio-tungstenite, speaking JSON frames.
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

fn decode(message: Message) -> Option<Result<ProtocolMessage>> {
    match message {
        Message::Text(text) => {
            tracing::debug!("Received text frame: {}", text.as_str());
            Some(serde_json::from_str::<ProtocolMessage>(&text).map_err(RealtimeError::from))
        }
        Message::Binary(data) => {
            tracing::warn!(
                "Received unexpected binary message ({} bytes)",
                data.len()
            );
            None
        }
        Message::Close(frame) => {
            if let Some(close_frame) = frame {
                tracing::info!(
                    "Server closed connection: code={:?}, reason='{}'",
                    close_frame.code,
                    close_frame.reason
                );
            } else {
                tracing::info!("Server closed connection without close frame");
            }
            None
        }
        Message::Ping(data) => {
            tracing::debug!("Received ping ({} bytes)", data.len());
            None
        }
        Message::Pong(data) => {
            tracing::debug!("Received pong ({} bytes)", data.len());
            None
        }
        Message::Frame(_) => None,
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn dial(&self, protocol: &str, url: &Url) -> Result<TransportConnection> {
        tracing::info!("Dialing {} ({})", url.host_str().unwrap_or_default(), protocol);

        let (ws_stream, response) = connect_async(url.as_str()).await?;
        tracing::debug!("WebSocket handshake completed: {}", response.status());

        let (write_half, read_half) = ws_stream.split();

        let sink = write_half
            .sink_map_err(RealtimeError::from)
            .with(|frame: ProtocolMessage| {
                future::ready(
                    serde_json::to_string(&frame)
                        .map(|json| Message::Text(json.into()))
                        .map_err(RealtimeError::from),
                )
            });

        // A parse failure is surfaced as an error item; the stream ends on close.
        let stream = read_half
            .take_while(|item| future::ready(!matches!(item, Ok(Message::Close(_)))))
            .filter_map(|item| {
                future::ready(match item {
                    Ok(message) => decode(message),
                    Err(e) => Some(Err(RealtimeError::from(e))),
                })
            });

        Ok(TransportConnection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Action;

    #[test]
    fn test_decode_text_frame() {
        let message = Message::Text(r#"{"action":0}"#.into());
        let frame = decode(message).unwrap().unwrap();
        assert_eq!(frame.action, Action::Heartbeat);
    }

    #[test]
    fn test_decode_skips_control_frames() {
        assert!(decode(Message::Ping(Vec::new().into())).is_none());
        assert!(decode(Message::Pong(Vec::new().into())).is_none());
    }

    #[test]
    fn test_decode_reports_malformed_json() {
        let result = decode(Message::Text("{not json".into())).unwrap();
        assert!(matches!(result, Err(RealtimeError::Serialization(_))));
    }
}
