use super::Action;
use crate::types::{ErrorInfo, ProtocolMessage};

/// Where an inbound frame belongs.
#[derive(Debug, PartialEq)]
pub enum Route {
    Heartbeat,
    /// Connection-level frame (`CONNECTED`, `DISCONNECTED`, `CLOSED`, `ERROR`, `AUTH`)
    Connection(Action),
    /// Frame addressed to a channel
    Channel { channel: String, action: Action },
    /// Publish acknowledgement for `count` serials starting at `serial`
    Ack {
        serial: u64,
        count: u32,
        error: Option<ErrorInfo>,
    },
    Ignored(Action),
}

/// Classifies inbound frames for the connection state machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageRouter;

impl MessageRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn route(&self, frame: &ProtocolMessage) -> Route {
        match frame.action {
            Action::Heartbeat => Route::Heartbeat,
            Action::Ack | Action::Nack => match frame.msg_serial {
                Some(serial) => Route::Ack {
                    serial,
                    count: frame.count.unwrap_or(1),
                    error: if frame.action == Action::Nack {
                        Some(frame.error.clone().unwrap_or_else(|| {
                            ErrorInfo::new(
                                crate::types::error_codes::CHANNEL_OPERATION_FAILED,
                                400,
                                "message rejected by server",
                            )
                        }))
                    } else {
                        None
                    },
                },
                None => {
                    tracing::warn!("{} without msgSerial", frame.action);
                    Route::Ignored(frame.action)
                }
            },
            Action::Connected
            | Action::Disconnected
            | Action::Closed
            | Action::Auth => Route::Connection(frame.action),
            // An ERROR naming a channel only concerns that channel.
            Action::Error => match &frame.channel {
                Some(channel) => Route::Channel {
                    channel: channel.clone(),
                    action: Action::Error,
                },
                None => Route::Connection(Action::Error),
            },
            Action::Attached | Action::Detached | Action::Message => match &frame.channel {
                Some(channel) => Route::Channel {
                    channel: channel.clone(),
                    action: frame.action,
                },
                None => {
                    tracing::warn!("{} frame without channel", frame.action);
                    Route::Ignored(frame.action)
                }
            },
            other => {
                tracing::debug!("Ignoring inbound {} frame", other);
                Route::Ignored(other)
            }
        }
    }
}
