use crate::types::{ErrorInfo, Message, RealtimeError, Result, error_codes};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Identifies the caller waiting on an operation inside the connection actor.
pub(crate) type CompletionId = u64;

/// A publish waiting to be sent or acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingMessage {
    pub channel: String,
    pub messages: Vec<Message>,
    pub completion: CompletionId,
    /// Assigned when the message is written to the transport
    pub msg_serial: Option<u64>,
}

impl PendingMessage {
    pub fn new(channel: impl Into<String>, messages: Vec<Message>, completion: CompletionId) -> Self {
        Self {
            channel: channel.into(),
            messages,
            completion,
            msg_serial: None,
        }
    }
}

pub(crate) type CompletionSender = oneshot::Sender<std::result::Result<(), ErrorInfo>>;

/// Resolves once the operation is acknowledged or fails.
///
/// Dropping the handle does not cancel the operation.
#[derive(Debug)]
pub struct PublishHandle {
    receiver: oneshot::Receiver<std::result::Result<(), ErrorInfo>>,
}

impl PublishHandle {
    pub(crate) fn new() -> (CompletionSender, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    /// Result if the operation already finished, without waiting.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result.map_err(completion_error)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RealtimeError::Cancelled)),
        }
    }
}

fn completion_error(info: ErrorInfo) -> RealtimeError {
    match info.code {
        error_codes::CONNECTION_CLOSED => RealtimeError::ConnectionClosed,
        error_codes::CONNECTION_SUSPENDED => RealtimeError::ConnectionSuspended(info),
        error_codes::CHANNEL_NOT_ATTACHED
        | error_codes::CHANNEL_OPERATION_FAILED
        | error_codes::QUEUE_FULL => RealtimeError::ChannelFailed(info),
        _ => RealtimeError::from(info),
    }
}

impl Future for PublishHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| match result {
            Ok(outcome) => outcome.map_err(completion_error),
            // The actor went away without answering.
            Err(_) => Err(RealtimeError::Cancelled),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_resolves_with_ack() {
        let (sender, handle) = PublishHandle::new();
        sender.send(Ok(())).unwrap();
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_handle_reports_nack() {
        let (sender, handle) = PublishHandle::new();
        sender
            .send(Err(ErrorInfo::new(
                error_codes::CHANNEL_OPERATION_FAILED,
                400,
                "rejected",
            )))
            .unwrap();
        assert!(matches!(handle.await, Err(RealtimeError::ChannelFailed(_))));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_cancelled() {
        let (sender, mut handle) = PublishHandle::new();
        assert!(handle.try_result().is_none());
        drop(sender);
        assert!(matches!(handle.try_result(), Some(Err(RealtimeError::Cancelled))));
    }
}
