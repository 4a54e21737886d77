//! Outbound command queue with a single retrying delivery loop.
//!
//! Side-effecting calls are scheduled fire-and-forget and delivered
//! in order, one at a time. Transient failures put the command back at
//! the head of the queue and back off; a forbidden command is dropped,
//! because retrying cannot succeed.

use std::sync::Arc;

use async_trait::async_trait;
use roomline_core::{ClientError, ErrorCategory, Fifo, RetryPolicy};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Named side-effecting operations exposed by the transport surface.
///
/// `schedule` validates operation names against this set, so scheduling
/// a call the transport cannot dispatch fails synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SendMessageEvent,
    SendStateEvent,
    Invite,
    Join,
    Leave,
    Forget,
    Kick,
    Ban,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::SendMessageEvent,
        Operation::SendStateEvent,
        Operation::Invite,
        Operation::Join,
        Operation::Leave,
        Operation::Forget,
        Operation::Kick,
        Operation::Ban,
    ];

    /// Look an operation up by its scheduling name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|operation| operation.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessageEvent => "send_message_event",
            Self::SendStateEvent => "send_state_event",
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Forget => "forget",
            Self::Kick => "kick",
            Self::Ban => "ban",
        }
    }
}

/// A scheduled operation with its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub operation: Operation,
    pub args: Vec<Value>,
}

/// Dispatch surface the delivery loop executes commands against.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn invoke(&self, command: &PendingCommand) -> Result<(), ClientError>;
}

/// Ordered, at-least-once queue of outbound commands.
#[derive(Clone, Default)]
pub struct CommandQueue {
    scheduled: Arc<Fifo<PendingCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a named operation without blocking.
    ///
    /// An unknown operation name is a programming error and is returned
    /// immediately; nothing is enqueued.
    pub fn schedule(&self, operation: &str, args: Vec<Value>) -> Result<(), ClientError> {
        let operation = Operation::parse(operation).ok_or_else(|| {
            ClientError::new(
                ErrorCategory::Config,
                "unknown_operation",
                format!("transport exposes no operation named '{operation}'"),
            )
        })?;

        debug!(operation = operation.name(), "command scheduled");
        self.scheduled.enqueue(PendingCommand { operation, args });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Start the delivery loop. It runs until the token is cancelled;
    /// cancellation also wakes a pending dequeue without executing
    /// anything further.
    pub fn spawn_delivery<T>(&self, transport: Arc<T>, cancel: CancellationToken) -> JoinHandle<()>
    where
        T: CommandTransport + 'static,
    {
        let scheduled = Arc::clone(&self.scheduled);
        tokio::spawn(async move {
            deliver(scheduled, transport, cancel).await;
        })
    }
}

async fn deliver<T: CommandTransport>(
    scheduled: Arc<Fifo<PendingCommand>>,
    transport: Arc<T>,
    cancel: CancellationToken,
) {
    let policy = RetryPolicy::default();
    let mut attempt: u32 = 0;
    let mut retry_hint: Option<u64> = None;

    loop {
        let delay = policy.delay_for_attempt(attempt, retry_hint);
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = scheduled.dequeue() => command,
        };

        match transport.invoke(&command).await {
            Ok(()) => {
                debug!(operation = command.operation.name(), "command delivered");
                attempt = 0;
                retry_hint = None;
            }
            Err(err) if err.category == ErrorCategory::Forbidden => {
                error!(
                    operation = command.operation.name(),
                    error = %err,
                    "command forbidden, dropping it"
                );
                attempt = 0;
                retry_hint = None;
            }
            Err(err) => {
                warn!(
                    operation = command.operation.name(),
                    error = %err,
                    "command failed, requeueing at head"
                );
                retry_hint = err.retry_after_ms;
                scheduled.requeue(command);
                attempt = attempt.saturating_add(1);
            }
        }
    }

    info!("command delivery loop stopped");
}
