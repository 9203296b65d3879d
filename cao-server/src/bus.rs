//! Message bus: per-terminal FIFO inboxes with idle-edge delivery.
//!
//! Delivery is triggered by `* → IDLE` status edges. Exactly one message
//! comes off the inbox per edge (the registry pops and marks BUSY in one
//! critical section), which preserves per-terminal turn boundaries. There is
//! no acknowledgment back to the sender; reliability is best-effort within
//! the server's lifetime.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    reader::Injector,
    registry::{Message, Registry, TerminalStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The recipient was busy (or starting); the message waits in the inbox.
    Queued,
    /// The recipient was idle and the message was injected immediately.
    Delivered,
}

pub struct MessageBus {
    registry: Arc<Registry>,
    injector: Arc<Injector>,
}

impl MessageBus {
    pub fn new(registry: Arc<Registry>, injector: Arc<Injector>) -> Self {
        Self { registry, injector }
    }

    /// Enqueue a message. When the recipient is idle and the message landed
    /// at the head of the queue, delivery happens inline through the same
    /// idle-edge mechanism.
    pub async fn send(&self, message: Message) -> Result<DeliveryOutcome> {
        let to = message.to_id.clone();
        let (position, status) = self.registry.enqueue(&to, message)?;
        tracing::debug!(
            target = "cao::bus",
            terminal = %to,
            position,
            status = ?status,
            "enqueued message"
        );
        if status == TerminalStatus::Idle && position == 0 && self.flush_idle(&to).await {
            return Ok(DeliveryOutcome::Delivered);
        }
        Ok(DeliveryOutcome::Queued)
    }

    /// Deliver at most one pending message. Called on every `* → IDLE` edge.
    /// Returns true when a message was injected.
    pub async fn flush_idle(&self, id: &str) -> bool {
        let Some(message) = self.registry.pop_ready(id) else {
            return false;
        };
        match self.injector.deliver_message(&message).await {
            Ok(()) => true,
            Err(err) => {
                // Best-effort: the message is dropped, the terminal is marked
                // errored by the injector, and the sender is not notified.
                tracing::warn!(
                    target = "cao::bus",
                    terminal = %id,
                    error = %err,
                    "inbox delivery failed"
                );
                false
            }
        }
    }
}
