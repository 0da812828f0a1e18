//! In-process message bus.
//!
//! The core emits `REVIEW_REQUEST` messages when a parent becomes ready
//! for review and organization-wide broadcasts during escalation; the
//! review driver reads review requests back to wake the owning agent.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Messages carried on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// A parent task is ready for its owning agent to review.
    ReviewRequest { task_id: Uuid, agent_id: Uuid },
    /// An escalation reached the organization level.
    OrgBroadcast {
        organization_id: Uuid,
        task_id: Uuid,
        text: String,
    },
}

/// A broadcast bus with fire-and-forget send.
///
/// Cloning is cheap; clones share the channel. Sending never blocks --
/// when no subscriber is listening the message is dropped, matching the
/// bus's advisory role (all state of record lives in the database).
#[derive(Debug, Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<Message>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a message. Returns the number of subscribers that will see
    /// it.
    pub fn send(&self, message: Message) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    /// Subscribe to all future messages.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(256)
    }
}
