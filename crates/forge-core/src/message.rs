use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::role::AgentRole;

/// The role of the author of a [`Message`] as seen by a model backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The requester (or the coordinator relaying context).
    User,
    /// A participant's model output.
    Assistant,
    /// A system-level instruction or prompt.
    System,
}

/// A single message in a run's chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// The role of the message author.
    pub role: Role,
    /// The textual content of the message. For participant turns this is the
    /// raw output, before envelope validation.
    pub content: String,
    /// The run this message belongs to.
    pub run_id: Uuid,
    /// The participant that produced the message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<AgentRole>,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a new message with the given role, content, and run ID.
    pub fn new(role: Role, content: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            run_id,
            sender: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<String>, run_id: Uuid) -> Self {
        Self::new(Role::User, content, run_id)
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<String>, run_id: Uuid) -> Self {
        Self::new(Role::System, content, run_id)
    }

    /// Creates an assistant message attributed to a participant.
    pub fn from_participant(sender: AgentRole, content: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            sender: Some(sender),
            ..Self::new(Role::Assistant, content, run_id)
        }
    }
}
