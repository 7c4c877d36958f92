// Conversation domain types
//
// A Conversation is the durable unit the store persists: an ordered
// message history keyed by session, plus a status that tracks the
// pause/resume lifecycle (active -> interrupted -> active -> completed/failed).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::message::{Message, MessageRole, ToolCall};

/// Conversation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Interrupted,
    Completed,
    Failed,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationStatus::Active => write!(f, "active"),
            ConversationStatus::Interrupted => write!(f, "interrupted"),
            ConversationStatus::Completed => write!(f, "completed"),
            ConversationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A conversation: ordered message history plus lifecycle status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub messages: Vec<Message>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Conversation {
    /// Create a new active conversation for a session
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            session_id: session_id.into(),
            user_id: None,
            messages: Vec::new(),
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    /// Append a message and bump the update timestamp
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Tool calls from the most recent assistant message that have not
    /// been answered by a later tool-role message.
    ///
    /// This is the set a resume call must account for when the
    /// conversation was interrupted for human input.
    pub fn pending_tool_calls(&self) -> Vec<ToolCall> {
        let Some(position) = self
            .messages
            .iter()
            .rposition(|m| m.role == MessageRole::Assistant && m.has_tool_calls())
        else {
            return Vec::new();
        };

        let answered: Vec<&str> = self.messages[position + 1..]
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .flat_map(|m| m.tool_results.iter().map(|r| r.tool_call_id.as_str()))
            .collect();

        self.messages[position]
            .tool_calls
            .iter()
            .filter(|call| !answered.contains(&call.id.as_str()))
            .cloned()
            .collect()
    }
}
