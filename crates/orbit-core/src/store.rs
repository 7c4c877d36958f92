// Conversation store contract
//
// The orchestrator persists the running conversation after every turn
// through this trait. Implementations range from a no-op (stateless
// agents) to in-memory maps to durable document/relational backends.

use async_trait::async_trait;

use crate::conversation::{Conversation, ConversationStatus};
use crate::error::Result;

/// Filter for conversation lookup
#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    /// Session the conversation is keyed by
    pub session_id: String,
    /// Restrict to a status
    pub status: Option<ConversationStatus>,
    /// Message retrieval limit
    pub limit: Option<usize>,
    /// Message retrieval offset
    pub offset: Option<usize>,
}

impl ConversationFilter {
    /// Filter by session id only
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }
}

/// Trait for persisting conversations
///
/// `get_conversation` is load-or-create: when no conversation matches the
/// filter, implementations return a fresh active conversation for the
/// session rather than an error.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist a conversation (insert or replace)
    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// Load the conversation for a filter, creating a new active one if
    /// none exists
    async fn get_conversation(&self, filter: &ConversationFilter) -> Result<Conversation>;
}
