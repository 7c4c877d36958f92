// In-memory implementations for examples and testing
//
// These keep all state in memory: a conversation store backed by a map,
// a no-op store for stateless agents, and a scripted provider that plays
// back canonical event sequences without any network I/O.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::conversation::Conversation;
use crate::error::{AgentError, Result};
use crate::events::StreamEvent;
use crate::message::{FinishReason, ToolCall, Usage};
use crate::provider::{Capabilities, GenerateRequest, Provider};
use crate::store::{ConversationFilter, ConversationStore};
use crate::stream::{event_channel, EventStream};

// ============================================================================
// InMemoryConversationStore
// ============================================================================

/// In-memory conversation store keyed by session id
#[derive(Debug, Default, Clone)]
pub struct InMemoryConversationStore {
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
}

impl InMemoryConversationStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Pre-populate with a conversation (useful for testing resume paths)
    pub async fn seed(&self, conversation: Conversation) {
        self.conversations
            .write()
            .await
            .insert(conversation.session_id.clone(), conversation);
    }

    /// Number of stored conversations
    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conversations
            .write()
            .await
            .insert(conversation.session_id.clone(), conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, filter: &ConversationFilter) -> Result<Conversation> {
        let guard = self.conversations.read().await;
        match guard.get(&filter.session_id) {
            Some(existing) => {
                if let Some(status) = filter.status {
                    if existing.status != status {
                        return Ok(Conversation::new(filter.session_id.clone()));
                    }
                }
                let mut conversation = existing.clone();
                if let Some(offset) = filter.offset {
                    conversation.messages = conversation.messages.split_off(
                        offset.min(conversation.messages.len()),
                    );
                }
                if let Some(limit) = filter.limit {
                    conversation.messages.truncate(limit);
                }
                Ok(conversation)
            }
            None => Ok(Conversation::new(filter.session_id.clone())),
        }
    }
}

// ============================================================================
// NoopConversationStore
// ============================================================================

/// Store that persists nothing (stateless agents are valid)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConversationStore;

impl NoopConversationStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConversationStore for NoopConversationStore {
    async fn save_conversation(&self, _conversation: &Conversation) -> Result<()> {
        Ok(())
    }

    async fn get_conversation(&self, filter: &ConversationFilter) -> Result<Conversation> {
        Ok(Conversation::new(filter.session_id.clone()))
    }
}

// ============================================================================
// FailingConversationStore
// ============================================================================

/// Store whose saves always fail (for testing persistence-error handling)
#[derive(Debug, Clone)]
pub struct FailingConversationStore {
    message: String,
}

impl FailingConversationStore {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ConversationStore for FailingConversationStore {
    async fn save_conversation(&self, _conversation: &Conversation) -> Result<()> {
        Err(AgentError::store(self.message.clone()))
    }

    async fn get_conversation(&self, filter: &ConversationFilter) -> Result<Conversation> {
        Ok(Conversation::new(filter.session_id.clone()))
    }
}

// ============================================================================
// StubProvider - scripted canonical event playback
// ============================================================================

/// One scripted turn of stub output
#[derive(Debug, Clone)]
pub struct StubTurn {
    events: Vec<StreamEvent>,
    error: Option<String>,
}

impl StubTurn {
    /// A plain text turn that finishes with `stop`
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            events: vec![
                StreamEvent::stream_start("stub", None),
                StreamEvent::text_delta(text.clone()),
                StreamEvent::text_complete(text),
                StreamEvent::finish_reason(FinishReason::Stop),
                StreamEvent::stream_end(Some(FinishReason::Stop), None),
            ],
            error: None,
        }
    }

    /// A turn that requests tool calls
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        let mut events = vec![StreamEvent::stream_start("stub", None)];
        for call in calls {
            events.push(StreamEvent::tool_call_start(&call.id, &call.name));
            events.push(StreamEvent::tool_call_complete(call));
        }
        events.push(StreamEvent::finish_reason(FinishReason::ToolCalls));
        events.push(StreamEvent::stream_end(Some(FinishReason::ToolCalls), None));
        Self {
            events,
            error: None,
        }
    }

    /// A turn built from raw canonical events
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            error: None,
        }
    }

    /// A turn that fails mid-stream after yielding `events`
    pub fn failing_after(events: Vec<StreamEvent>, error: impl Into<String>) -> Self {
        Self {
            events,
            error: Some(error.into()),
        }
    }

    /// Attach a usage snapshot just before the turn's terminal events
    pub fn with_usage(mut self, usage: Usage) -> Self {
        let at = self
            .events
            .iter()
            .position(|e| matches!(e, StreamEvent::FinishReason { .. } | StreamEvent::StreamEnd { .. }))
            .unwrap_or(self.events.len());
        self.events.insert(at, StreamEvent::usage(usage));
        self
    }
}

/// Scripted provider for orchestrator tests
///
/// Plays back one [`StubTurn`] per `stream` call, in order. Calls past
/// the end of the script replay an empty `stop` turn.
#[derive(Debug, Default, Clone)]
pub struct StubProvider {
    turns: Arc<RwLock<Vec<StubTurn>>>,
    next: Arc<RwLock<usize>>,
    requests: Arc<RwLock<Vec<GenerateRequest>>>,
}

impl StubProvider {
    /// Create a provider with a script of turns
    pub fn new(turns: Vec<StubTurn>) -> Self {
        Self {
            turns: Arc::new(RwLock::new(turns)),
            next: Arc::new(RwLock::new(0)),
            requests: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Every GenerateRequest this provider has seen
    pub async fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.read().await.clone()
    }

    /// How many times `stream` was called
    pub async fn calls(&self) -> usize {
        *self.next.read().await
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn id(&self) -> &str {
        "stub"
    }

    fn provider_name(&self) -> &str {
        "stub"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn stream(&self, request: GenerateRequest) -> Result<EventStream> {
        self.requests.write().await.push(request);

        let turn = {
            let mut index = self.next.write().await;
            let turns = self.turns.read().await;
            let turn = turns
                .get(*index)
                .cloned()
                .unwrap_or_else(|| StubTurn::text(""));
            *index += 1;
            turn
        };

        let (emitter, stream) = event_channel(16);
        tokio::spawn(async move {
            for event in turn.events {
                if emitter.emit(event).await.is_err() {
                    return;
                }
            }
            if let Some(message) = turn.error {
                emitter.set_error(AgentError::provider(message));
            }
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn test_in_memory_store_load_or_create() {
        let store = InMemoryConversationStore::new();
        let filter = ConversationFilter::session("s1");

        // Nothing stored yet: a fresh active conversation comes back
        let fresh = store.get_conversation(&filter).await.unwrap();
        assert!(fresh.messages.is_empty());

        let mut conversation = Conversation::new("s1");
        conversation.push(Message::user("hello"));
        store.save_conversation(&conversation).await.unwrap();

        let loaded = store.get_conversation(&filter).await.unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.id, conversation.id);
    }

    #[tokio::test]
    async fn test_in_memory_store_limit() {
        let store = InMemoryConversationStore::new();
        let mut conversation = Conversation::new("s1");
        for i in 0..5 {
            conversation.push(Message::user(format!("m{}", i)));
        }
        store.save_conversation(&conversation).await.unwrap();

        let mut filter = ConversationFilter::session("s1");
        filter.limit = Some(2);
        let loaded = store.get_conversation(&filter).await.unwrap();
        assert_eq!(loaded.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_stub_provider_plays_turns_in_order() {
        use futures::StreamExt;

        let provider = StubProvider::new(vec![StubTurn::text("one"), StubTurn::text("two")]);

        let mut stream = provider
            .stream(GenerateRequest::new("stub", Vec::new()))
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            if let StreamEvent::TextDelta { delta, .. } = event {
                text.push_str(&delta);
            }
        }
        assert_eq!(text, "one");
        assert_eq!(provider.calls().await, 1);
    }

    #[tokio::test]
    async fn test_stub_provider_generate_folds_stream() {
        let provider = StubProvider::new(vec![StubTurn::text("folded").with_usage(Usage {
            prompt_tokens: 3,
            completion_tokens: 1,
            total_tokens: 4,
            ..Usage::default()
        })]);

        let response = provider
            .generate(GenerateRequest::new("stub", Vec::new()))
            .await
            .unwrap();
        assert_eq!(response.content, "folded");
        assert_eq!(response.usage.total_tokens, 4);
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_stub_provider_mid_stream_error() {
        use futures::StreamExt;

        let provider = StubProvider::new(vec![StubTurn::failing_after(
            vec![StreamEvent::text_delta("partial")],
            "connection dropped",
        )]);

        let mut stream = provider
            .stream(GenerateRequest::new("stub", Vec::new()))
            .await
            .unwrap();
        while stream.next().await.is_some() {}
        assert!(stream.take_error().is_some());
    }
}
