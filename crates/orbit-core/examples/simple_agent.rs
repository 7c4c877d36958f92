// Minimal end-to-end run against the scripted stub provider.
//
// Run with: cargo run --example simple_agent -p orbit-core

use std::sync::Arc;

use futures::StreamExt;
use orbit_core::{
    Agent, AgentConfig, ChatRequest, EchoTool, InMemoryConversationStore, StreamEvent,
    StubProvider, StubTurn, ToolCall,
};

#[tokio::main]
async fn main() -> orbit_core::Result<()> {
    let provider = StubProvider::new(vec![
        StubTurn::tool_calls(vec![ToolCall::new(
            "call_1",
            "echo",
            serde_json::json!({"message": "round trip"}),
        )]),
        StubTurn::text("The echo tool returned: round trip"),
    ]);

    let agent = Agent::new(
        AgentConfig::new("You are a helpful assistant.", "stub"),
        Arc::new(provider),
        Arc::new(InMemoryConversationStore::new()),
    );
    agent.tools().register(Arc::new(EchoTool));

    let mut stream = agent
        .chat(ChatRequest::new("demo-session", "Echo something back."))
        .await?;

    while let Some(event) = stream.next().await {
        match &event {
            StreamEvent::TextDelta { delta, .. } => print!("{}", delta),
            StreamEvent::AgentStepStart { step_number, .. } => {
                println!("\n--- step {} ---", step_number)
            }
            StreamEvent::ToolExecutionComplete { name, is_error, .. } => {
                println!("[tool {} done, error={}]", name, is_error)
            }
            StreamEvent::AgentEnded { finish_reason, .. } => {
                println!("\n=== ended: {} ===", finish_reason)
            }
            _ => {}
        }
    }

    if let Some(err) = stream.take_error() {
        return Err(err);
    }
    Ok(())
}
