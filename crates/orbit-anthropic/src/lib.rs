// Anthropic Provider Adapter
//
// This crate adapts the Anthropic Messages streaming API (content-block
// SSE events) to the canonical event stream consumed by the Orbit
// orchestrator.

mod provider;
mod types;


pub use provider::AnthropicProvider;

// Re-export core types for convenience
pub use orbit_core::provider::Provider;
