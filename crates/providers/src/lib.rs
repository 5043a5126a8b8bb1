//! `dx-providers` — LLM access, UI generation providers, and the
//! enhancement decision pipeline.
//!
//! This crate owns everything between a raw assistant utterance and the
//! frames a connection streams to its client:
//! - [`traits::LlmProvider`] and the OpenAI-compatible adapter;
//! - the [`ui`] provider family (C1 component streams and HTML streams)
//!   selected by `provider_type`;
//! - the [`decider`] that chooses between plain text and a visual artifact
//!   while streaming voice-over text mid-decision;
//! - the tool-aware [`chat`] wrapper used for text turns;
//! - the [`planner`] tool callable by the decider;
//! - HTML/C1 response [`templates`].

pub mod chat;
pub mod decider;
pub mod openai_compat;
pub mod planner;
pub mod prompts;
pub mod scanner;
pub mod sse;
pub mod templates;
pub mod traits;
pub mod ui;

// Re-exports for convenience.
pub use decider::{EnhancementDecider, EnhancementDecision, VoiceOverSink};
pub use openai_compat::OpenAiCompatClient;
pub use traits::{ChatRequest, ChatResponse, LlmProvider, UiProvider};
pub use ui::create_provider;
