//! Ollama LLM integration module
//!
//! - `client` - streaming `/api/chat` client and the [`LanguageModel`] trait
//! - `intent` - recognizing structured commands in model output

pub mod client;
pub mod intent;

pub use client::{
    ChatError, ChatMessage, ChatSummary, LanguageModel, OllamaClient, Role, StreamChunk,
    TokenStream,
};
pub use intent::{extract_intent, find_intent, DEFAULT_SYSTEM_PROMPT};
