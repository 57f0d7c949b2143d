//! Conversation state for sessions
//!
//! History lives in memory for the lifetime of the process; nothing is
//! written to disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::controller::{Orchestrator, Session};
use crate::ollama::ChatMessage;
use crate::operation::Operation;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of a conversation, kept as the chunks it arrived in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_operation: Option<Operation>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![text.into()],
            resolved_operation: None,
        }
    }

    pub fn assistant() -> Self {
        Self {
            role: Role::Assistant,
            content: Vec::new(),
            resolved_operation: None,
        }
    }

    pub fn push_chunk(&mut self, chunk: impl Into<String>) {
        self.content.push(chunk.into());
    }

    /// Chunks joined in order
    pub fn text(&self) -> String {
        self.content.concat()
    }

    fn to_message(&self) -> Option<ChatMessage> {
        let text = self.text();
        if text.trim().is_empty() {
            return None;
        }
        Some(match self.role {
            Role::User => ChatMessage::user(text),
            Role::Assistant => ChatMessage::assistant(text),
        })
    }
}

/// Ordered turns of one session
#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
    history_limit: usize,
}

impl Conversation {
    /// `history_limit` caps how many past messages are sent to the model
    pub fn new(history_limit: usize) -> Self {
        Self {
            turns: Vec::new(),
            history_limit,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// The most recent non-empty messages, oldest first
    pub fn context(&self) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .turns
            .iter()
            .rev()
            .filter_map(ConversationTurn::to_message)
            .take(self.history_limit)
            .collect();
        messages.reverse();
        messages
    }
}

/// Sessions keyed by client-chosen id
pub struct SessionRegistry {
    orchestrator: Orchestrator,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Existing session for `id`, or a new one
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(self.orchestrator.open_session(id)))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Forget a session; an in-flight turn keeps running to completion
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}
