//! Intent resolver - free text to operation or plain reply
//!
//! Model text is streamed back chunk by chunk as it arrives. Once the model
//! finishes, the full text is searched for a command marker; a candidate is
//! validated against [`OperationLimits`] and never trusted as-is.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

use crate::events::FailureKind;
use crate::metrics::{LLM_CALL_DURATION, RESOLUTIONS_TOTAL};
use crate::ollama::{find_intent, ChatMessage, LanguageModel, StreamChunk, DEFAULT_SYSTEM_PROMPT};
use crate::operation::{Operation, OperationLimits};

/// How a resolved turn should continue
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A validated operation to execute
    Operation(Operation),
    /// Conversation only; nothing to execute
    PlainReply,
}

/// Items produced while resolving
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverEvent {
    /// Model text, in production order
    Chunk(String),
    /// Final classification; always the last item of a successful resolve
    Resolved(Resolution),
}

/// Why no classification could be produced
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("language model unavailable: {0}")]
    Unavailable(String),
    #[error("language model did not answer within {0:?}")]
    Timeout(Duration),
}

impl ResolveError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ResolveError::Unavailable(_) => FailureKind::ResolutionUnavailable,
            ResolveError::Timeout(_) => FailureKind::UpstreamTimeout,
        }
    }
}

pub type ResolverStream = Pin<Box<dyn Stream<Item = Result<ResolverEvent, ResolveError>> + Send>>;

/// Turns user text into a [`Resolution`] using a [`LanguageModel`]
pub struct IntentResolver {
    model: Arc<dyn LanguageModel>,
    limits: OperationLimits,
    system_prompt: String,
    timeout: Duration,
}

impl IntentResolver {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            limits: OperationLimits::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_limits(mut self, limits: OperationLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Deadline for the initial request and for every following chunk
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// System prompt, then prior conversation, then the new user text
    pub fn build_messages(&self, user_text: &str, context: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend_from_slice(context);
        messages.push(ChatMessage::user(user_text));
        messages
    }

    /// Resolve `user_text`.
    ///
    /// The stream yields [`ResolverEvent::Chunk`]s followed by exactly one
    /// [`ResolverEvent::Resolved`], or ends with a single [`ResolveError`].
    pub fn resolve(&self, user_text: &str, context: &[ChatMessage]) -> ResolverStream {
        let messages = self.build_messages(user_text, context);
        let model = self.model.clone();
        let limits = self.limits.clone();
        let deadline = self.timeout;

        Box::pin(stream! {
            let model_name = model.model().to_string();
            let span = info_span!("llm_call", model = %model_name, otel.name = "llm_call");
            let start = Instant::now();

            let connect = tokio::time::timeout(deadline, model.chat_stream(messages))
                .instrument(span.clone())
                .await;
            let mut tokens = match connect {
                Ok(Ok(tokens)) => tokens,
                Ok(Err(e)) => {
                    warn!(model = %model_name, error = %e, "language model request failed");
                    RESOLUTIONS_TOTAL.with_label_values(&["unavailable"]).inc();
                    yield Err(ResolveError::Unavailable(e.to_string()));
                    return;
                }
                Err(_) => {
                    warn!(model = %model_name, "language model request timed out");
                    RESOLUTIONS_TOTAL.with_label_values(&["timeout"]).inc();
                    yield Err(ResolveError::Timeout(deadline));
                    return;
                }
            };

            let mut text = String::new();
            let mut finished = false;
            loop {
                let next = tokio::time::timeout(deadline, tokens.next())
                    .instrument(span.clone())
                    .await;
                match next {
                    Ok(Some(Ok(StreamChunk::Token(token)))) => {
                        if !token.is_empty() {
                            text.push_str(&token);
                            yield Ok(ResolverEvent::Chunk(token));
                        }
                    }
                    Ok(Some(Ok(StreamChunk::Done(summary)))) => {
                        debug!(model = %model_name, eval_count = summary.eval_count, "language model finished");
                        finished = true;
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(model = %model_name, error = %e, "language model stream failed");
                        RESOLUTIONS_TOTAL.with_label_values(&["unavailable"]).inc();
                        yield Err(ResolveError::Unavailable(e.to_string()));
                        return;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(model = %model_name, "language model stream stalled");
                        RESOLUTIONS_TOTAL.with_label_values(&["timeout"]).inc();
                        yield Err(ResolveError::Timeout(deadline));
                        return;
                    }
                }
            }
            LLM_CALL_DURATION
                .with_label_values(&[&model_name])
                .observe(start.elapsed().as_secs_f64());

            if !finished || text.trim().is_empty() {
                RESOLUTIONS_TOTAL.with_label_values(&["unavailable"]).inc();
                yield Err(ResolveError::Unavailable(
                    "the model stream ended without a usable answer".to_string(),
                ));
                return;
            }

            let (resolution, note) = classify(&limits, &text);
            if let Some(note) = note {
                yield Ok(ResolverEvent::Chunk(note));
            }
            yield Ok(ResolverEvent::Resolved(resolution));
        })
    }
}

/// Classify complete model text. The optional note explains a rejected command.
pub fn classify(limits: &OperationLimits, text: &str) -> (Resolution, Option<String>) {
    let raw = match find_intent(text) {
        None => {
            RESOLUTIONS_TOTAL.with_label_values(&["plain_reply"]).inc();
            return (Resolution::PlainReply, None);
        }
        Some(Err(reason)) => {
            debug!(reason = %reason, "rejected extracted command");
            RESOLUTIONS_TOTAL.with_label_values(&["invalid"]).inc();
            return (Resolution::PlainReply, Some(cannot_run(reason)));
        }
        Some(Ok(raw)) => raw,
    };
    match limits.validate(&raw) {
        Ok(Operation::Converse { .. }) => {
            RESOLUTIONS_TOTAL.with_label_values(&["plain_reply"]).inc();
            (Resolution::PlainReply, None)
        }
        Ok(op) => {
            debug!(operation = op.kind(), vm = ?op.vm_name(), "resolved operation");
            RESOLUTIONS_TOTAL.with_label_values(&["operation"]).inc();
            (Resolution::Operation(op), None)
        }
        Err(e) => {
            debug!(error = %e, "rejected extracted command");
            RESOLUTIONS_TOTAL.with_label_values(&["invalid"]).inc();
            (Resolution::PlainReply, Some(cannot_run(e)))
        }
    }
}

fn cannot_run(reason: impl std::fmt::Display) -> String {
    format!("\n\nI can't run that request: {}.", reason)
}
