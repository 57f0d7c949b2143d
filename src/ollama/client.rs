//! Ollama API client for streaming chat
//!
//! Talks to `/api/chat` with `stream: true`. Ollama answers with one JSON
//! object per line; the client re-frames the byte stream on newlines, so a
//! JSON object split across network chunks is still parsed whole.

use std::pin::Pin;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;
use tracing::debug;

/// Represents a single item from the streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A token fragment from the model's response
    Token(String),
    /// The final message containing timing/count metadata
    Done(ChatSummary),
}

/// Metadata Ollama attaches to the final chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSummary {
    /// Number of tokens generated
    pub eval_count: u32,
    /// Number of tokens in the prompt
    pub prompt_eval_count: u32,
    /// Time spent generating tokens (nanoseconds)
    pub eval_duration_ns: u64,
}

/// Stream of chunks from one chat call
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ChatError>> + Send>>;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Error type for chat operations
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("ollama returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("ollama reported an error: {0}")]
    Server(String),
    #[error("empty response from Ollama")]
    EmptyResponse,
    #[error("model '{0}' is not available in Ollama")]
    ModelMissing(String),
}

/// Streaming text generator behind the intent resolver
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start a chat completion and stream its tokens
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream, ChatError>;

    /// Check that the service is reachable and the model is present
    async fn health(&self) -> Result<(), ChatError> {
        Ok(())
    }

    /// Model name (used for metrics and logs)
    fn model(&self) -> &str;
}

/// One line of Ollama's `/api/chat` NDJSON stream
#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_duration: u64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// Client for interacting with Ollama's HTTP API
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    /// Create a new Ollama client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the Ollama server (e.g., "http://localhost:11434")
    /// * `model` - The model name (e.g., "mistral-faiss-rag:latest")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream, ChatError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        debug!(model = %self.model, messages = messages.len(), "sending chat request");

        let response = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({
                "model": self.model,
                "messages": messages,
                "stream": true,
                "options": {
                    "temperature": 0.0
                }
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = response.bytes_stream();
        Ok(Box::pin(stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => buffer.extend_from_slice(&chunk),
                    Err(e) => {
                        yield Err(ChatError::Request(e));
                        return;
                    }
                }
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_chat_line(&line) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                yield Ok(chunk);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if !buffer.is_empty() {
                match parse_chat_line(&buffer) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
        }))
    }

    async fn health(&self) -> Result<(), ChatError> {
        let endpoint = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&endpoint).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let tags: TagsResponse = serde_json::from_str(&response.text().await?)?;
        if has_model(&tags, &self.model) {
            Ok(())
        } else {
            Err(ChatError::ModelMissing(self.model.clone()))
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Parse one NDJSON line into zero or more chunks.
///
/// The final line may carry a last token as well as the summary.
fn parse_chat_line(line: &[u8]) -> Result<Vec<StreamChunk>, ChatError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: ChatLine = serde_json::from_str(text)?;
    if let Some(error) = parsed.error {
        return Err(ChatError::Server(error));
    }

    let mut chunks = Vec::new();
    if let Some(message) = parsed.message {
        if !message.content.is_empty() {
            chunks.push(StreamChunk::Token(message.content));
        }
    }
    if parsed.done {
        chunks.push(StreamChunk::Done(ChatSummary {
            eval_count: parsed.eval_count,
            prompt_eval_count: parsed.prompt_eval_count,
            eval_duration_ns: parsed.eval_duration,
        }));
    }
    Ok(chunks)
}

/// `mistral` matches `mistral:latest`
fn has_model(tags: &TagsResponse, model: &str) -> bool {
    tags.models.iter().any(|m| {
        m.name == model
            || m.name.strip_suffix(":latest") == Some(model)
            || model.strip_suffix(":latest") == Some(m.name.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_line() {
        let line = br#"{"model":"m","message":{"role":"assistant","content":"Hel"},"done":false}"#;
        assert_eq!(
            parse_chat_line(line).unwrap(),
            vec![StreamChunk::Token("Hel".to_string())]
        );
    }

    #[test]
    fn test_parse_done_line() {
        let line = br#"{"message":{"role":"assistant","content":""},"done":true,"eval_count":12,"prompt_eval_count":30,"eval_duration":5000}"#;
        let chunks = parse_chat_line(line).unwrap();
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            StreamChunk::Done(summary) => {
                assert_eq!(summary.eval_count, 12);
                assert_eq!(summary.prompt_eval_count, 30);
            }
            other => panic!("unexpected chunk: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_line() {
        let line = br#"{"error":"model 'x' not found"}"#;
        assert!(matches!(parse_chat_line(line), Err(ChatError::Server(_))));
        assert!(matches!(parse_chat_line(b"{oops"), Err(ChatError::Parse(_))));
        assert!(parse_chat_line(b"  \n").unwrap().is_empty());
    }

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_value(ChatMessage::system("be brief")).unwrap();
        assert_eq!(json["role"], "system");
        assert_eq!(json["content"], "be brief");
    }

    #[test]
    fn test_has_model() {
        let tags = TagsResponse {
            models: vec![ModelTag {
                name: "mistral-faiss-rag:latest".to_string(),
            }],
        };
        assert!(has_model(&tags, "mistral-faiss-rag:latest"));
        assert!(has_model(&tags, "mistral-faiss-rag"));
        assert!(!has_model(&tags, "llama3.2"));
    }
}
