//! Integration tests for configuration, intent extraction and live services
//!
//! These tests exercise the public API without a running model or backend.
//! Tests that need Ollama or Multipass are marked #[ignore].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use vmpilot::config::Config;
use vmpilot::events::{OperationOutcome, StreamEvent, TurnStatus};
use vmpilot::ollama::{extract_intent, ChatMessage, LanguageModel, OllamaClient, Role, StreamChunk};
use vmpilot::operation::{validate, Operation, ValidationError};
use vmpilot::vm::{BackendExecutor, MultipassBackend, VirtBackend};

fn env(pairs: &[(&str, &str)]) -> Config {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

/// Test that Config has sensible defaults
#[test]
fn test_config_defaults() {
    let config = env(&[]);

    assert_eq!(config.ollama_url, "http://localhost:11434");
    assert_eq!(config.listen_addr.port(), 5001);
    assert_eq!(config.exec_timeout, Duration::from_secs(120));
    assert!(config.launch_timeout > config.exec_timeout);
    assert!(config.history_limit > 0);
    assert!(config.multipass_bin.is_none());
}

/// Test that Config can be customized from the environment
#[test]
fn test_config_custom() {
    let config = env(&[
        ("OLLAMA_URL", "http://gpu-box:11434/"),
        ("OLLAMA_MODEL", "llama3"),
        ("PROXY_SERVER_PORT", "8088"),
        ("MULTIPASS_BIN", "/snap/bin/multipass"),
        ("MAX_CPUS", "4"),
    ]);

    assert_eq!(config.ollama_url, "http://gpu-box:11434");
    assert_eq!(config.ollama_model, "llama3");
    assert_eq!(config.listen_addr.port(), 8088);
    assert_eq!(config.limits.max_cpus, 4);
    assert_eq!(
        config.multipass_bin.as_deref(),
        Some(std::path::Path::new("/snap/bin/multipass"))
    );
}

/// Test that bad values are reported with their key
#[test]
fn test_config_rejects_bad_values() {
    let vars: HashMap<&str, &str> = [("EXEC_TIMEOUT", "soon")].into_iter().collect();
    let err = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap_err();
    assert!(err.to_string().contains("EXEC_TIMEOUT"));
}

/// Test ChatMessage construction with helper methods
#[test]
fn test_chat_message_construction() {
    let user_msg = ChatMessage::user("Hello, world!");
    assert_eq!(user_msg.role, Role::User);
    assert_eq!(user_msg.content, "Hello, world!");

    assert_eq!(ChatMessage::system("You are helpful.").role, Role::System);
    assert_eq!(ChatMessage::assistant("I can help!").role, Role::Assistant);
}

/// Test ChatMessage serialization
#[test]
fn test_chat_message_serialization() {
    let json = serde_json::to_string(&ChatMessage::user("test message")).unwrap();

    assert!(json.contains("\"role\":\"user\""));
    assert!(json.contains("\"content\":\"test message\""));
}

/// Test that model prose with a command marker becomes a valid operation
#[test]
fn test_extract_and_validate() {
    let text = "Sure, launching it:\n{\"operation\": \"create_vm\", \"name\": \"build1\", \"cpus\": \"2\", \"memory\": \"4G\"}";
    let op = validate(&extract_intent(text).unwrap()).unwrap();

    assert_eq!(
        op,
        Operation::CreateVm {
            name: "build1".to_string(),
            cpus: Some(2),
            memory_mb: Some(4096),
            disk_gb: None,
            image: None,
        }
    );
}

/// Test that plain prose carries no command
#[test]
fn test_plain_prose_has_no_intent() {
    assert!(extract_intent("Multipass VMs are lightweight Ubuntu instances.").is_none());
}

/// Test that unknown verbs and bad names are refused
#[test]
fn test_validation_failures() {
    let shell = extract_intent("multipass shell dev").unwrap();
    assert!(matches!(
        validate(&shell),
        Err(ValidationError::UnknownOperation(_))
    ));

    let bad_name = extract_intent(r#"{"operation": "stop_vm", "name": "rm -rf /"}"#).unwrap();
    assert!(matches!(
        validate(&bad_name),
        Err(ValidationError::InvalidName { .. })
    ));
}

/// Test that events serialize with their wire kind
#[test]
fn test_event_wire_kinds() {
    let event = StreamEvent::OperationResult(OperationOutcome::Inventory(vec![]));
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["kind"], event.kind());
    assert_eq!(json["payload"]["type"], "inventory");

    let done = StreamEvent::Done {
        status: TurnStatus::Completed,
    };
    assert_eq!(serde_json::to_value(&done).unwrap()["payload"]["status"], "completed");
}

// Integration tests that require external services

/// Test a streamed chat against a local Ollama
#[tokio::test]
#[ignore = "Requires Ollama running"]
async fn test_ollama_chat_stream() {
    let config = Config::from_env().unwrap();
    let client = OllamaClient::new(&config.ollama_url, &config.ollama_model);
    client.health().await.unwrap();

    let mut tokens = client
        .chat_stream(vec![ChatMessage::user("Reply with the single word: ready")])
        .await
        .unwrap();
    let mut text = String::new();
    let mut finished = false;
    while let Some(chunk) = tokens.next().await {
        match chunk.unwrap() {
            StreamChunk::Token(t) => text.push_str(&t),
            StreamChunk::Done(_) => finished = true,
        }
    }
    assert!(finished);
    assert!(!text.trim().is_empty());
}

/// Test listing instances through the real Multipass CLI
#[tokio::test]
#[ignore = "Requires Multipass installed"]
async fn test_multipass_list() {
    let backend = Arc::new(MultipassBackend::new(None));
    println!("{}", backend.version().await.unwrap());

    let executor = BackendExecutor::new(backend);
    let events: Vec<StreamEvent> = executor.execute(Operation::ListVms).unwrap().collect().await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        StreamEvent::OperationResult(OperationOutcome::Inventory(_))
    ));
}
