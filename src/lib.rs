//! vmpilot - natural-language control of local Multipass VMs
//!
//! Free-text requests are resolved by an Ollama model into validated VM
//! operations, executed against Multipass, and streamed back as ordered
//! events while a shared inventory cache keeps every view consistent.
//!
//! # Modules
//!
//! - `operation` - operation vocabulary and validation
//! - `events` - events streamed to clients
//! - `vm` - backend boundary, Multipass backend, executor, inventory cache
//! - `ollama` - Ollama chat client and command-marker extraction
//! - `agent` - intent resolver and session orchestrator
//! - `dashboard` - HTTP status panel and chat API
//! - `config` - environment configuration
//! - `metrics` - Prometheus metrics
//! - `tracing` - logging and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use vmpilot::{BackendExecutor, IntentResolver, InventoryCache, MultipassBackend, OllamaClient, Orchestrator};
//!
//! let executor = BackendExecutor::new(Arc::new(MultipassBackend::new(None)));
//! let inventory = InventoryCache::new(executor.clone());
//! let resolver = IntentResolver::new(Arc::new(OllamaClient::new("http://localhost:11434", "mistral")));
//! let session = Orchestrator::new(resolver, executor, inventory).open_session("demo");
//!
//! let mut events = session.send_user_turn("create a vm named build1 with 2 cpus")?;
//! while let Some(event) = events.next().await { /* ... */ }
//! ```

pub mod agent;
pub mod config;
pub mod dashboard;
pub mod events;
pub mod metrics;
pub mod ollama;
pub mod operation;
pub mod tracing;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use agent::{IntentResolver, Orchestrator, Session, SessionRegistry};
pub use events::{FailureKind, OperationOutcome, StreamEvent, TurnStatus};
pub use ollama::OllamaClient;
pub use operation::{validate, Operation, RawIntent};
pub use vm::{BackendExecutor, InventoryCache, MultipassBackend, VmRecord, VmStatus};
