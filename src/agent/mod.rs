//! Conversation agent: intent resolution and turn orchestration
//!
//! # Architecture
//!
//! ```text
//! User text → Session.send_user_turn()
//!                  ↓
//!           IntentResolver → Ollama /api/chat (streamed TextChunks)
//!                  ↓
//!           extract + validate command marker
//!                  ↓                       ↘
//!           BackendExecutor.execute(op)     PlainReply → Done
//!                  ↓
//!           OperationStarted / Progress / Result|Error
//!                  ↓
//!           InventoryCache updated → event forwarded → Done
//! ```

pub mod controller;
pub mod resolver;
pub mod sessions;

pub use controller::{Orchestrator, Session, TurnError, TurnState, TurnStream};
pub use resolver::{IntentResolver, ResolveError, Resolution, ResolverEvent, ResolverStream};
pub use sessions::{Conversation, ConversationTurn, Role, SessionRegistry};
