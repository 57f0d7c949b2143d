//! Session orchestrator - drives one conversation turn at a time
//!
//! Each turn runs on its own task and reports through a channel:
//!
//! ```text
//! send_user_turn ─► AwaitingIntent ──PlainReply──► RepliedDirectly ─┐
//!                        │                                          │
//!                   Operation(op)                                   ├─► Completed / Cancelled
//!                        ▼                                          │
//!                ExecutingOperation ──► Streaming ──terminal event──┘
//! ```
//!
//! Inventory updates are applied on the turn task right before the event
//! that caused them is forwarded, so a client that sees an
//! `OperationResult` can rely on the cache already reflecting it.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::resolver::{IntentResolver, ResolveError, Resolution, ResolverEvent};
use super::sessions::{Conversation, ConversationTurn};
use crate::events::{FailureKind, OperationFailure, OperationOutcome, StreamEvent, TurnStatus};
use crate::metrics::{TURNS_IN_FLIGHT, TURNS_TOTAL};
use crate::ollama::ChatMessage;
use crate::operation::Operation;
use crate::vm::{BackendExecutor, BackendRequest, InventoryCache, RefreshError, VmRecord};

/// Events of one turn, ending with `Done`
pub type TurnStream = ReceiverStream<StreamEvent>;

const EVENT_BUFFER: usize = 64;
const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Where an in-flight (or the most recent) turn is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    AwaitingIntent,
    ExecutingOperation,
    Streaming,
    RepliedDirectly,
    Completed,
    Cancelled,
}

/// Rejections from [`Session::send_user_turn`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("a turn is already in progress for this session")]
    TurnInProgress,
    #[error("message is empty")]
    EmptyInput,
}

impl TurnError {
    pub fn failure(&self) -> OperationFailure {
        let kind = match self {
            TurnError::TurnInProgress => FailureKind::TurnInProgress,
            TurnError::EmptyInput => FailureKind::Validation,
        };
        OperationFailure::new(kind, self.to_string())
    }
}

struct Shared {
    resolver: IntentResolver,
    executor: BackendExecutor,
    inventory: InventoryCache,
}

/// Shared entry point: opens sessions and answers status queries
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
    history_limit: usize,
}

impl Orchestrator {
    /// Create an orchestrator
    ///
    /// # Arguments
    /// * `resolver` - Intent resolver backed by the language model
    /// * `executor` - Backend executor (shares its per-VM leases with all sessions)
    /// * `inventory` - Inventory cache updated by every turn
    pub fn new(resolver: IntentResolver, executor: BackendExecutor, inventory: InventoryCache) -> Self {
        Self {
            shared: Arc::new(Shared {
                resolver,
                executor,
                inventory,
            }),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Number of past messages each new session sends as context
    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    pub fn open_session(&self, id: impl Into<String>) -> Session {
        Session {
            id: id.into(),
            orchestrator: self.clone(),
            state: Arc::new(Mutex::new(SessionState {
                conversation: Conversation::new(self.history_limit),
                active: None,
                last: None,
            })),
        }
    }

    /// Current inventory snapshot; never calls the backend
    pub fn list_vms(&self) -> Vec<VmRecord> {
        self.shared.inventory.list()
    }

    pub async fn refresh_inventory(&self) -> Result<Vec<VmRecord>, RefreshError> {
        self.shared
            .inventory
            .refresh()
            .await
            .map(|snapshot| snapshot.as_ref().clone())
    }

    pub fn inventory(&self) -> &InventoryCache {
        &self.shared.inventory
    }

    pub fn executor(&self) -> &BackendExecutor {
        &self.shared.executor
    }

    pub fn resolver(&self) -> &IntentResolver {
        &self.shared.resolver
    }
}

struct ActiveTurn {
    turn_id: String,
    cancel: watch::Sender<bool>,
    state: TurnState,
}

struct SessionState {
    conversation: Conversation,
    active: Option<ActiveTurn>,
    last: Option<TurnState>,
}

/// One client conversation; at most one turn in flight
pub struct Session {
    id: String,
    orchestrator: Orchestrator,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start a turn for `text`.
    ///
    /// Fails with [`TurnError::TurnInProgress`] while a previous turn has not
    /// delivered `Done`; that turn is not affected.
    pub fn send_user_turn(&self, text: &str) -> Result<TurnStream, TurnError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TurnError::EmptyInput);
        }

        let turn_id = Uuid::now_v7().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let context = {
            let mut state = self.lock();
            if state.active.is_some() {
                warn!(session_id = %self.id, "rejected turn while another is in flight");
                return Err(TurnError::TurnInProgress);
            }
            state.active = Some(ActiveTurn {
                turn_id: turn_id.clone(),
                cancel: cancel_tx,
                state: TurnState::AwaitingIntent,
            });
            let context = state.conversation.context();
            state.conversation.push(ConversationTurn::user(text));
            context
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = info_span!(
            "turn",
            session_id = %self.id,
            turn_id = %turn_id,
            otel.name = "turn"
        );
        let turn = TurnTask {
            shared: self.orchestrator.shared.clone(),
            state: self.state.clone(),
            out: Forwarder {
                tx,
                cancel: cancel_rx,
                cancelled: false,
            },
            reply: ConversationTurn::assistant(),
        };
        let text = text.to_string();
        TURNS_IN_FLIGHT.inc();
        tokio::spawn(turn.run(text, context).instrument(span));

        Ok(ReceiverStream::new(rx))
    }

    /// Ask the in-flight turn to stop forwarding. Returns `false` when idle.
    pub fn cancel(&self) -> bool {
        let state = self.lock();
        match &state.active {
            Some(active) => {
                info!(session_id = %self.id, turn_id = %active.turn_id, "cancel requested");
                active.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// State of the in-flight turn, or how the last one ended
    pub fn turn_state(&self) -> Option<TurnState> {
        let state = self.lock();
        state.active.as_ref().map(|a| a.state).or(state.last)
    }

    pub fn is_busy(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        self.lock().conversation.turns().to_vec()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sends events to the client until it cancels or goes away
struct Forwarder {
    tx: mpsc::Sender<StreamEvent>,
    cancel: watch::Receiver<bool>,
    cancelled: bool,
}

impl Forwarder {
    async fn send(&mut self, event: StreamEvent) {
        if !self.cancelled && *self.cancel.borrow() {
            self.cancelled = true;
        }
        if self.cancelled {
            return;
        }
        if self.tx.send(event).await.is_err() {
            // Receiver dropped: same as a cancel
            self.cancelled = true;
        }
    }
}

enum ResolveStep {
    Cancel(bool),
    Item(Option<Result<ResolverEvent, ResolveError>>),
}

struct TurnTask {
    shared: Arc<Shared>,
    state: Arc<Mutex<SessionState>>,
    out: Forwarder,
    reply: ConversationTurn,
}

impl TurnTask {
    async fn run(mut self, text: String, context: Vec<ChatMessage>) {
        info!(chars = text.len(), "turn started");
        let status = match self.resolve(&text, &context).await {
            None => TurnStatus::Cancelled,
            Some(Err(e)) => {
                warn!(error = %e, "resolution failed");
                let apology = format!(
                    "Sorry, I couldn't work out a reply right now ({}). No operation was performed.",
                    e
                );
                self.reply.push_chunk(apology.clone());
                self.out.send(StreamEvent::TextChunk(apology)).await;
                self.out
                    .send(StreamEvent::OperationError(OperationFailure::new(
                        e.failure_kind(),
                        e.to_string(),
                    )))
                    .await;
                TurnStatus::Failed
            }
            Some(Ok(Resolution::PlainReply)) => {
                self.set_state(TurnState::RepliedDirectly);
                TurnStatus::Completed
            }
            Some(Ok(Resolution::Operation(op))) => self.execute(op).await,
        };
        let status = if self.out.cancelled {
            TurnStatus::Cancelled
        } else {
            status
        };
        self.complete(status).await;
    }

    /// Forward resolver chunks; `None` when cancelled before a classification
    async fn resolve(
        &mut self,
        text: &str,
        context: &[ChatMessage],
    ) -> Option<Result<Resolution, ResolveError>> {
        let mut events = self.shared.resolver.resolve(text, context);
        let mut watching = true;
        loop {
            let step = tokio::select! {
                biased;
                changed = self.out.cancel.changed(), if watching => ResolveStep::Cancel(changed.is_ok()),
                item = events.next() => ResolveStep::Item(item),
            };
            match step {
                ResolveStep::Cancel(alive) => {
                    if !alive {
                        watching = false;
                    } else if *self.out.cancel.borrow() {
                        self.out.cancelled = true;
                        info!("turn cancelled while awaiting intent");
                        return None;
                    }
                }
                ResolveStep::Item(Some(Ok(ResolverEvent::Chunk(chunk)))) => {
                    self.reply.push_chunk(chunk.clone());
                    self.out.send(StreamEvent::TextChunk(chunk)).await;
                    if self.out.cancelled {
                        return None;
                    }
                }
                ResolveStep::Item(Some(Ok(ResolverEvent::Resolved(resolution)))) => {
                    return Some(Ok(resolution))
                }
                ResolveStep::Item(Some(Err(e))) => return Some(Err(e)),
                ResolveStep::Item(None) => {
                    return Some(Err(ResolveError::Unavailable(
                        "resolver ended without a classification".to_string(),
                    )))
                }
            }
        }
    }

    /// Drive the operation to its terminal event, applying cache updates
    async fn execute(&mut self, op: Operation) -> TurnStatus {
        self.set_state(TurnState::ExecutingOperation);
        self.reply.resolved_operation = Some(op.clone());

        let listed_at = self.shared.inventory.listing_started();
        let mut events = match self.shared.executor.execute(op.clone()) {
            Ok(events) => events,
            Err(conflict) => {
                self.out
                    .send(StreamEvent::OperationError(conflict.failure()))
                    .await;
                return TurnStatus::Failed;
            }
        };
        self.set_state(TurnState::Streaming);

        let inventory = &self.shared.inventory;
        let mut provisioned: Option<String> = None;
        let mut status = TurnStatus::Failed;
        // Keep draining after a cancel so the cache still sees the outcome.
        while let Some(event) = events.next().await {
            match &event {
                StreamEvent::OperationStarted(started) => {
                    if let Some(BackendRequest::Create(spec)) = BackendRequest::from_operation(started) {
                        if inventory.begin_provisioning(&spec) {
                            provisioned = Some(spec.name);
                        }
                    }
                }
                StreamEvent::OperationResult(outcome) => {
                    inventory.apply_outcome(outcome, listed_at);
                    provisioned = None;
                    status = TurnStatus::Completed;
                    if let OperationOutcome::Vm(record) = outcome {
                        info!(vm = %record.name, status = ?record.status, "operation applied");
                    }
                }
                StreamEvent::OperationError(failure) => {
                    if let Some(name) = provisioned.take() {
                        inventory.abandon_provisioning(&name);
                    }
                    warn!(error = %failure, "operation failed");
                    status = TurnStatus::Failed;
                }
                _ => {}
            }
            self.out.send(event).await;
        }
        if let Some(name) = provisioned {
            inventory.abandon_provisioning(&name);
        }
        status
    }

    async fn complete(mut self, status: TurnStatus) {
        let final_state = match status {
            TurnStatus::Cancelled => TurnState::Cancelled,
            _ => TurnState::Completed,
        };
        // The session stays busy until Done is queued; a full buffer keeps it busy
        let permit = self.out.tx.reserve().await;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let reply = std::mem::replace(&mut self.reply, ConversationTurn::assistant());
            state.conversation.push(reply);
            state.active = None;
            state.last = Some(final_state);
            if let Ok(permit) = permit {
                permit.send(StreamEvent::Done { status });
            }
        }
        TURNS_TOTAL.with_label_values(&[status.as_str()]).inc();
        TURNS_IN_FLIGHT.dec();
        info!(status = status.as_str(), "turn finished");
    }

    fn set_state(&self, next: TurnState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = state.active.as_mut() {
            active.state = next;
        }
    }
}
