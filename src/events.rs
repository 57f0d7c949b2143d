//! Events streamed to the client during a turn
//!
//! A turn is a finite, ordered sequence of [`StreamEvent`]s that always ends in
//! exactly one [`StreamEvent::Done`]. Each operation inside a turn produces
//! exactly one terminal event: [`StreamEvent::OperationResult`] or
//! [`StreamEvent::OperationError`].

use serde::Serialize;

use crate::operation::Operation;
use crate::vm::VmRecord;

/// The unit passed to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Text produced by the model, forwarded as it arrives
    TextChunk(String),
    /// A mutating operation was dispatched to the backend
    OperationStarted(Operation),
    /// A progress line reported by the backend
    OperationProgress { vm: Option<String>, message: String },
    /// Terminal success of an operation
    OperationResult(OperationOutcome),
    /// Terminal failure of an operation (or of the turn's resolution)
    OperationError(OperationFailure),
    /// Last event of every turn
    Done { status: TurnStatus },
}

impl StreamEvent {
    /// Terminal events end an operation's event stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::OperationResult(_) | StreamEvent::OperationError(_)
        )
    }

    /// Event kind as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::TextChunk(_) => "text_chunk",
            StreamEvent::OperationStarted(_) => "operation_started",
            StreamEvent::OperationProgress { .. } => "operation_progress",
            StreamEvent::OperationResult(_) => "operation_result",
            StreamEvent::OperationError(_) => "operation_error",
            StreamEvent::Done { .. } => "done",
        }
    }
}

/// What a successful operation produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// Full, name-ordered VM list (from `ListVms`)
    Inventory(Vec<VmRecord>),
    /// The VM affected by a create/start/stop
    Vm(VmRecord),
    /// The VM removed by a delete (last known record)
    Removed(VmRecord),
}

impl OperationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            OperationOutcome::Inventory(_) => "inventory",
            OperationOutcome::Vm(_) => "vm",
            OperationOutcome::Removed(_) => "removed",
        }
    }
}

/// Error taxonomy carried across the streaming boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    ResolutionUnavailable,
    BackendUnavailable,
    BackendFailure,
    OperationConflict,
    UpstreamTimeout,
    TurnInProgress,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::ResolutionUnavailable => "resolution_unavailable",
            FailureKind::BackendUnavailable => "backend_unavailable",
            FailureKind::BackendFailure => "backend_failure",
            FailureKind::OperationConflict => "operation_conflict",
            FailureKind::UpstreamTimeout => "upstream_timeout",
            FailureKind::TurnInProgress => "turn_in_progress",
        }
    }
}

/// Structured cause of an `OperationError`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
}

impl OperationFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            vm: None,
        }
    }

    pub fn for_vm(mut self, vm: Option<&str>) -> Self {
        self.vm = vm.map(str::to_string);
        self
    }
}

impl std::fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.vm {
            Some(vm) => write!(f, "{} ({}): {}", self.kind.as_str(), vm, self.message),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
            TurnStatus::Cancelled => "cancelled",
        }
    }
}
