//! Virtualization backend boundary
//!
//! The executor talks to the virtualization tool only through [`VirtBackend`].
//! [`super::MultipassBackend`] is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::record::VmRecord;
use crate::events::FailureKind;
use crate::operation::Operation;

/// Where a backend writes raw progress lines while a command runs
pub type ProgressSink = mpsc::Sender<String>;

/// Parameters for creating a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub disk_gb: Option<u64>,
    pub image: Option<String>,
}

/// A mutating backend request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendRequest {
    Create(LaunchSpec),
    Start(String),
    Stop(String),
    Delete { name: String, purge: bool },
}

impl BackendRequest {
    /// Build the backend request for a mutating operation
    pub fn from_operation(op: &Operation) -> Option<Self> {
        match op {
            Operation::CreateVm {
                name,
                cpus,
                memory_mb,
                disk_gb,
                image,
            } => Some(BackendRequest::Create(LaunchSpec {
                name: name.clone(),
                cpus: *cpus,
                memory_mb: *memory_mb,
                disk_gb: *disk_gb,
                image: image.clone(),
            })),
            Operation::StartVm { name } => Some(BackendRequest::Start(name.clone())),
            Operation::StopVm { name } => Some(BackendRequest::Stop(name.clone())),
            Operation::DeleteVm { name, purge } => Some(BackendRequest::Delete {
                name: name.clone(),
                purge: *purge,
            }),
            Operation::ListVms | Operation::Converse { .. } => None,
        }
    }

    pub fn vm_name(&self) -> &str {
        match self {
            BackendRequest::Create(spec) => &spec.name,
            BackendRequest::Start(name) | BackendRequest::Stop(name) => name,
            BackendRequest::Delete { name, .. } => name,
        }
    }
}

/// Error type for backend calls
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The tool is not installed, not on PATH, or its daemon is unreachable
    #[error("virtualization backend unavailable: {0}")]
    Unavailable(String),
    /// The call exceeded its deadline
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    /// The tool ran and reported failure
    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
    /// The tool's output could not be understood
    #[error("unexpected backend output: {0}")]
    Parse(String),
}

impl BackendError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BackendError::Unavailable(_) => FailureKind::BackendUnavailable,
            BackendError::Timeout(_) => FailureKind::UpstreamTimeout,
            BackendError::CommandFailed { .. } | BackendError::Parse(_) => {
                FailureKind::BackendFailure
            }
        }
    }
}

/// Command-execution backend for VM lifecycle operations
#[async_trait]
pub trait VirtBackend: Send + Sync {
    /// All instances with their details
    async fn list(&self) -> Result<Vec<VmRecord>, BackendError>;

    /// Details of a single instance
    async fn info(&self, name: &str) -> Result<VmRecord, BackendError>;

    /// Run a mutating request, writing raw output lines to `progress`.
    async fn apply(
        &self,
        request: &BackendRequest,
        progress: ProgressSink,
    ) -> Result<(), BackendError>;

    /// Backend version string (used for health checks)
    async fn version(&self) -> Result<String, BackendError>;
}
