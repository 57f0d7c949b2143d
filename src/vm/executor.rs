//! Backend executor - runs validated operations against the backend
//!
//! Every call to [`BackendExecutor::execute`] produces a finite stream that
//! carries exactly one terminal event (`OperationResult` or `OperationError`).
//! Mutating operations hold a per-name lease for as long as their stream is
//! alive, so a second mutating call on the same VM is rejected up front
//! instead of being queued behind the first.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_stream::stream;
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::backend::{BackendError, BackendRequest, VirtBackend};
use super::record::{VmRecord, VmStatus};
use crate::events::{FailureKind, OperationFailure, OperationOutcome, StreamEvent};
use crate::metrics::{OPERATIONS_TOTAL, OPERATION_CONFLICTS_TOTAL, OPERATION_DURATION};
use crate::operation::Operation;

/// Lazy, finite event stream for one operation
pub type OperationStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Resources multipass applies when a launch leaves them out
const DEFAULT_CPUS: u32 = 1;
const DEFAULT_MEMORY_MB: u64 = 1024;
const DEFAULT_DISK_GB: u64 = 5;

/// Phases multipass prints while working
const PROGRESS_PHASES: &[&str] = &[
    "retrieving",
    "verifying",
    "preparing",
    "configuring",
    "creating",
    "starting",
    "waiting",
    "launching",
    "launched",
    "stopping",
    "stopped",
    "deleting",
    "deleted",
    "purging",
    "downloading",
    "extracting",
    "initializing",
];

/// Synchronous rejection from [`BackendExecutor::execute`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecuteError {
    #[error("an operation is already in flight for VM '{name}'")]
    Conflict { name: String },
}

impl ExecuteError {
    pub fn failure(&self) -> OperationFailure {
        match self {
            ExecuteError::Conflict { name } => {
                OperationFailure::new(FailureKind::OperationConflict, self.to_string())
                    .for_vm(Some(name))
            }
        }
    }
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Held by a mutating operation's stream; releases the name on drop
struct Lease {
    name: String,
    in_flight: InFlight,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut names = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        names.remove(&self.name);
        debug!(vm = %self.name, "released operation lease");
    }
}

/// Executes operations against a [`VirtBackend`]
#[derive(Clone)]
pub struct BackendExecutor {
    backend: Arc<dyn VirtBackend>,
    in_flight: InFlight,
    exec_timeout: Duration,
    launch_timeout: Duration,
}

impl BackendExecutor {
    pub fn new(backend: Arc<dyn VirtBackend>) -> Self {
        Self {
            backend,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
        }
    }

    /// Override the deadlines for ordinary commands and for launches
    pub fn with_timeouts(mut self, exec_timeout: Duration, launch_timeout: Duration) -> Self {
        self.exec_timeout = exec_timeout;
        self.launch_timeout = launch_timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn VirtBackend> {
        &self.backend
    }

    /// Deadline applied to every backend call except launches
    pub fn exec_timeout(&self) -> Duration {
        self.exec_timeout
    }

    /// Whether a mutating operation currently holds `name`
    pub fn is_busy(&self, name: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Start executing `op`.
    ///
    /// Returns the operation's event stream, or [`ExecuteError::Conflict`]
    /// when a mutating operation on the same VM has not finished yet.
    pub fn execute(&self, op: Operation) -> Result<OperationStream, ExecuteError> {
        match BackendRequest::from_operation(&op) {
            Some(request) => {
                let lease = self.acquire(&op, request.vm_name())?;
                Ok(self.run_mutation(op, request, lease))
            }
            None => match op {
                Operation::ListVms => Ok(self.run_list()),
                other => Ok(Box::pin(futures_util::stream::once(async move {
                    StreamEvent::OperationError(OperationFailure::new(
                        FailureKind::Validation,
                        format!("'{}' is not an executable operation", other.kind()),
                    ))
                }))),
            },
        }
    }

    fn acquire(&self, op: &Operation, name: &str) -> Result<Lease, ExecuteError> {
        let mut names = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !names.insert(name.to_string()) {
            OPERATION_CONFLICTS_TOTAL.with_label_values(&[op.kind()]).inc();
            warn!(vm = %name, operation = op.kind(), "rejected conflicting operation");
            return Err(ExecuteError::Conflict {
                name: name.to_string(),
            });
        }
        Ok(Lease {
            name: name.to_string(),
            in_flight: self.in_flight.clone(),
        })
    }

    fn run_list(&self) -> OperationStream {
        let backend = self.backend.clone();
        let deadline = self.exec_timeout;
        Box::pin(stream! {
            let start = Instant::now();
            let result = match tokio::time::timeout(deadline, backend.list()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(deadline)),
            };
            let event = match result {
                Ok(mut records) => {
                    records.sort_by(|a, b| a.name.cmp(&b.name));
                    debug!(count = records.len(), "listed VMs");
                    StreamEvent::OperationResult(OperationOutcome::Inventory(records))
                }
                Err(e) => {
                    warn!(error = %e, "list failed");
                    StreamEvent::OperationError(OperationFailure::new(e.failure_kind(), e.to_string()))
                }
            };
            record_metrics("list_vms", &event, start);
            yield event;
        })
    }

    fn run_mutation(&self, op: Operation, request: BackendRequest, lease: Lease) -> OperationStream {
        let backend = self.backend.clone();
        let exec_timeout = self.exec_timeout;
        let deadline = match request {
            BackendRequest::Create(_) => self.launch_timeout,
            _ => self.exec_timeout,
        };

        Box::pin(stream! {
            let _lease = lease;
            let start = Instant::now();
            let name = request.vm_name().to_string();
            info!(vm = %name, operation = op.kind(), "operation started");
            yield StreamEvent::OperationStarted(op.clone());

            let (tx, mut rx) = mpsc::channel::<String>(64);
            let call_backend = backend.clone();
            let call_request = request.clone();
            let call = tokio::time::timeout(deadline, async move {
                call_backend.apply(&call_request, tx).await
            });
            tokio::pin!(call);

            let applied = loop {
                let step = tokio::select! {
                    biased;
                    line = rx.recv() => Step::Line(line),
                    done = &mut call => Step::Finished(done),
                };
                match step {
                    Step::Line(Some(line)) => {
                        if let Some(message) = progress_line(&line) {
                            yield StreamEvent::OperationProgress { vm: Some(name.clone()), message };
                        }
                    }
                    Step::Line(None) => break (&mut call).await,
                    Step::Finished(done) => break done,
                }
            };
            while let Ok(line) = rx.try_recv() {
                if let Some(message) = progress_line(&line) {
                    yield StreamEvent::OperationProgress { vm: Some(name.clone()), message };
                }
            }

            let applied = match applied {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(deadline)),
            };

            let event = match applied {
                Ok(()) => {
                    let record = confirm(backend.as_ref(), &request, exec_timeout).await;
                    info!(vm = %name, operation = op.kind(), status = ?record.status, "operation finished");
                    match request {
                        BackendRequest::Delete { .. } => StreamEvent::OperationResult(OperationOutcome::Removed(record)),
                        _ => StreamEvent::OperationResult(OperationOutcome::Vm(record)),
                    }
                }
                Err(e) => {
                    warn!(vm = %name, operation = op.kind(), error = %e, "operation failed");
                    StreamEvent::OperationError(
                        OperationFailure::new(e.failure_kind(), e.to_string()).for_vm(Some(&name)),
                    )
                }
            };
            record_metrics(op.kind(), &event, start);
            yield event;
        })
    }
}

enum Step<T> {
    Line(Option<String>),
    Finished(T),
}

/// Record for the VM a successful request touched.
///
/// Asks the backend first; falls back to what the request implies.
async fn confirm(backend: &dyn VirtBackend, request: &BackendRequest, deadline: Duration) -> VmRecord {
    let name = request.vm_name();
    if let BackendRequest::Delete { .. } = request {
        return VmRecord::new(name, VmStatus::Deleting);
    }

    let reported = match tokio::time::timeout(deadline, backend.info(name)).await {
        Ok(Ok(record)) => Some(record),
        Ok(Err(e)) => {
            debug!(vm = %name, error = %e, "could not confirm VM state");
            None
        }
        Err(_) => None,
    };

    match (request, reported) {
        (BackendRequest::Create(_) | BackendRequest::Start(_), Some(mut record)) => {
            if !record.status.is_settled() {
                record.status = VmStatus::Running;
            }
            record
        }
        (_, Some(record)) => record,
        (BackendRequest::Create(spec), None) => VmRecord::new(name, VmStatus::Running).with_resources(
            spec.cpus.unwrap_or(DEFAULT_CPUS),
            spec.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
            spec.disk_gb.unwrap_or(DEFAULT_DISK_GB),
        ),
        (BackendRequest::Start(_), None) => VmRecord::new(name, VmStatus::Running),
        (_, None) => VmRecord::new(name, VmStatus::Stopped),
    }
}

fn record_metrics(kind: &str, event: &StreamEvent, start: Instant) {
    let outcome = match event {
        StreamEvent::OperationError(failure) => failure.kind.as_str(),
        _ => "ok",
    };
    OPERATIONS_TOTAL.with_label_values(&[kind, outcome]).inc();
    OPERATION_DURATION
        .with_label_values(&[kind])
        .observe(start.elapsed().as_secs_f64());
}

/// Turn a raw backend output segment into a progress message, if it is one.
pub fn progress_line(raw: &str) -> Option<String> {
    let line = raw
        .trim_start_matches(|c: char| {
            c.is_whitespace() || matches!(c, '|' | '/' | '-' | '\\') || ('\u{2800}'..='\u{28FF}').contains(&c)
        })
        .trim_end();
    if line.is_empty() {
        return None;
    }
    let lowered = line.to_ascii_lowercase();
    let is_phase = PROGRESS_PHASES.iter().any(|p| lowered.starts_with(p));
    if is_phase || line.contains('%') {
        Some(line.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::backend::fake::FakeBackend;
    use futures_util::StreamExt;

    fn executor(backend: FakeBackend) -> BackendExecutor {
        BackendExecutor::new(Arc::new(backend))
    }

    fn create(name: &str) -> Operation {
        Operation::CreateVm {
            name: name.to_string(),
            cpus: Some(2),
            memory_mb: Some(4096),
            disk_gb: None,
            image: None,
        }
    }

    #[test]
    fn test_progress_line() {
        assert_eq!(
            progress_line("⠋ Retrieving image: 42%").as_deref(),
            Some("Retrieving image: 42%")
        );
        assert_eq!(progress_line("Launched: build1").as_deref(), Some("Launched: build1"));
        assert_eq!(progress_line("   "), None);
        assert_eq!(progress_line("some unrelated chatter"), None);
    }

    #[tokio::test]
    async fn test_list_sorted_single_result() {
        let exec = executor(FakeBackend::with_vms(vec![
            VmRecord::new("zeta", VmStatus::Running),
            VmRecord::new("alpha", VmStatus::Stopped),
        ]));
        let events: Vec<_> = exec.execute(Operation::ListVms).unwrap().collect().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::OperationResult(OperationOutcome::Inventory(records)) => {
                let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
                assert_eq!(names, ["alpha", "zeta"]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_event_order() {
        let exec = executor(FakeBackend::default());
        let events: Vec<_> = exec.execute(create("build1")).unwrap().collect().await;

        assert!(matches!(events.first(), Some(StreamEvent::OperationStarted(_))));
        assert!(events[1..events.len() - 1]
            .iter()
            .all(|e| matches!(e, StreamEvent::OperationProgress { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        match events.last() {
            Some(StreamEvent::OperationResult(OperationOutcome::Vm(record))) => {
                assert_eq!(record.name, "build1");
                assert_eq!(record.status, VmStatus::Running);
                assert_eq!(record.cpus, 2);
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
        assert!(!exec.is_busy("build1"));
    }

    #[tokio::test]
    async fn test_conflict_while_in_flight() {
        let exec = executor(FakeBackend::default());
        let first = exec.execute(create("busy")).unwrap();
        assert!(exec.is_busy("busy"));

        let second = exec.execute(Operation::DeleteVm {
            name: "busy".to_string(),
            purge: true,
        });
        assert!(matches!(second, Err(ExecuteError::Conflict { ref name }) if name == "busy"));

        // Other names and reads are unaffected
        assert!(exec.execute(create("other")).is_ok());
        assert!(exec.execute(Operation::ListVms).is_ok());

        let events: Vec<_> = first.collect().await;
        assert!(matches!(events.last(), Some(StreamEvent::OperationResult(_))));
        assert!(exec.execute(create("busy")).is_ok());
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_lease() {
        let exec = executor(FakeBackend::default());
        let stream = exec.execute(create("tmp")).unwrap();
        drop(stream);
        assert!(!exec.is_busy("tmp"));
    }

    #[tokio::test]
    async fn test_backend_unavailable() {
        let backend = FakeBackend::default();
        *backend.unavailable.lock().unwrap() = true;
        let exec = executor(backend);
        let events: Vec<_> = exec
            .execute(Operation::StartVm {
                name: "x".to_string(),
            })
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::OperationStarted(_)));
        match &events[1] {
            StreamEvent::OperationError(failure) => {
                assert_eq!(failure.kind, FailureKind::BackendUnavailable);
                assert_eq!(failure.vm.as_deref(), Some("x"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_reports_removed() {
        let exec = executor(FakeBackend::with_vms(vec![VmRecord::new("old", VmStatus::Stopped)]));
        let events: Vec<_> = exec
            .execute(Operation::DeleteVm {
                name: "old".to_string(),
                purge: true,
            })
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::OperationResult(OperationOutcome::Removed(r))) if r.name == "old"
        ));
    }

    #[tokio::test]
    async fn test_list_timeout() {
        let backend = FakeBackend::default();
        *backend.list_delay.lock().unwrap() = Some(Duration::from_millis(200));
        let exec = executor(backend).with_timeouts(Duration::from_millis(20), Duration::from_secs(1));
        let events: Vec<_> = exec.execute(Operation::ListVms).unwrap().collect().await;
        assert!(matches!(
            &events[0],
            StreamEvent::OperationError(f) if f.kind == FailureKind::UpstreamTimeout
        ));
    }

    #[tokio::test]
    async fn test_converse_is_not_executable() {
        let exec = executor(FakeBackend::default());
        let events: Vec<_> = exec
            .execute(Operation::Converse {
                text: "hi".to_string(),
            })
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            &events[0],
            StreamEvent::OperationError(f) if f.kind == FailureKind::Validation
        ));
    }
}
