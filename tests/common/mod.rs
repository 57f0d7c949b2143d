//! In-process fakes for the language model and the virtualization backend

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Semaphore;

use vmpilot::agent::{IntentResolver, Orchestrator, TurnStream};
use vmpilot::events::StreamEvent;
use vmpilot::ollama::{ChatError, ChatMessage, ChatSummary, LanguageModel, StreamChunk, TokenStream};
use vmpilot::vm::{
    BackendError, BackendExecutor, BackendRequest, InventoryCache, ProgressSink, VirtBackend,
    VmRecord, VmStatus,
};

/// One scripted model answer
pub enum Reply {
    /// Tokens followed by the end-of-stream marker
    Text(Vec<String>),
    /// Tokens, then the stream never produces anything again
    Stall(Vec<String>),
    /// The request fails
    Unreachable,
}

impl Reply {
    /// Split `text` into small tokens the way a model streams them
    pub fn say(text: &str) -> Self {
        Reply::Text(tokenize(text))
    }

    pub fn stall(text: &str) -> Self {
        Reply::Stall(tokenize(text))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(6).map(|c| c.iter().collect()).collect()
}

/// Language model that plays back queued replies in order
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
    health_hangs: AtomicBool,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            health_hangs: AtomicBool::new(false),
        }
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Health checks accept the request and never answer
    pub fn hang_health(&self) {
        self.health_hangs.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn chat_stream(&self, messages: Vec<ChatMessage>) -> Result<TokenStream, ChatError> {
        self.requests.lock().unwrap().push(messages);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::say("I have nothing scripted for that."));
        match reply {
            Reply::Unreachable => Err(ChatError::Server("connection refused".to_string())),
            Reply::Text(tokens) => {
                let mut items: Vec<Result<StreamChunk, ChatError>> =
                    tokens.into_iter().map(|t| Ok(StreamChunk::Token(t))).collect();
                items.push(Ok(StreamChunk::Done(ChatSummary::default())));
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
            Reply::Stall(tokens) => {
                let items: Vec<Result<StreamChunk, ChatError>> =
                    tokens.into_iter().map(|t| Ok(StreamChunk::Token(t))).collect();
                Ok(Box::pin(
                    futures_util::stream::iter(items).chain(futures_util::stream::pending()),
                ))
            }
        }
    }

    async fn health(&self) -> Result<(), ChatError> {
        if self.health_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// In-memory backend with optionally gated launches
pub struct MemoryBackend {
    vms: Mutex<BTreeMap<String, VmRecord>>,
    unreachable: AtomicBool,
    gated: bool,
    gate: Semaphore,
    failing: Mutex<HashSet<String>>,
    pub applied: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            vms: Mutex::new(BTreeMap::new()),
            unreachable: AtomicBool::new(false),
            gated: false,
            gate: Semaphore::new(0),
            failing: Mutex::new(HashSet::new()),
            applied: AtomicUsize::new(0),
        }
    }

    /// Launches block until [`MemoryBackend::open_gate`] is called
    pub fn gated() -> Self {
        Self {
            gated: true,
            ..Self::new()
        }
    }

    pub fn with_vm(self, record: VmRecord) -> Self {
        self.vms.lock().unwrap().insert(record.name.clone(), record);
        self
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(1000);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make every request for `name` fail
    pub fn fail_for(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "cannot connect to the multipass socket".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VirtBackend for MemoryBackend {
    async fn list(&self) -> Result<Vec<VmRecord>, BackendError> {
        self.check()?;
        Ok(self.vms.lock().unwrap().values().cloned().collect())
    }

    async fn info(&self, name: &str) -> Result<VmRecord, BackendError> {
        self.check()?;
        self.vms
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::CommandFailed {
                command: format!("multipass info {}", name),
                message: format!("instance \"{}\" does not exist", name),
            })
    }

    async fn apply(&self, request: &BackendRequest, progress: ProgressSink) -> Result<(), BackendError> {
        self.check()?;
        self.applied.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(request.vm_name()) {
            return Err(BackendError::CommandFailed {
                command: "multipass".to_string(),
                message: "launch failed: image not found".to_string(),
            });
        }

        match request {
            BackendRequest::Create(spec) => {
                let _ = progress.send("Retrieving image: 50%".to_string()).await;
                if self.gated {
                    if let Ok(permit) = self.gate.acquire().await {
                        permit.forget();
                    }
                }
                let _ = progress.send(format!("Launched: {}", spec.name)).await;
                let record = VmRecord::new(&spec.name, VmStatus::Running)
                    .with_resources(
                        spec.cpus.unwrap_or(1),
                        spec.memory_mb.unwrap_or(1024),
                        spec.disk_gb.unwrap_or(5),
                    )
                    .with_ip("10.0.0.10");
                self.vms.lock().unwrap().insert(spec.name.clone(), record);
            }
            BackendRequest::Start(name) | BackendRequest::Stop(name) => {
                let status = if matches!(request, BackendRequest::Start(_)) {
                    VmStatus::Running
                } else {
                    VmStatus::Stopped
                };
                let mut vms = self.vms.lock().unwrap();
                let vm = vms.get_mut(name).ok_or_else(|| BackendError::CommandFailed {
                    command: "multipass".to_string(),
                    message: format!("instance \"{}\" does not exist", name),
                })?;
                vm.status = status;
            }
            BackendRequest::Delete { name, .. } => {
                self.vms.lock().unwrap().remove(name);
            }
        }
        Ok(())
    }

    async fn version(&self) -> Result<String, BackendError> {
        self.check()?;
        Ok("multipass 1.14.0".to_string())
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub model: Arc<ScriptedModel>,
    pub backend: Arc<MemoryBackend>,
}

impl Harness {
    pub fn new(model: ScriptedModel, backend: MemoryBackend) -> Self {
        Self::with_timeouts(model, backend, Duration::from_secs(5), Duration::from_secs(5))
    }

    /// Harness whose model deadline and backend deadlines are `model_timeout`
    /// and `backend_timeout`
    pub fn with_timeouts(
        model: ScriptedModel,
        backend: MemoryBackend,
        model_timeout: Duration,
        backend_timeout: Duration,
    ) -> Self {
        let model = Arc::new(model);
        let backend = Arc::new(backend);
        let executor =
            BackendExecutor::new(backend.clone()).with_timeouts(backend_timeout, backend_timeout);
        let inventory = InventoryCache::new(executor.clone());
        let resolver = IntentResolver::new(model.clone()).with_timeout(model_timeout);
        Self {
            orchestrator: Orchestrator::new(resolver, executor, inventory),
            model,
            backend,
        }
    }

    pub fn inventory(&self) -> &InventoryCache {
        self.orchestrator.inventory()
    }
}

/// Read the whole turn, failing the test if it does not end in time
pub async fn collect(stream: TurnStream) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("turn did not finish")
}

/// Read events until one matches `pred`; returns everything read so far
pub async fn read_until<F>(stream: &mut TurnStream, pred: F) -> Vec<StreamEvent>
where
    F: Fn(&StreamEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended early");
        let hit = pred(&event);
        seen.push(event);
        if hit {
            return seen;
        }
    }
}

/// Every turn ends in exactly one `Done`, and it is last
pub fn assert_well_formed(events: &[StreamEvent]) {
    let dones = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Done { .. }))
        .count();
    assert_eq!(dones, 1, "expected exactly one Done in {:?}", events);
    assert!(
        matches!(events.last(), Some(StreamEvent::Done { .. })),
        "Done must be last: {:?}",
        events
    );
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert!(terminals <= 1, "more than one terminal event: {:?}", events);
}

/// Events other than text chunks
pub fn non_text(events: &[StreamEvent]) -> Vec<&StreamEvent> {
    events
        .iter()
        .filter(|e| !matches!(e, StreamEvent::TextChunk(_)))
        .collect()
}
