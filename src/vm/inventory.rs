//! Inventory cache - the shared view of VM state
//!
//! Sessions and the status panel read the same published snapshot. Writers
//! serialize on one mutex and publish a fresh `Arc<Vec<VmRecord>>` with a
//! single pointer swap, so readers never wait on a backend call.
//!
//! # Architecture
//!
//! ```text
//!  apply_result / remove / begin_provisioning        list() / snapshot()
//!              │                                            ▲
//!              ▼                                            │
//!   ┌────────────────────┐   publish (swap Arc)   ┌──────────────────┐
//!   │ WriterState (Mutex)│ ─────────────────────► │ snapshot (RwLock)│
//!   └────────────────────┘                        └──────────────────┘
//!              ▲
//!              │ replace_listing
//!    refresh() ── at most one ListVms in flight; callers share its result
//! ```
//!
//! Every write bumps a generation counter. A listing remembers the generation
//! it started at and never overrides a VM written after that point, nor a
//! listing that started later.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

use super::backend::LaunchSpec;
use super::executor::BackendExecutor;
use super::record::{VmRecord, VmStatus};
use crate::events::{OperationFailure, OperationOutcome, StreamEvent};
use crate::metrics::{INVENTORY_REFRESHES_TOTAL, INVENTORY_VMS};
use crate::operation::Operation;

/// Why a refresh did not replace the snapshot
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("inventory refresh failed: {0}")]
    Failed(OperationFailure),
    #[error("inventory refresh ended without a result")]
    NoResult,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Arc<Vec<VmRecord>>, RefreshError>>>;

#[derive(Default)]
struct WriterState {
    records: BTreeMap<String, VmRecord>,
    /// Creates that have started but not finished; refresh keeps these
    provisioning: HashSet<String>,
    generation: u64,
    /// Generation of the last per-VM write for each name
    touched: HashMap<String, u64>,
    /// Start generation of the newest listing applied
    listed: u64,
}

impl WriterState {
    fn touch(&mut self, name: &str) {
        self.generation += 1;
        self.touched.insert(name.to_string(), self.generation);
    }

    fn written_since(&self, name: &str, since: u64) -> bool {
        self.touched.get(name).is_some_and(|g| *g > since)
    }
}

struct Inner {
    executor: BackendExecutor,
    writer: Mutex<WriterState>,
    snapshot: RwLock<Arc<Vec<VmRecord>>>,
    refreshing: Mutex<Option<RefreshFuture>>,
}

/// Single owner of VM records, shared by handle
#[derive(Clone)]
pub struct InventoryCache {
    inner: Arc<Inner>,
}

impl InventoryCache {
    /// Create an empty cache that refreshes through `executor`
    pub fn new(executor: BackendExecutor) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                writer: Mutex::new(WriterState::default()),
                snapshot: RwLock::new(Arc::new(Vec::new())),
                refreshing: Mutex::new(None),
            }),
        }
    }

    /// Current records ordered by name
    pub fn list(&self) -> Vec<VmRecord> {
        self.snapshot().as_ref().clone()
    }

    /// Current published snapshot
    pub fn snapshot(&self) -> Arc<Vec<VmRecord>> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<VmRecord> {
        self.snapshot().iter().find(|r| r.name == name).cloned()
    }

    /// Insert or update the record for a confirmed VM state
    pub fn apply_result(&self, record: VmRecord) {
        self.write(|state| {
            state.touch(&record.name);
            state.provisioning.remove(&record.name);
            let merged = match state.records.get(&record.name) {
                Some(previous) => record.merge_missing(previous),
                None => record,
            };
            state.records.insert(merged.name.clone(), merged);
        });
    }

    /// Drop the record for a deleted VM
    pub fn remove(&self, name: &str) {
        self.write(|state| {
            state.touch(name);
            state.provisioning.remove(name);
            state.records.remove(name);
        });
    }

    /// Record an accepted create as `Provisioning`.
    ///
    /// Returns `false` (and changes nothing) when a record with that name
    /// already exists.
    pub fn begin_provisioning(&self, spec: &LaunchSpec) -> bool {
        let mut inserted = false;
        self.write(|state| {
            if state.records.contains_key(&spec.name) {
                return;
            }
            let record = VmRecord::new(&spec.name, VmStatus::Provisioning).with_resources(
                spec.cpus.unwrap_or(0),
                spec.memory_mb.unwrap_or(0),
                spec.disk_gb.unwrap_or(0),
            );
            state.touch(&spec.name);
            state.records.insert(spec.name.clone(), record);
            state.provisioning.insert(spec.name.clone());
            inserted = true;
        });
        inserted
    }

    /// Remove a provisioning record whose create failed
    pub fn abandon_provisioning(&self, name: &str) {
        self.write(|state| {
            if state.provisioning.remove(name)
                && state.records.get(name).map(|r| r.status) == Some(VmStatus::Provisioning)
            {
                state.touch(name);
                state.records.remove(name);
            }
        });
    }

    /// Apply a successful operation outcome.
    ///
    /// `listed_at` is the value [`InventoryCache::listing_started`] returned
    /// before the operation ran; only listings use it.
    pub fn apply_outcome(&self, outcome: &OperationOutcome, listed_at: u64) {
        match outcome {
            OperationOutcome::Inventory(records) => self.replace_listing(records.clone(), listed_at),
            OperationOutcome::Vm(record) => self.apply_result(record.clone()),
            OperationOutcome::Removed(record) => self.remove(&record.name),
        }
    }

    /// Mark the start of a backend listing and return its generation
    pub fn listing_started(&self) -> u64 {
        let mut state = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
        state.generation += 1;
        state.generation
    }

    /// Replace every record with a listing taken just now
    pub fn replace_all(&self, records: Vec<VmRecord>) {
        let since = self.listing_started();
        self.replace_listing(records, since);
    }

    /// Replace records with a listing that started at generation `since`.
    ///
    /// VMs written after `since` keep their cached state, and so do records
    /// for creates still in flight. A listing older than one already applied
    /// is ignored.
    pub fn replace_listing(&self, records: Vec<VmRecord>, since: u64) {
        self.write(|state| {
            if since < state.listed {
                debug!(since, listed = state.listed, "ignoring stale listing");
                return;
            }
            state.listed = since;

            let mut next: BTreeMap<String, VmRecord> = BTreeMap::new();
            for record in records {
                if state.written_since(&record.name, since) {
                    continue;
                }
                let merged = match state.records.get(&record.name) {
                    Some(previous) => record.merge_missing(previous),
                    None => record,
                };
                next.insert(merged.name.clone(), merged);
            }
            for (name, record) in &state.records {
                if state.written_since(name, since) || state.provisioning.contains(name) {
                    next.insert(name.clone(), record.clone());
                }
            }
            state.records = next;
            state.touched.retain(|_, g| *g > since);
        });
    }

    /// Re-list the backend and replace the cache.
    ///
    /// Concurrent callers share one in-flight listing.
    pub async fn refresh(&self) -> Result<Arc<Vec<VmRecord>>, RefreshError> {
        let pending = {
            let mut slot = self.inner.refreshing.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let cache = self.clone();
                    let pending = async move {
                        let result = cache.run_refresh().await;
                        *cache.inner.refreshing.lock().unwrap_or_else(|e| e.into_inner()) = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    async fn run_refresh(&self) -> Result<Arc<Vec<VmRecord>>, RefreshError> {
        debug!("refreshing inventory");
        let since = self.listing_started();
        // ListVms holds no lease, so this never conflicts.
        let mut events = match self.inner.executor.execute(Operation::ListVms) {
            Ok(events) => events,
            Err(e) => return Err(RefreshError::Failed(e.failure())),
        };
        let result = loop {
            match events.next().await {
                Some(StreamEvent::OperationResult(OperationOutcome::Inventory(records))) => {
                    self.replace_listing(records, since);
                    break Ok(self.snapshot());
                }
                Some(StreamEvent::OperationError(failure)) => break Err(RefreshError::Failed(failure)),
                Some(_) => continue,
                None => break Err(RefreshError::NoResult),
            }
        };
        let label = if result.is_ok() { "ok" } else { "error" };
        INVENTORY_REFRESHES_TOTAL.with_label_values(&[label]).inc();
        result
    }

    /// Start the background refresher task
    ///
    /// Re-lists the backend every `interval`; failures are logged and retried
    /// on the next tick.
    pub fn start_refresher(cache: InventoryCache, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if let Err(e) = cache.refresh().await {
                    warn!(error = %e, "inventory refresh failed");
                }
            }
        })
    }

    fn write(&self, mutate: impl FnOnce(&mut WriterState)) {
        let mut state = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
        mutate(&mut state);
        let published: Arc<Vec<VmRecord>> = Arc::new(state.records.values().cloned().collect());
        INVENTORY_VMS.set(published.len() as f64);
        // Swap while still holding the writer lock so snapshots publish in order
        *self.inner.snapshot.write().unwrap_or_else(|e| e.into_inner()) = published;
    }
}
