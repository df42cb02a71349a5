//! Shared fakes for session integration tests: a seedable tablet locator
//! with gateable lookups, a dispatcher whose responses the test releases by
//! hand, and a recording consistency tracker.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use tessera_client::{
    Batch, ConsistencyTracker, ExternalConsistencyMode, LocationResult, MutationKind, Operation,
    RemoteTablet, RpcDispatcher, TableHandle, TabletLocator, WriteResponse,
};

/// Poll `f` until it yields a value, panicking after five seconds.
pub async fn wait_until<T>(mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = f() {
            return value;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for test condition"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub fn tablet(id: &str) -> Arc<RemoteTablet> {
    Arc::new(RemoteTablet::new(Bytes::copy_from_slice(id.as_bytes()), None))
}

/// Locator with a seedable cache. Lookups can be gated (parked until the
/// test releases them), can resolve without populating the cache, and can
/// report recoverable failures guarded by a notify.
pub struct FakeLocator {
    cache: Mutex<HashMap<Bytes, Arc<RemoteTablet>>>,
    resolvable: Mutex<HashMap<Bytes, Arc<RemoteTablet>>>,
    cache_on_locate: AtomicBool,
    gate_lookups: AtomicBool,
    parked: Mutex<VecDeque<oneshot::Sender<()>>>,
    not_served: Mutex<HashSet<String>>,
    recovery_gate: Mutex<Option<Arc<Notify>>>,
    locate_calls: AtomicU64,
}

impl FakeLocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(HashMap::new()),
            resolvable: Mutex::new(HashMap::new()),
            cache_on_locate: AtomicBool::new(true),
            gate_lookups: AtomicBool::new(false),
            parked: Mutex::new(VecDeque::new()),
            not_served: Mutex::new(HashSet::new()),
            recovery_gate: Mutex::new(None),
            locate_calls: AtomicU64::new(0),
        })
    }

    /// Seed the cache directly; `cached_tablet` will hit.
    pub fn add_cached(&self, row_key: &str, tablet: Arc<RemoteTablet>) {
        self.cache
            .lock()
            .insert(Bytes::copy_from_slice(row_key.as_bytes()), tablet);
    }

    /// Make `locate` discover this tablet (and cache it, unless caching is
    /// disabled).
    pub fn add_resolvable(&self, row_key: &str, tablet: Arc<RemoteTablet>) {
        self.resolvable
            .lock()
            .insert(Bytes::copy_from_slice(row_key.as_bytes()), tablet);
    }

    /// Make `locate` resolve without ever populating the cache, so every
    /// re-apply loops back through the lookup path.
    pub fn never_cache(&self) {
        self.cache_on_locate.store(false, Ordering::SeqCst);
    }

    /// Park subsequent `locate` calls until `release_lookup`.
    pub fn gate_lookups(&self) {
        self.gate_lookups.store(true, Ordering::SeqCst);
    }

    pub fn parked_lookups(&self) -> usize {
        self.parked.lock().len()
    }

    /// Release the oldest parked lookup. Returns false if none is parked.
    pub fn release_lookup(&self) -> bool {
        match self.parked.lock().pop_front() {
            Some(gate) => {
                let _ = gate.send(());
                true
            }
            None => false,
        }
    }

    pub fn mark_not_served(&self, table: &str) {
        self.not_served.lock().insert(table.to_string());
    }

    /// Serve a previously not-served table: seed its key's tablet so
    /// creation waiters make progress.
    pub fn create_table(&self, table: &str, row_key: &str, tablet: Arc<RemoteTablet>) {
        self.add_cached(row_key, tablet);
        self.not_served.lock().remove(table);
    }

    /// Report failed lookups as recoverable, gated on the given notify.
    pub fn set_recovery_gate(&self, gate: Arc<Notify>) {
        *self.recovery_gate.lock() = Some(gate);
    }

    pub fn locate_calls(&self) -> u64 {
        self.locate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TabletLocator for FakeLocator {
    fn cached_tablet(&self, _table: &TableHandle, row_key: &[u8]) -> Option<Arc<RemoteTablet>> {
        self.cache.lock().get(row_key).cloned()
    }

    async fn locate(&self, _table: &TableHandle, row_key: &[u8]) -> LocationResult {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        if self.gate_lookups.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            self.parked.lock().push_back(tx);
            let _ = rx.await;
        }
        let found = self.resolvable.lock().get(row_key).cloned();
        match found {
            Some(tablet) => {
                if self.cache_on_locate.load(Ordering::SeqCst) {
                    self.cache
                        .lock()
                        .insert(Bytes::copy_from_slice(row_key), Arc::clone(&tablet));
                }
                LocationResult::Resolved(tablet)
            }
            None => LocationResult::Failed(anyhow!("no tablet covers the key")),
        }
    }

    fn is_table_not_served(&self, table: &TableHandle) -> bool {
        self.not_served.lock().contains(table.name())
    }

    async fn wait_for_table_creation(&self, table: &TableHandle) {
        while self.not_served.lock().contains(table.name()) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn classify_lookup_failure(
        &self,
        _op: &Operation,
        result: &LocationResult,
    ) -> Option<BoxFuture<'static, ()>> {
        match result {
            LocationResult::Resolved(_) => None,
            LocationResult::Failed(_) => {
                let gate = self.recovery_gate.lock().clone()?;
                Some(async move { gate.notified().await }.boxed())
            }
        }
    }
}

/// One batch the dispatcher saw, recorded before any response is produced.
pub struct BatchRecord {
    pub tablet_id: Bytes,
    pub table: String,
    pub row_keys: Vec<Bytes>,
    pub kinds: Vec<MutationKind>,
    pub attempts: Vec<u32>,
    pub consistency: ExternalConsistencyMode,
    pub timeout: Duration,
    pub priority: i32,
}

/// One solo operation the dispatcher saw.
pub struct SoloRecord {
    pub row_key: Bytes,
    pub kind: MutationKind,
    pub attempt: u32,
    pub timeout: Duration,
    pub consistency: ExternalConsistencyMode,
    pub tablet_bound: bool,
}

/// A send held open by the manual dispatcher, waiting for the test to
/// respond.
pub struct PendingSend {
    pub rows: usize,
    pub tablet_id: Option<Bytes>,
    responder: oneshot::Sender<anyhow::Result<WriteResponse>>,
}

impl PendingSend {
    pub fn respond(self, resp: anyhow::Result<WriteResponse>) {
        let _ = self.responder.send(resp);
    }

    pub fn respond_ok(self) {
        self.respond(Ok(WriteResponse::default()));
    }
}

/// Dispatcher that records every send. In auto mode it answers immediately
/// with an empty success; in manual mode each send parks until the test
/// pops it with `next_pending` and responds.
pub struct FakeDispatcher {
    auto: bool,
    pub batches: Mutex<Vec<BatchRecord>>,
    pub solos: Mutex<Vec<SoloRecord>>,
    pending: Mutex<VecDeque<PendingSend>>,
}

impl FakeDispatcher {
    pub fn auto_ok() -> Arc<Self> {
        Arc::new(Self {
            auto: true,
            batches: Mutex::new(Vec::new()),
            solos: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            auto: false,
            batches: Mutex::new(Vec::new()),
            solos: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Wait for the next parked send.
    pub async fn next_pending(&self) -> PendingSend {
        wait_until(|| self.pending.lock().pop_front()).await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn solo_count(&self) -> usize {
        self.solos.lock().len()
    }

    async fn park(&self, rows: usize, tablet_id: Option<Bytes>) -> anyhow::Result<WriteResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(PendingSend {
            rows,
            tablet_id,
            responder: tx,
        });
        match rx.await {
            Ok(resp) => resp,
            Err(_) => Err(anyhow!("test dropped the responder")),
        }
    }
}

#[async_trait]
impl RpcDispatcher for FakeDispatcher {
    async fn send_operation(&self, op: &Operation) -> anyhow::Result<WriteResponse> {
        self.solos.lock().push(SoloRecord {
            row_key: op.row_key().clone(),
            kind: op.kind(),
            attempt: op.attempt(),
            timeout: op.timeout(),
            consistency: op.consistency(),
            tablet_bound: op.tablet().is_some(),
        });
        if self.auto {
            return Ok(WriteResponse::default());
        }
        self.park(1, None).await
    }

    async fn send_batch(&self, batch: &Batch) -> anyhow::Result<WriteResponse> {
        let tablet_id = batch.tablet().tablet_id.clone();
        self.batches.lock().push(BatchRecord {
            tablet_id: tablet_id.clone(),
            table: batch.table().name().to_string(),
            row_keys: batch.ops().iter().map(|op| op.row_key().clone()).collect(),
            kinds: batch.ops().iter().map(|op| op.kind()).collect(),
            attempts: batch.ops().iter().map(|op| op.attempt()).collect(),
            consistency: batch.consistency(),
            timeout: batch.deadline().timeout(),
            priority: batch.priority(),
        });
        if self.auto {
            return Ok(WriteResponse::default());
        }
        self.park(batch.len(), Some(tablet_id)).await
    }
}

/// Consistency tracker that records every propagated timestamp.
#[derive(Default)]
pub struct RecordingTracker {
    pub timestamps: Mutex<Vec<u64>>,
}

impl RecordingTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<u64> {
        self.timestamps.lock().clone()
    }
}

impl ConsistencyTracker for RecordingTracker {
    fn update_last_propagated(&self, timestamp: u64) {
        self.timestamps.lock().push(timestamp);
    }
}
