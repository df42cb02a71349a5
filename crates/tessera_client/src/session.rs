//! The client-side write session: accept, buffer, flush, track, complete.
//!
//! Three independent event sources mutate the same per-tablet state:
//! application calls (`apply`/`flush`), timer-driven periodic flushes, and
//! completion tasks for dispatched batches. A single session-wide mutex
//! serializes them; every critical section is short and free of I/O, and
//! operation futures always complete outside the lock.
//!
//! Per tablet, at most one batch accumulates while at most one previously
//! dispatched batch is in flight, and they are never the same batch. An
//! operation lives in exactly one place at a time: the lookup queue, an
//! accumulating batch, an in-flight batch, or a solo dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::batch::Batch;
use crate::dispatcher::{ConsistencyTracker, RpcDispatcher, WriteResponse};
use crate::error::{OpResult, RowError, SessionError};
use crate::locator::{LocationResult, RemoteTablet, TabletLocator};
use crate::operation::{Operation, WriteReceipt};
use crate::scheduler::FlushScheduler;

/// Hard cap on apply attempts for one operation.
const MAX_APPLY_ATTEMPTS: u32 = 10;

/// Policy governing when operations leave the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlushMode {
    /// Dispatch every operation immediately; nothing is ever buffered.
    #[default]
    Sync,
    /// Buffer, dispatching on a size or interval trigger.
    Background,
    /// Buffer, dispatching only on an explicit `flush`.
    Manual,
}

/// Ordering requirement conveyed to the server with every write and
/// updated from the response's write timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExternalConsistencyMode {
    #[default]
    NoConsistency,
    ClientPropagated,
    CommitWait,
}

/// Initial settings for a session. Everything here can also be changed
/// later through the setters, subject to the emptiness guard.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    pub consistency: ExternalConsistencyMode,
    /// Operations one batch may hold before it overflows.
    pub mutation_buffer_space: usize,
    /// Delay between a batch's first operation and its periodic flush.
    pub flush_interval: Duration,
    /// Per-dispatch timeout; zero disables expiry.
    pub timeout: Duration,
    pub priority: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Sync,
            consistency: ExternalConsistencyMode::NoConsistency,
            mutation_buffer_space: 1000,
            flush_interval: Duration::from_millis(1000),
            timeout: Duration::ZERO,
            priority: 0,
        }
    }
}

/// Completion of one dispatched batch, cloneable so the in-flight map, the
/// throttle signal, and chained flushes can all await the same event.
type BatchCompletion = Shared<BoxFuture<'static, ()>>;

fn completion_pair() -> (oneshot::Sender<()>, BatchCompletion) {
    let (tx, rx) = oneshot::channel::<()>();
    // A dropped sender still resolves the completion.
    (tx, rx.map(|_| ()).boxed().shared())
}

/// Why `apply` could not accept an operation right now.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The buffer overflowed into a batch still in flight; await the
    /// signal, reclaim the operation, and apply it again.
    #[error("the write buffer is full and the previous batch has not been flushed yet")]
    Throttled(ThrottleSignal),
}

/// Backpressure signal carrying the rejected operation and the completion
/// of the in-flight batch that blocked it.
pub struct ThrottleSignal {
    op: Operation,
    in_flight: BatchCompletion,
}

impl ThrottleSignal {
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Wait until the blocking batch completes, then reclaim the operation.
    pub async fn released(self) -> Operation {
        let Self { op, in_flight } = self;
        in_flight.await;
        op
    }

    /// Reclaim the operation without waiting.
    pub fn into_operation(self) -> Operation {
        self.op
    }
}

impl std::fmt::Debug for ThrottleSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleSignal")
            .field("op_id", &self.op.op_id())
            .finish_non_exhaustive()
    }
}

/// Per-tablet buffering state.
#[derive(Default)]
struct TabletState {
    accumulating: Option<Batch>,
    in_flight: Option<BatchCompletion>,
}

impl TabletState {
    fn is_empty(&self) -> bool {
        self.accumulating.is_none() && self.in_flight.is_none()
    }
}

struct SessionState {
    flush_mode: FlushMode,
    consistency: ExternalConsistencyMode,
    mutation_buffer_space: usize,
    flush_interval: Duration,
    timeout: Duration,
    priority: i32,
    /// Empty `TabletState` entries are removed eagerly, so map emptiness
    /// means no batch is accumulating or in flight anywhere.
    tablets: HashMap<Bytes, TabletState>,
    /// Operations whose tablet is being resolved. Order is irrelevant.
    pending_lookup: Vec<Operation>,
}

impl SessionState {
    fn buffers_empty(&self) -> bool {
        self.tablets.is_empty() && self.pending_lookup.is_empty()
    }

    fn drop_tablet_if_empty(&mut self, tablet_id: &Bytes) {
        if self
            .tablets
            .get(tablet_id)
            .is_some_and(TabletState::is_empty)
        {
            self.tablets.remove(tablet_id);
        }
    }
}

#[derive(Default)]
struct SessionStats {
    ops_applied: AtomicU64,
    batches_dispatched: AtomicU64,
    solo_dispatched: AtomicU64,
    flushes: AtomicU64,
    throttles: AtomicU64,
    lookup_retries: AtomicU64,
    stale_flushes: AtomicU64,
}

/// Point-in-time view of the session's monotonic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    /// Operations handed to `apply`.
    pub ops_applied: u64,
    /// Batches handed to the dispatcher.
    pub batches_dispatched: u64,
    /// Operations dispatched individually (sync mode or flush-rescued).
    pub solo_dispatched: u64,
    /// Explicit `flush` calls.
    pub flushes: u64,
    /// Throttle signals surfaced or absorbed by lookup retries.
    pub throttles: u64,
    /// Lookup continuations that re-entered `apply`.
    pub lookup_retries: u64,
    /// Flush attempts that found their batch already gone.
    pub stale_flushes: u64,
}

impl SessionStats {
    fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            solo_dispatched: self.solo_dispatched.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            throttles: self.throttles.load(Ordering::Relaxed),
            lookup_retries: self.lookup_retries.load(Ordering::Relaxed),
            stale_flushes: self.stale_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one locked flush attempt for a tablet.
enum FlushAttempt {
    /// The expected batch is no longer accumulating; nothing to do.
    AlreadyFlushed,
    /// A previous batch occupies the in-flight slot; retry when it's done.
    Blocked(BatchCompletion),
    /// The batch was handed to the dispatcher.
    Dispatched(BatchCompletion),
}

struct SessionShared {
    locator: Arc<dyn TabletLocator>,
    dispatcher: Arc<dyn RpcDispatcher>,
    tracker: Arc<dyn ConsistencyTracker>,
    scheduler: FlushScheduler,
    stats: SessionStats,
    state: Mutex<SessionState>,
}

/// Cheap-clone handle to one write session.
///
/// A session accumulates row operations into per-tablet batches and
/// dispatches them according to the flush mode. It is not transactional
/// and orders nothing across tablets; within a batch, dispatch order is
/// insertion order.
#[derive(Clone)]
pub struct WriteSession {
    shared: Arc<SessionShared>,
}

impl WriteSession {
    pub fn new(
        locator: Arc<dyn TabletLocator>,
        dispatcher: Arc<dyn RpcDispatcher>,
        tracker: Arc<dyn ConsistencyTracker>,
        config: SessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                locator,
                dispatcher,
                tracker,
                scheduler: FlushScheduler::new(),
                stats: SessionStats::default(),
                state: Mutex::new(SessionState {
                    flush_mode: config.flush_mode,
                    consistency: config.consistency,
                    mutation_buffer_space: config.mutation_buffer_space,
                    flush_interval: config.flush_interval,
                    timeout: config.timeout,
                    priority: config.priority,
                    tablets: HashMap::new(),
                    pending_lookup: Vec::new(),
                }),
            }),
        }
    }

    /// Change the flush mode.
    ///
    /// Fails with `SessionError::InvalidArgument` while any write is
    /// buffered, in flight, or waiting on a lookup. (The condition is
    /// really a state precondition; callers see the invalid-argument
    /// category regardless.)
    pub fn set_flush_mode(&self, mode: FlushMode) -> Result<(), SessionError> {
        let mut state = self.shared.state.lock();
        if !state.buffers_empty() {
            return Err(SessionError::invalid_argument(
                "cannot change flush mode when writes are buffered",
            ));
        }
        state.flush_mode = mode;
        Ok(())
    }

    /// Change the external consistency mode. Same emptiness guard as
    /// `set_flush_mode`.
    pub fn set_external_consistency_mode(
        &self,
        mode: ExternalConsistencyMode,
    ) -> Result<(), SessionError> {
        let mut state = self.shared.state.lock();
        if !state.buffers_empty() {
            return Err(SessionError::invalid_argument(
                "cannot change consistency mode when writes are buffered",
            ));
        }
        state.consistency = mode;
        Ok(())
    }

    /// Change how many operations one batch may buffer. Same emptiness
    /// guard as `set_flush_mode`.
    pub fn set_mutation_buffer_space(&self, ops: usize) -> Result<(), SessionError> {
        let mut state = self.shared.state.lock();
        if !state.buffers_empty() {
            return Err(SessionError::invalid_argument(
                "cannot change the buffer size when operations are buffered",
            ));
        }
        state.mutation_buffer_space = ops;
        Ok(())
    }

    /// Change the periodic flush interval for batches scheduled from now on.
    pub fn set_flush_interval(&self, interval: Duration) {
        self.shared.state.lock().flush_interval = interval;
    }

    /// Change the timeout stamped onto subsequent dispatches. Zero
    /// disables expiry.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.state.lock().timeout = timeout;
    }

    /// Change the priority stamped onto subsequent dispatches.
    pub fn set_priority(&self, priority: i32) {
        self.shared.state.lock().priority = priority;
    }

    /// Whether any operation is buffered, in flight, or waiting on a
    /// tablet lookup.
    pub fn has_pending_operations(&self) -> bool {
        !self.shared.state.lock().buffers_empty()
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Apply one operation according to the current flush mode.
    ///
    /// Returns a receipt resolving when the operation has been accepted or
    /// rejected by the server, or rejected locally. Never blocks on network
    /// I/O; buffering happens under a brief lock. In background mode an
    /// overflow into a still-in-flight batch yields
    /// `ApplyError::Throttled`, which returns the operation to the caller
    /// together with a completion to await before retrying.
    pub fn apply(&self, mut op: Operation) -> Result<WriteReceipt, ApplyError> {
        self.shared.stats.ops_applied.fetch_add(1, Ordering::Relaxed);
        let receipt = op.take_receipt();
        match self.apply_op(op) {
            Ok(()) => Ok(WriteReceipt::new(receipt)),
            Err(mut signal) => {
                signal.op.restore_receipt(receipt);
                Err(ApplyError::Throttled(signal))
            }
        }
    }

    /// Internal apply that owns the operation end to end; the terminal
    /// outcome flows through the operation's completion channel.
    fn apply_op(&self, mut op: Operation) -> Result<(), ThrottleSignal> {
        if op.attempt >= MAX_APPLY_ATTEMPTS {
            let attempts = op.attempt;
            op.complete(Err(SessionError::RetryExhausted { attempts }));
            return Ok(());
        }

        let (mode, consistency, timeout, priority) = {
            let state = self.shared.state.lock();
            (
                state.flush_mode,
                state.consistency,
                state.timeout,
                state.priority,
            )
        };

        if mode == FlushMode::Sync {
            op.timeout = timeout;
            op.consistency = consistency;
            op.priority = priority;
            self.dispatch_solo(op);
            return Ok(());
        }

        if let Some(tablet) = self.shared.locator.cached_tablet(op.table(), op.row_key()) {
            op.tablet = Some(Arc::clone(&tablet));
            return self.add_to_buffer(tablet, op);
        }

        // No cached location: park the operation and chase the lookup. The
        // continuation and `flush` race for ownership; whoever removes the
        // operation from the queue first wins.
        let op_id = op.op_id();
        let table = op.table().clone();
        let row_key = op.row_key().clone();
        {
            let mut state = self.shared.state.lock();
            op.attempt += 1;
            state.pending_lookup.push(op);
        }
        let session = self.clone();
        tokio::spawn(async move {
            if session.shared.locator.is_table_not_served(&table) {
                session.shared.locator.wait_for_table_creation(&table).await;
                session.lookup_settled(op_id, None).await;
            } else {
                let result = session.shared.locator.locate(&table, &row_key).await;
                session.lookup_settled(op_id, Some(result)).await;
            }
        });
        Ok(())
    }

    /// Retry continuation: runs when the tablet lookup for `op_id` settles.
    ///
    /// Safe to run more than once: only the invocation that removes the
    /// operation from the lookup queue acts, so an operation rescued by
    /// `flush` in the meantime turns later invocations into no-ops.
    async fn lookup_settled(&self, op_id: u64, result: Option<LocationResult>) {
        let Some(op) = self.take_pending(op_id) else {
            trace!(op_id, "lookup settled after the operation was flushed; nothing to do");
            return;
        };
        if let Some(result) = result {
            if let Some(recovery) = self.shared.locator.classify_lookup_failure(&op, &result) {
                // Recoverable condition: wait it out before applying again.
                recovery.await;
            }
        }
        self.shared
            .stats
            .lookup_retries
            .fetch_add(1, Ordering::Relaxed);
        self.reapply(op);
    }

    fn take_pending(&self, op_id: u64) -> Option<Operation> {
        let mut state = self.shared.state.lock();
        let idx = state
            .pending_lookup
            .iter()
            .position(|op| op.op_id() == op_id)?;
        Some(state.pending_lookup.swap_remove(idx))
    }

    /// Re-enter apply for an operation the session already owns. A
    /// throttle here re-parks the operation and chains a fresh
    /// continuation onto the blocking batch's completion.
    fn reapply(&self, op: Operation) {
        match self.apply_op(op) {
            Ok(()) => {}
            Err(signal) => {
                let op_id = signal.op.op_id();
                let ThrottleSignal { op, in_flight } = signal;
                {
                    let mut state = self.shared.state.lock();
                    state.pending_lookup.push(op);
                }
                let session = self.clone();
                tokio::spawn(async move {
                    in_flight.await;
                    session.lookup_settled(op_id, None).await;
                });
            }
        }
    }

    /// Dispatch a single operation directly (sync mode, or a
    /// lookup-pending operation rescued by `flush`). The returned
    /// completion resolves once the operation has settled.
    fn dispatch_solo(&self, mut op: Operation) -> BatchCompletion {
        self.shared
            .stats
            .solo_dispatched
            .fetch_add(1, Ordering::Relaxed);
        let (done_tx, done) = completion_pair();
        let session = self.clone();
        tokio::spawn(async move {
            match session.shared.dispatcher.send_operation(&op).await {
                Ok(resp) => session.complete_solo(&mut op, resp),
                Err(err) => {
                    warn!(op_id = op.op_id(), error = %err, "solo write dispatch failed");
                    op.complete(Err(SessionError::transport(&err)));
                }
            }
            let _ = done_tx.send(());
        });
        done
    }

    /// Settle one solo operation from its write response.
    fn complete_solo(&self, op: &mut Operation, resp: WriteResponse) {
        if let Some(status) = resp.error {
            op.complete(Err(SessionError::Server {
                code: status.code,
                message: status.message,
            }));
            return;
        }
        if let Some(ts) = resp.write_timestamp {
            self.shared.tracker.update_last_propagated(ts);
        }
        match resp.per_row_errors.into_iter().next() {
            None => op.complete(Ok(None)),
            Some(err) if err.row_index == 0 => op.complete(Ok(Some(err))),
            Some(err) => op.complete(Err(SessionError::InvalidResponse {
                message: format!(
                    "per-row error for row {} in a single-row write",
                    err.row_index
                ),
            })),
        }
    }

    /// Buffer one operation for its tablet (manual and background modes),
    /// flushing or throttling on overflow.
    fn add_to_buffer(
        &self,
        tablet: Arc<RemoteTablet>,
        mut op: Operation,
    ) -> Result<(), ThrottleSignal> {
        let tablet_id = tablet.tablet_id.clone();
        let mut state = self.shared.state.lock();
        let mode = state.flush_mode;
        let limit = state.mutation_buffer_space;
        let consistency = state.consistency;
        let priority = state.priority;
        let interval = state.flush_interval;

        // Would this operation push the accumulating batch over the limit?
        let over = state
            .tablets
            .get(&tablet_id)
            .and_then(|t| t.accumulating.as_ref())
            .map(|b| (b.batch_id(), b.len() + 1 > limit));
        if let Some((batch_id, true)) = over {
            if mode == FlushMode::Manual {
                op.complete(Err(SessionError::BufferFull));
                return Ok(());
            }
            match self.flush_tablet_locked(&mut state, &tablet_id, batch_id) {
                FlushAttempt::Blocked(in_flight) => {
                    // The full batch still flushes once the in-flight batch
                    // completes; in the meantime the caller gets
                    // backpressure and the operation back.
                    self.shared.stats.throttles.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        tablet = ?tablet_id,
                        "buffer full with a previous batch in flight, throttling"
                    );
                    let session = self.clone();
                    let chained = in_flight.clone();
                    let retry_tablet = tablet_id.clone();
                    tokio::spawn(async move {
                        chained.await;
                        session.flush_tablet(retry_tablet, batch_id).await;
                    });
                    return Err(ThrottleSignal { op, in_flight });
                }
                FlushAttempt::Dispatched(_) | FlushAttempt::AlreadyFlushed => {}
            }
        }

        let tablet_state = state.tablets.entry(tablet_id.clone()).or_default();
        let schedule_flush = tablet_state.accumulating.is_none();
        let batch = tablet_state.accumulating.get_or_insert_with(|| {
            Batch::new(op.table().clone(), Arc::clone(&tablet), consistency, priority)
        });
        let batch_id = batch.batch_id();
        batch.push(op);

        // A fresh batch is the only thing that schedules a periodic flush.
        if mode == FlushMode::Background && schedule_flush {
            trace!(tablet = ?tablet_id, "scheduling a periodic flush");
            let session = self.clone();
            let timer_tablet = tablet_id.clone();
            self.shared.scheduler.after(interval, async move {
                session.flush_tablet(timer_tablet, batch_id).await;
            });
        }
        Ok(())
    }

    /// Flush a specific accumulating batch, verifying it is still the one
    /// the caller saw. If a previous batch for the tablet is in flight the
    /// flush is chained onto its completion rather than dropped.
    fn flush_tablet(&self, tablet_id: Bytes, expected_batch: u64) -> BoxFuture<'static, ()> {
        let attempt = {
            let mut state = self.shared.state.lock();
            self.flush_tablet_locked(&mut state, &tablet_id, expected_batch)
        };
        match attempt {
            FlushAttempt::AlreadyFlushed => futures_util::future::ready(()).boxed(),
            FlushAttempt::Blocked(in_flight) => {
                let session = self.clone();
                async move {
                    in_flight.await;
                    trace!(
                        tablet = ?tablet_id,
                        "previous batch in flight is done, flushing this tablet again"
                    );
                    session.flush_tablet(tablet_id, expected_batch).await;
                }
                .boxed()
            }
            FlushAttempt::Dispatched(done) => done.boxed(),
        }
    }

    /// Locked core of `flush_tablet`: expected-batch check, in-flight
    /// check, and the hand-off to the dispatcher.
    fn flush_tablet_locked(
        &self,
        state: &mut SessionState,
        tablet_id: &Bytes,
        expected_batch: u64,
    ) -> FlushAttempt {
        let current = state
            .tablets
            .get(tablet_id)
            .and_then(|t| t.accumulating.as_ref())
            .map(Batch::batch_id);
        if current != Some(expected_batch) {
            self.shared
                .stats
                .stale_flushes
                .fetch_add(1, Ordering::Relaxed);
            trace!(tablet = ?tablet_id, "had to flush a tablet but it was already flushed");
            return FlushAttempt::AlreadyFlushed;
        }
        let Some(tablet_state) = state.tablets.get_mut(tablet_id) else {
            return FlushAttempt::AlreadyFlushed;
        };
        if let Some(in_flight) = tablet_state.in_flight.clone() {
            trace!(tablet = ?tablet_id, "tablet already in flight, deferring this flush");
            return FlushAttempt::Blocked(in_flight);
        }
        let Some(mut batch) = tablet_state.accumulating.take() else {
            // Unreachable while the lock is held; kept to mirror the
            // expected-batch check above.
            return FlushAttempt::AlreadyFlushed;
        };

        let (done_tx, done) = completion_pair();
        tablet_state.in_flight = Some(done.clone());
        batch.deadline.reset(state.timeout);
        batch.priority = state.priority;
        self.shared
            .stats
            .batches_dispatched
            .fetch_add(1, Ordering::Relaxed);

        let session = self.clone();
        let tablet_key = tablet_id.clone();
        tokio::spawn(async move {
            let result = session.shared.dispatcher.send_batch(&batch).await;
            // Operations settle first, then the in-flight slot clears, then
            // anything chained on the completion runs.
            session.complete_batch(batch, result);
            {
                let mut state = session.shared.state.lock();
                if let Some(tablet_state) = state.tablets.get_mut(&tablet_key) {
                    tablet_state.in_flight = None;
                }
                state.drop_tablet_if_empty(&tablet_key);
            }
            let _ = done_tx.send(());
        });
        FlushAttempt::Dispatched(done)
    }

    /// Settle every operation in a dispatched batch from the write
    /// response or transport failure, and feed the server timestamp to the
    /// consistency tracker.
    fn complete_batch(&self, mut batch: Batch, result: anyhow::Result<WriteResponse>) {
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    tablet = ?batch.tablet().tablet_id,
                    error = %err,
                    "batch dispatch failed"
                );
                let failure = SessionError::transport(&err);
                for op in batch.ops.iter_mut() {
                    op.complete(Err(failure.clone()));
                }
                return;
            }
        };
        trace!(rows = batch.len(), "got a write response for a batch");
        if let Some(status) = resp.error {
            let failure = SessionError::Server {
                code: status.code,
                message: status.message,
            };
            for op in batch.ops.iter_mut() {
                op.complete(Err(failure.clone()));
            }
            return;
        }
        if let Some(ts) = resp.write_timestamp {
            self.shared.tracker.update_last_propagated(ts);
        }
        let outcomes = align_row_errors(batch.len(), resp.per_row_errors);
        for (op, outcome) in batch.ops.iter_mut().zip(outcomes) {
            op.complete(outcome);
        }
    }

    /// Flush everything buffered right now: lookup-pending operations are
    /// dispatched solo and every accumulating batch is flushed to its
    /// tablet. The returned future completes when all of them have
    /// settled; operations applied after the snapshot are not covered.
    pub async fn flush(&self) {
        self.shared.stats.flushes.fetch_add(1, Ordering::Relaxed);
        trace!("flushing all tablets");
        let mut waits: Vec<BoxFuture<'static, ()>> = Vec::new();
        let targets: Vec<(Bytes, u64)> = {
            let mut state = self.shared.state.lock();
            // Dispatching a stranded operation here gives up its batching
            // opportunity; its continuation will find it gone and back off.
            let stranded = std::mem::take(&mut state.pending_lookup);
            for op in stranded {
                waits.push(self.dispatch_solo(op).boxed());
            }
            // Snapshot without clearing: flush_tablet removes entries
            // itself, re-checking identity under the lock.
            state
                .tablets
                .iter()
                .filter_map(|(id, t)| t.accumulating.as_ref().map(|b| (id.clone(), b.batch_id())))
                .collect()
        };
        for (tablet_id, batch_id) in targets {
            waits.push(self.flush_tablet(tablet_id, batch_id));
        }
        futures_util::future::join_all(waits).await;
    }

    /// Stop the flush scheduler and flush whatever is buffered. In-flight
    /// batches are not cancelled. Applying new operations afterwards is
    /// unsupported.
    pub async fn close(&self) {
        self.shared.scheduler.stop();
        self.flush().await;
    }
}

/// Map positionally ordered per-row errors onto `ops_len` operation slots.
///
/// Row `i` receives the error at the cursor iff that error names row `i`.
/// An error naming a row outside the batch poisons the whole batch as an
/// invalid response.
fn align_row_errors(ops_len: usize, errors: Vec<RowError>) -> Vec<OpResult> {
    if let Some(bad) = errors.iter().find(|e| e.row_index >= ops_len) {
        let failure = SessionError::InvalidResponse {
            message: format!(
                "per-row error for row {} in a batch of {} rows",
                bad.row_index, ops_len
            ),
        };
        return vec![Err(failure); ops_len];
    }
    let mut outcomes = Vec::with_capacity(ops_len);
    let mut cursor = errors.into_iter().peekable();
    for i in 0..ops_len {
        if cursor.peek().is_some_and(|err| err.row_index == i) {
            outcomes.push(Ok(cursor.next()));
        } else {
            outcomes.push(Ok(None));
        }
    }
    outcomes
}
