//! Row operations and their completion plumbing.
//!
//! An `Operation` is created by the application, owned by the session while
//! buffered or in flight, and completed exactly once. The caller-visible
//! side is a `WriteReceipt`, a one-shot future resolving to the operation's
//! terminal `OpResult`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{OpResult, SessionError};
use crate::locator::RemoteTablet;
use crate::session::ExternalConsistencyMode;

static OP_SEQ: AtomicU64 = AtomicU64::new(1);

/// Cheap-clone handle naming a table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableHandle {
    name: Arc<str>,
}

impl TableHandle {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The kind of row mutation an operation carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// Tracks elapsed time against an optional timeout, reset at dispatch.
///
/// A zero timeout disables expiry; enforcement itself belongs to the
/// dispatcher, the session only carries the deadline.
#[derive(Debug)]
pub struct DeadlineTracker {
    started: Instant,
    timeout: Duration,
}

impl DeadlineTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    /// Restart the clock with a fresh timeout.
    pub fn reset(&mut self, timeout: Duration) {
        self.started = Instant::now();
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before expiry, or `None` when no timeout is set.
    pub fn remaining(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            return None;
        }
        Some(self.timeout.saturating_sub(self.started.elapsed()))
    }

    pub fn expired(&self) -> bool {
        !self.timeout.is_zero() && self.started.elapsed() >= self.timeout
    }
}

/// A single row mutation addressed to one table.
pub struct Operation {
    op_id: u64,
    table: TableHandle,
    row_key: Bytes,
    kind: MutationKind,
    payload: Bytes,
    pub(crate) timeout: Duration,
    pub(crate) consistency: ExternalConsistencyMode,
    pub(crate) priority: i32,
    pub(crate) attempt: u32,
    pub(crate) tablet: Option<Arc<RemoteTablet>>,
    completer: Option<oneshot::Sender<OpResult>>,
    receipt: Option<oneshot::Receiver<OpResult>>,
}

impl Operation {
    fn new(kind: MutationKind, table: TableHandle, row_key: Bytes, payload: Bytes) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            op_id: OP_SEQ.fetch_add(1, Ordering::Relaxed),
            table,
            row_key,
            kind,
            payload,
            timeout: Duration::ZERO,
            consistency: ExternalConsistencyMode::default(),
            priority: 0,
            attempt: 0,
            tablet: None,
            completer: Some(tx),
            receipt: Some(rx),
        }
    }

    pub fn insert(table: TableHandle, row_key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self::new(MutationKind::Insert, table, row_key.into(), payload.into())
    }

    pub fn update(table: TableHandle, row_key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self::new(MutationKind::Update, table, row_key.into(), payload.into())
    }

    pub fn delete(table: TableHandle, row_key: impl Into<Bytes>) -> Self {
        Self::new(MutationKind::Delete, table, row_key.into(), Bytes::new())
    }

    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    pub fn table(&self) -> &TableHandle {
        &self.table
    }

    pub fn row_key(&self) -> &Bytes {
        &self.row_key
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Tablet this operation resolved to, once known.
    pub fn tablet(&self) -> Option<&Arc<RemoteTablet>> {
        self.tablet.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn consistency(&self) -> ExternalConsistencyMode {
        self.consistency
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Deliver the terminal outcome. Take-once: later calls are no-ops,
    /// and a receiver that already went away is ignored.
    pub(crate) fn complete(&mut self, outcome: OpResult) {
        if let Some(tx) = self.completer.take() {
            let _ = tx.send(outcome);
        }
    }

    pub(crate) fn take_receipt(&mut self) -> Option<oneshot::Receiver<OpResult>> {
        self.receipt.take()
    }

    pub(crate) fn restore_receipt(&mut self, receipt: Option<oneshot::Receiver<OpResult>>) {
        self.receipt = receipt;
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("op_id", &self.op_id)
            .field("table", &self.table.name())
            .field("kind", &self.kind)
            .field("row_key", &self.row_key)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Caller-visible future for one applied operation.
///
/// Resolves when the operation has been accepted or rejected by the server,
/// or rejected locally.
pub struct WriteReceipt {
    rx: Option<oneshot::Receiver<OpResult>>,
}

impl WriteReceipt {
    pub(crate) fn new(rx: Option<oneshot::Receiver<OpResult>>) -> Self {
        Self { rx }
    }
}

impl Future for WriteReceipt {
    type Output = OpResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            None => Poll::Ready(Err(SessionError::Aborted)),
            Some(rx) => Pin::new(rx).poll(cx).map(|res| match res {
                Ok(outcome) => outcome,
                Err(_) => Err(SessionError::Aborted),
            }),
        }
    }
}
