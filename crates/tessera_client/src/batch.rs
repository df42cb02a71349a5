//! Per-tablet aggregation of operations dispatched as one RPC.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::locator::RemoteTablet;
use crate::operation::{DeadlineTracker, Operation, TableHandle};
use crate::session::ExternalConsistencyMode;

static BATCH_SEQ: AtomicU64 = AtomicU64::new(1);

/// Ordered group of operations bound to one tablet, sent as a single RPC.
///
/// Insertion order is significant: the server reports per-row errors by
/// position, so the error for row `i` refers to the i-th operation added.
/// A batch is created inside the session lock and receives its first
/// operation before the lock is released, so it is never observed empty.
pub struct Batch {
    batch_id: u64,
    table: TableHandle,
    tablet: Arc<RemoteTablet>,
    pub(crate) ops: Vec<Operation>,
    consistency: ExternalConsistencyMode,
    pub(crate) priority: i32,
    pub(crate) deadline: DeadlineTracker,
}

impl Batch {
    pub(crate) fn new(
        table: TableHandle,
        tablet: Arc<RemoteTablet>,
        consistency: ExternalConsistencyMode,
        priority: i32,
    ) -> Self {
        Self {
            batch_id: BATCH_SEQ.fetch_add(1, Ordering::Relaxed),
            table,
            tablet,
            ops: Vec::new(),
            consistency,
            priority,
            deadline: DeadlineTracker::new(Duration::ZERO),
        }
    }

    pub(crate) fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn table(&self) -> &TableHandle {
        &self.table
    }

    pub fn tablet(&self) -> &Arc<RemoteTablet> {
        &self.tablet
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn consistency(&self) -> ExternalConsistencyMode {
        self.consistency
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn deadline(&self) -> &DeadlineTracker {
        &self.deadline
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("batch_id", &self.batch_id)
            .field("table", &self.table.name())
            .field("tablet", &self.tablet.tablet_id)
            .field("rows", &self.ops.len())
            .finish_non_exhaustive()
    }
}
