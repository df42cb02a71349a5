//! Client-side write session for tablet-sharded tables.
//!
//! A [`WriteSession`] accepts row-level mutations addressed to tables whose
//! rows are sharded across tablets (one tablet per contiguous key range)
//! and dispatches them to the servers hosting each shard. Depending on the
//! flush mode, operations are sent immediately, accumulated into
//! per-tablet batches flushed on size/interval triggers, or held until an
//! explicit flush. The session tracks at most one in-flight batch per
//! tablet and surfaces backpressure when a full buffer overflows into one.
//!
//! Location resolution, transport, and wire encoding live behind the
//! [`TabletLocator`] and [`RpcDispatcher`] traits; the session supplies
//! the state machine in between.

mod batch;
mod dispatcher;
mod error;
mod locator;
mod operation;
mod scheduler;
mod session;

pub use batch::Batch;
pub use dispatcher::{ConsistencyTracker, RpcDispatcher, ServerStatus, WriteResponse};
pub use error::{OpResult, RowError, SessionError};
pub use locator::{LocationResult, RemoteTablet, TabletLocator};
pub use operation::{DeadlineTracker, MutationKind, Operation, TableHandle, WriteReceipt};
pub use scheduler::FlushScheduler;
pub use session::{
    ApplyError, ExternalConsistencyMode, FlushMode, SessionConfig, SessionStatsSnapshot,
    ThrottleSignal, WriteSession,
};
