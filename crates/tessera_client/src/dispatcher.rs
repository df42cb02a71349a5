//! RPC dispatch boundary and the write-response shape it yields.
//!
//! The dispatcher owns transport, routing retries, and deadline
//! enforcement; the session only hands it operations and batches and
//! interprets the responses.

use async_trait::async_trait;

use crate::batch::Batch;
use crate::error::RowError;
use crate::operation::Operation;

/// Top-level status attached to a write response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerStatus {
    pub code: i32,
    pub message: String,
}

/// Response to a write RPC, for a solo operation or a whole batch.
#[derive(Clone, Debug, Default)]
pub struct WriteResponse {
    /// Request-wide failure; when set, every row in the request failed.
    pub error: Option<ServerStatus>,
    /// Server-assigned write timestamp, fed to the consistency tracker.
    pub write_timestamp: Option<u64>,
    /// Failures for individual rows, ordered by ascending row index.
    pub per_row_errors: Vec<RowError>,
}

/// Sends operations and batches to the tablet server that owns them.
#[async_trait]
pub trait RpcDispatcher: Send + Sync {
    /// Send a single operation, resolving its tablet first if unbound.
    async fn send_operation(&self, op: &Operation) -> anyhow::Result<WriteResponse>;

    /// Send a batch to its bound tablet, honoring the batch deadline.
    async fn send_batch(&self, batch: &Batch) -> anyhow::Result<WriteResponse>;
}

/// Observes server-assigned write timestamps for external consistency.
pub trait ConsistencyTracker: Send + Sync {
    fn update_last_propagated(&self, timestamp: u64);
}
