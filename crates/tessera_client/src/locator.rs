//! Tablet location boundary consumed by the session.
//!
//! The session treats the locator's cache as read-only: it probes with
//! `cached_tablet` on the fast path and falls back to `locate`, parking the
//! operation until the lookup settles.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::operation::{Operation, TableHandle};

/// One tablet resolved from a row key: a contiguous key-range shard hosted
/// by a single server at a time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTablet {
    pub tablet_id: Bytes,
    pub leader: Option<SocketAddr>,
}

impl RemoteTablet {
    pub fn new(tablet_id: impl Into<Bytes>, leader: Option<SocketAddr>) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            leader,
        }
    }
}

/// Typed outcome of a location lookup RPC.
#[derive(Debug)]
pub enum LocationResult {
    /// The location cache now covers the key; re-applying will hit it.
    Resolved(Arc<RemoteTablet>),
    /// The lookup failed; the locator classifies whether it is recoverable.
    Failed(anyhow::Error),
}

/// Resolves (table, row key) to the tablet hosting that key's range.
#[async_trait]
pub trait TabletLocator: Send + Sync {
    /// Non-blocking cache probe.
    fn cached_tablet(&self, table: &TableHandle, row_key: &[u8]) -> Option<Arc<RemoteTablet>>;

    /// Resolve a key's tablet, refreshing the location cache.
    async fn locate(&self, table: &TableHandle, row_key: &[u8]) -> LocationResult;

    /// Whether the table is known to exist but is not served yet.
    fn is_table_not_served(&self, table: &TableHandle) -> bool;

    /// Completes once a not-yet-served table starts being served.
    async fn wait_for_table_creation(&self, table: &TableHandle);

    /// Classify a settled lookup. `Some` carries a recovery future the
    /// session awaits before applying the operation again; `None` means the
    /// operation may be applied again right away.
    fn classify_lookup_failure(
        &self,
        op: &Operation,
        result: &LocationResult,
    ) -> Option<BoxFuture<'static, ()>>;
}
