//! Contract consumed from the underlying document store.
//!
//! The store executes queries and mutations; this crate only caches, dedupes
//! and sequences them. Implementations return boxed `'static` futures so the
//! client can share and spawn them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::request::{CreateStoreRequest, FilterId, QueryRequest};

/// Future returned by every store operation.
pub type StoreFuture<T> = BoxFuture<'static, Result<T>>;

/// Number of documents a filter would yield if it were applied next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStats {
    pub number_of_documents: usize,
}

/// Result of a filtered query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse<D> {
    pub documents: Vec<D>,
    pub stats: BTreeMap<FilterId, FilterStats>,
    pub number_of_documents: usize,
}

impl<D> QueryResponse<D> {
    pub fn new(documents: Vec<D>) -> Self {
        let number_of_documents = documents.len();
        Self {
            documents,
            stats: BTreeMap::new(),
            number_of_documents,
        }
    }

    #[must_use]
    pub fn with_stats(mut self, stats: BTreeMap<FilterId, FilterStats>) -> Self {
        self.stats = stats;
        self
    }
}

impl<D> Default for QueryResponse<D> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Best-effort cancellation of an in-flight query.
///
/// Aborting only asks the store to stop; the query future still settles.
/// Handles handed out by [`SharedAbort::join`] abort the store query only
/// once every consumer of the shared fetch has aborted.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
    lease: Option<Arc<Lease>>,
}

#[derive(Debug)]
struct Lease {
    group: Arc<SharedAbort>,
    left: AtomicBool,
}

impl AbortHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle nobody listens to, returned for cache hits.
    #[must_use]
    pub fn noop() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn from_token(token: CancellationToken) -> Self {
        Self { token, lease: None }
    }

    pub fn abort(&self) {
        self.token.cancel();
        if let Some(lease) = &self.lease {
            if !lease.left.swap(true, Ordering::AcqRel) {
                lease.group.leave();
            }
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token observed by the store to learn about aborts.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// The store's abort handle for a fetch awaited by several consumers.
#[derive(Debug)]
pub struct SharedAbort {
    target: AbortHandle,
    consumers: AtomicUsize,
}

impl SharedAbort {
    #[must_use]
    pub fn new(target: AbortHandle) -> Arc<Self> {
        Arc::new(Self {
            target,
            consumers: AtomicUsize::new(0),
        })
    }

    /// Hands a handle to one more consumer.
    #[must_use]
    pub fn join(self: &Arc<Self>) -> AbortHandle {
        self.consumers.fetch_add(1, Ordering::AcqRel);
        AbortHandle {
            token: CancellationToken::new(),
            lease: Some(Arc::new(Lease {
                group: Arc::clone(self),
                left: AtomicBool::new(false),
            })),
        }
    }

    fn leave(&self) {
        if self.consumers.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::debug!("last consumer aborted, aborting store query");
            self.target.abort();
        }
    }

    /// Consumers that have joined and not aborted.
    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }

    /// Whether the store query itself has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.target.is_aborted()
    }
}

/// Operations the client needs from the document store.
pub trait DocumentStore: Send + Sync + 'static {
    type Document: Clone + Send + Sync + 'static;

    /// Runs a filtered query. The returned handle may be used to abort it.
    fn run_query(
        &self,
        request: &QueryRequest,
    ) -> (StoreFuture<QueryResponse<Self::Document>>, AbortHandle);

    /// Reads every value stored under the index on `field`.
    fn fetch_index_values(&self, store_id: &str, field: &str) -> StoreFuture<Vec<Value>>;

    fn create_store(&self, request: &CreateStoreRequest) -> StoreFuture<()>;

    fn delete_store(&self, store_id: &str) -> StoreFuture<()>;

    fn add_documents(&self, store_id: &str, documents: Vec<Self::Document>) -> StoreFuture<()>;
}
