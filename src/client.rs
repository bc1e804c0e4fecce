//! The query client: caches, dedupes and invalidates store operations.
//!
//! [`QueryClient`] sits between callers and a [`DocumentStore`]. Reads go
//! through a response cache so that concurrent identical requests share one
//! fetch. Writes go through [`QueryClient::mutate`], which on success drops
//! every cached read of the mutated store and notifies its listeners.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use store_query::client::QueryClient;
//! use store_query::mock::MockStore;
//! use store_query::request::QueryRequest;
//!
//! # async fn demo() -> store_query::error::Result<()> {
//! let client = QueryClient::new(MockStore::<String>::new());
//! let request = Arc::new(QueryRequest::new("books"));
//!
//! let (first, _abort) = client.query(&request);
//! let (second, _abort) = client.query(&request);
//! assert!(first.ptr_eq(&second));
//!
//! let response = first.await?;
//! assert_eq!(response.number_of_documents, 0);
//! # Ok(())
//! # }
//! ```

mod cache;
mod response_cache;
mod subscriber;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, TryFutureExt};
use serde_json::Value;

pub use cache::StoreCache;
pub use response_cache::{IndexValuesCache, QueryCache, ResponseCache, SharedFetch};
pub use subscriber::{Listener, StoreChange, Subscriber, Trigger};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::request::{CreateStoreRequest, Fingerprinter, IndexValuesRequest, QueryRequest};
use crate::store::{AbortHandle, DocumentStore, QueryResponse, StoreFuture};

/// Shared fetch of a query response.
pub type QueryFetch<D> = SharedFetch<Arc<QueryResponse<D>>>;

/// Shared fetch of index values.
pub type IndexValuesFetch = SharedFetch<Arc<Vec<Value>>>;

/// Caching front for a [`DocumentStore`].
///
/// One client is meant to be shared (usually behind an `Arc`) by every
/// observer reading from the same store.
pub struct QueryClient<S: DocumentStore> {
    store: Arc<S>,
    queries: QueryCache<S::Document>,
    index_values: IndexValuesCache,
    subscriber: Subscriber,
    fingerprinter: Arc<Fingerprinter>,
    config: ClientConfig,
}

impl<S: DocumentStore> QueryClient<S> {
    /// Creates a new client with default configuration.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_config(store, ClientConfig::default())
    }

    /// Creates a new client with the given configuration.
    #[must_use]
    pub fn with_config(store: S, config: ClientConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Creates a client over a store that is also used elsewhere.
    #[must_use]
    pub fn from_shared(store: Arc<S>, config: ClientConfig) -> Self {
        let fingerprinter = Arc::new(Fingerprinter::new(config.fingerprint_ttl));
        Self {
            store,
            queries: QueryCache::new(Arc::clone(&fingerprinter)),
            index_values: IndexValuesCache::new(),
            subscriber: Subscriber::new(),
            fingerprinter,
            config,
        }
    }

    /// Runs a filtered query, reusing a cached or in-flight response if there is one.
    ///
    /// Every caller of an in-flight query gets its own abort handle; the store
    /// query is aborted only once all of them have aborted. Settled hits come
    /// with a handle that aborts nothing.
    pub fn query(&self, request: &Arc<QueryRequest>) -> (QueryFetch<S::Document>, AbortHandle) {
        if let Some(cached) = self.queries.lookup(request) {
            tracing::debug!(store_id = %request.store_id, "query served from cache");
            return cached;
        }

        tracing::debug!(store_id = %request.store_id, "query cache miss");
        let (fetch, abort) = self.store.run_query(request);
        self.queries
            .register(request, fetch.map_ok(Arc::new).boxed(), abort)
    }

    /// Reads the values of one index, reusing a cached or in-flight read.
    pub fn query_index_values(&self, request: &IndexValuesRequest) -> IndexValuesFetch {
        if let Some(cached) = self.index_values.lookup(request) {
            tracing::debug!(store_id = %request.store_id, field = %request.field, "index values served from cache");
            return cached;
        }

        tracing::debug!(store_id = %request.store_id, field = %request.field, "index values cache miss");
        let fetch = self
            .store
            .fetch_index_values(&request.store_id, &request.field)
            .map_ok(Arc::new)
            .boxed();
        self.index_values.register(request, fetch)
    }

    /// Awaits a store mutation and, if it succeeds, invalidates `store_id`.
    ///
    /// Both caches are cleared for the store and its listeners are notified
    /// before the result is returned. A failed mutation leaves everything as is.
    pub async fn mutate<T>(&self, store_id: &str, mutation: StoreFuture<T>) -> Result<T> {
        let result = mutation.await?;

        self.queries.clear_store(store_id);
        self.index_values.clear_store(store_id);
        self.subscriber.notify(store_id);

        Ok(result)
    }

    pub async fn create_store(&self, request: &CreateStoreRequest) -> Result<()> {
        let mutation = self.store.create_store(request);
        self.mutate(&request.store_id, mutation).await
    }

    pub async fn delete_store(&self, store_id: &str) -> Result<()> {
        let mutation = self.store.delete_store(store_id);
        self.mutate(store_id, mutation).await
    }

    pub async fn add_documents(&self, store_id: &str, documents: Vec<S::Document>) -> Result<()> {
        let mutation = self.store.add_documents(store_id, documents);
        self.mutate(store_id, mutation).await
    }

    /// Registers `listener` to be called whenever `store_id` is mutated.
    pub fn subscribe_to_store_change(&self, store_id: &str, listener: Listener) {
        self.subscriber.add_listener(store_id, listener);
    }

    pub fn unsubscribe_to_store_change(&self, store_id: &str, listener: &Listener) {
        self.subscriber.remove_listener(store_id, listener);
    }

    /// Number of listeners registered for `store_id`.
    pub fn listener_count(&self, store_id: &str) -> usize {
        self.subscriber.listener_count(store_id)
    }

    /// Gets the client configuration.
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub const fn fingerprinter(&self) -> &Arc<Fingerprinter> {
        &self.fingerprinter
    }

    /// Gets the underlying store.
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub const fn query_cache(&self) -> &QueryCache<S::Document> {
        &self.queries
    }

    pub const fn index_values_cache(&self) -> &IndexValuesCache {
        &self.index_values
    }

    /// How long request fingerprints are memoized.
    pub const fn fingerprint_ttl(&self) -> Duration {
        self.config.fingerprint_ttl
    }
}

impl<S: DocumentStore> fmt::Debug for QueryClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("subscriber", &self.subscriber)
            .field("fingerprinter", &self.fingerprinter)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
