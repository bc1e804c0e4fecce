use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use serde_json::Value;

use crate::error::Result;
use crate::request::{Fingerprint, Fingerprinter, IndexValuesRequest, QueryRequest};
use crate::store::{AbortHandle, QueryResponse, SharedAbort, StoreFuture};

use super::cache::StoreCache;

/// A fetch that any number of callers can await; all of them see the same result.
pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

#[derive(Clone)]
struct Pending<V> {
    generation: u64,
    fetch: SharedFetch<V>,
    abort: Arc<SharedAbort>,
}

/// Settled responses plus the fetches still in flight, per store and key.
///
/// At most one fetch per key is tracked. When a fetch settles, its result is
/// promoted into the resolved cache only if that same fetch still owns the
/// pending slot; a slot evicted by [`clear_store`](Self::clear_store) or taken
/// over by a later registration makes the result obsolete.
pub struct ResponseCache<K, V> {
    resolved: Arc<StoreCache<K, V>>,
    pending: Arc<StoreCache<K, Pending<V>>>,
    generation: AtomicU64,
}

impl<K, V> ResponseCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            resolved: Arc::new(StoreCache::new()),
            pending: Arc::new(StoreCache::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the settled value if there is one, else the in-flight fetch.
    pub fn lookup(&self, store_id: &str, key: &K) -> Option<SharedFetch<V>> {
        if let Some(value) = self.resolved.get(store_id, key) {
            tracing::trace!(store_id, ?key, "resolved cache hit");
            return Some(future::ready(Ok(value)).boxed().shared());
        }
        self.live_pending(store_id, key).map(|pending| pending.fetch)
    }

    /// Like [`lookup`](Self::lookup), but also hands out an abort handle.
    ///
    /// A resolved hit gets a handle that aborts nothing. A pending hit joins the
    /// fetch's [`SharedAbort`], so the store query is aborted only once every
    /// consumer has aborted.
    pub fn lookup_abortable(&self, store_id: &str, key: &K) -> Option<(SharedFetch<V>, AbortHandle)> {
        if let Some(value) = self.resolved.get(store_id, key) {
            tracing::trace!(store_id, ?key, "resolved cache hit");
            return Some((future::ready(Ok(value)).boxed().shared(), AbortHandle::noop()));
        }
        self.live_pending(store_id, key)
            .map(|pending| (pending.fetch, pending.abort.join()))
    }

    fn live_pending(&self, store_id: &str, key: &K) -> Option<Pending<V>> {
        let pending = self.pending.get(store_id, key)?;
        if pending.abort.is_aborted() {
            tracing::trace!(store_id, ?key, "skipping aborted fetch");
            return None;
        }
        tracing::trace!(store_id, ?key, "pending cache hit");
        Some(pending)
    }

    /// Tracks `fetch` as the in-flight request for `key` and returns it shared.
    ///
    /// The fetch is spawned on the current tokio runtime, if any, so it settles
    /// whether or not anyone awaits it.
    pub fn register(&self, store_id: &str, key: K, fetch: StoreFuture<V>) -> SharedFetch<V> {
        self.register_abortable(store_id, key, fetch, AbortHandle::noop()).0
    }

    /// Like [`register`](Self::register) for a fetch the store can abort.
    ///
    /// The returned handle is the registering caller's share of `abort`.
    pub fn register_abortable(
        &self,
        store_id: &str,
        key: K,
        fetch: StoreFuture<V>,
        abort: AbortHandle,
    ) -> (SharedFetch<V>, AbortHandle) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let resolved = Arc::downgrade(&self.resolved);
        let pending = Arc::downgrade(&self.pending);
        let store = store_id.to_owned();
        let slot = key.clone();

        let shared = async move {
            let result = fetch.await;
            settle(&resolved, &pending, &store, slot, generation, &result);
            result
        }
        .boxed()
        .shared();

        let abort = SharedAbort::new(abort);
        let handle = abort.join();
        self.pending.set(
            store_id,
            key,
            Pending {
                generation,
                fetch: shared.clone(),
                abort,
            },
        );

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(shared.clone());
        }

        (shared, handle)
    }

    /// Drops every resolved and pending entry of the given store.
    pub fn clear_store(&self, store_id: &str) {
        self.resolved.delete_store(store_id);
        self.pending.delete_store(store_id);
    }

    /// Number of settled responses cached for the given store.
    pub fn resolved_len(&self, store_id: &str) -> usize {
        self.resolved.len(store_id)
    }

    /// Number of fetches in flight for the given store.
    pub fn pending_len(&self, store_id: &str) -> usize {
        self.pending.len(store_id)
    }
}

fn settle<K, V>(
    resolved: &Weak<StoreCache<K, V>>,
    pending: &Weak<StoreCache<K, Pending<V>>>,
    store_id: &str,
    key: K,
    generation: u64,
    result: &Result<V>,
) where
    K: Eq + Hash + Debug,
    V: Clone,
{
    let (Some(resolved), Some(pending)) = (resolved.upgrade(), pending.upgrade()) else {
        return;
    };

    let owned_slot = pending
        .take_if(store_id, &key, |entry| entry.generation == generation)
        .is_some();

    if !owned_slot {
        tracing::debug!(store_id, ?key, "discarding obsolete result");
        return;
    }

    if let Ok(value) = result {
        resolved.set(store_id, key, value.clone());
    }
}

impl<K, V> Default for ResponseCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Debug for ResponseCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Query responses keyed by store id and request fingerprint.
#[derive(Debug)]
pub struct QueryCache<D> {
    responses: ResponseCache<Fingerprint, Arc<QueryResponse<D>>>,
    fingerprinter: Arc<Fingerprinter>,
}

impl<D> QueryCache<D>
where
    D: Send + Sync + 'static,
{
    #[must_use]
    pub fn new(fingerprinter: Arc<Fingerprinter>) -> Self {
        Self {
            responses: ResponseCache::new(),
            fingerprinter,
        }
    }

    pub fn lookup(
        &self,
        request: &Arc<QueryRequest>,
    ) -> Option<(SharedFetch<Arc<QueryResponse<D>>>, AbortHandle)> {
        let fingerprint = self.fingerprinter.fingerprint(request);
        self.responses.lookup_abortable(&request.store_id, &fingerprint)
    }

    pub fn register(
        &self,
        request: &Arc<QueryRequest>,
        fetch: StoreFuture<Arc<QueryResponse<D>>>,
        abort: AbortHandle,
    ) -> (SharedFetch<Arc<QueryResponse<D>>>, AbortHandle) {
        let fingerprint = self.fingerprinter.fingerprint(request);
        self.responses
            .register_abortable(&request.store_id, fingerprint, fetch, abort)
    }

    pub fn clear_store(&self, store_id: &str) {
        self.responses.clear_store(store_id);
    }

    pub fn resolved_len(&self, store_id: &str) -> usize {
        self.responses.resolved_len(store_id)
    }

    pub fn pending_len(&self, store_id: &str) -> usize {
        self.responses.pending_len(store_id)
    }
}

/// Index values keyed by store id and field.
#[derive(Debug, Default)]
pub struct IndexValuesCache {
    values: ResponseCache<String, Arc<Vec<Value>>>,
}

impl IndexValuesCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, request: &IndexValuesRequest) -> Option<SharedFetch<Arc<Vec<Value>>>> {
        self.values.lookup(&request.store_id, &request.field)
    }

    pub fn register(
        &self,
        request: &IndexValuesRequest,
        fetch: StoreFuture<Arc<Vec<Value>>>,
    ) -> SharedFetch<Arc<Vec<Value>>> {
        self.values
            .register(&request.store_id, request.field.clone(), fetch)
    }

    pub fn clear_store(&self, store_id: &str) {
        self.values.clear_store(store_id);
    }

    pub fn resolved_len(&self, store_id: &str) -> usize {
        self.values.resolved_len(store_id)
    }

    pub fn pending_len(&self, store_id: &str) -> usize {
        self.values.pending_len(store_id)
    }
}
