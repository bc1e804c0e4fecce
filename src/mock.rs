//! In-memory document store for testing.
//!
//! [`MockStore`] implements [`DocumentStore`] over plain vectors and lets tests
//! control it: count calls, inject failures, and hold query responses until they
//! are released explicitly, so races between superseding requests can be
//! replayed deterministically.
//!
//! # Example
//!
//! ```
//! use store_query::mock::MockStore;
//!
//! let store = MockStore::new();
//! store.insert("books", vec!["dune".to_string()]);
//!
//! // Queries issued from now on wait for `release`.
//! store.hold_queries();
//! assert_eq!(store.query_calls(), 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::request::{CreateStoreRequest, QueryRequest, StoreId};
use crate::store::{AbortHandle, DocumentStore, QueryResponse, StoreFuture};

struct Inner<D> {
    stores: HashMap<StoreId, Vec<D>>,
    query_calls: usize,
    index_calls: usize,
    mutation_calls: usize,
    issued_aborts: Vec<AbortHandle>,
    query_failures: VecDeque<StoreError>,
    mutation_failures: VecDeque<StoreError>,
    holding: bool,
    gates: Vec<Option<oneshot::Sender<()>>>,
}

/// A controllable in-memory [`DocumentStore`].
///
/// Clones share the same underlying state.
pub struct MockStore<D> {
    inner: Arc<Mutex<Inner<D>>>,
}

impl<D> Clone for MockStore<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> MockStore<D>
where
    D: Serialize + Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stores: HashMap::new(),
                query_calls: 0,
                index_calls: 0,
                mutation_calls: 0,
                issued_aborts: Vec::new(),
                query_failures: VecDeque::new(),
                mutation_failures: VecDeque::new(),
                holding: false,
                gates: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds a store with documents, bypassing the client.
    pub fn insert(&self, store_id: &str, documents: Vec<D>) {
        self.lock()
            .stores
            .entry(store_id.to_owned())
            .or_default()
            .extend(documents);
    }

    pub fn documents(&self, store_id: &str) -> Option<Vec<D>> {
        self.lock().stores.get(store_id).cloned()
    }

    /// Makes every query issued from now on wait for [`release`](Self::release).
    pub fn hold_queries(&self) {
        self.lock().holding = true;
    }

    /// Releases the held query issued as the `call`-th query (zero based).
    ///
    /// Returns `false` if that query was not held or was already released.
    pub fn release(&self, call: usize) -> bool {
        let gate = self.lock().gates.get_mut(call).and_then(Option::take);
        gate.is_some_and(|gate| gate.send(()).is_ok())
    }

    /// Releases every held query and stops holding new ones.
    pub fn release_all(&self) {
        let gates: Vec<_> = {
            let mut inner = self.lock();
            inner.holding = false;
            inner.gates.iter_mut().filter_map(Option::take).collect()
        };
        for gate in gates {
            let _ = gate.send(());
        }
    }

    /// Makes the next query fail with `error`.
    pub fn fail_next_query(&self, error: StoreError) {
        self.lock().query_failures.push_back(error);
    }

    /// Makes the next mutation fail with `error`.
    pub fn fail_next_mutation(&self, error: StoreError) {
        self.lock().mutation_failures.push_back(error);
    }

    pub fn query_calls(&self) -> usize {
        self.lock().query_calls
    }

    pub fn index_calls(&self) -> usize {
        self.lock().index_calls
    }

    pub fn mutation_calls(&self) -> usize {
        self.lock().mutation_calls
    }

    /// Number of issued queries whose abort handle has been triggered.
    pub fn aborted_queries(&self) -> usize {
        self.lock()
            .issued_aborts
            .iter()
            .filter(|abort| abort.is_aborted())
            .count()
    }

    /// Whether the `call`-th query (zero based) was aborted.
    pub fn was_aborted(&self, call: usize) -> bool {
        self.lock()
            .issued_aborts
            .get(call)
            .is_some_and(AbortHandle::is_aborted)
    }

    fn begin_mutation(&self) -> Result<MutexGuard<'_, Inner<D>>, StoreError> {
        let mut inner = self.lock();
        inner.mutation_calls += 1;
        match inner.mutation_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(inner),
        }
    }
}

impl<D> Default for MockStore<D>
where
    D: Serialize + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> DocumentStore for MockStore<D>
where
    D: Serialize + Clone + Send + Sync + 'static,
{
    type Document = D;

    fn run_query(&self, request: &QueryRequest) -> (StoreFuture<QueryResponse<D>>, AbortHandle) {
        let abort = AbortHandle::new();
        let mut inner = self.lock();
        inner.query_calls += 1;
        inner.issued_aborts.push(abort.clone());

        let outcome = match inner.query_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(QueryResponse::new(
                inner
                    .stores
                    .get(&request.store_id)
                    .cloned()
                    .unwrap_or_default(),
            )),
        };

        if !inner.holding {
            return (futures::future::ready(outcome).boxed(), abort);
        }

        let (tx, rx) = oneshot::channel();
        inner.gates.push(Some(tx));
        let token = abort.token().clone();
        let fetch = async move {
            tokio::select! {
                released = rx => match released {
                    Ok(()) => outcome,
                    Err(_) => Err(StoreError::Aborted),
                },
                () = token.cancelled() => Err(StoreError::Aborted),
            }
        }
        .boxed();
        (fetch, abort)
    }

    fn fetch_index_values(&self, store_id: &str, field: &str) -> StoreFuture<Vec<Value>> {
        let mut inner = self.lock();
        inner.index_calls += 1;

        let mut values: Vec<Value> = Vec::new();
        for document in inner.stores.get(store_id).into_iter().flatten() {
            let value = match serde_json::to_value(document) {
                Ok(Value::Object(mut fields)) => fields.remove(field),
                Ok(_) => None,
                Err(error) => {
                    return futures::future::ready(Err(StoreError::IndexFailed(error.to_string())))
                        .boxed();
                }
            };
            if let Some(value) = value {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        futures::future::ready(Ok(values)).boxed()
    }

    fn create_store(&self, request: &CreateStoreRequest) -> StoreFuture<()> {
        let outcome = self.begin_mutation().map(|mut inner| {
            inner.stores.entry(request.store_id.clone()).or_default();
        });
        futures::future::ready(outcome).boxed()
    }

    fn delete_store(&self, store_id: &str) -> StoreFuture<()> {
        let outcome = self.begin_mutation().and_then(|mut inner| {
            inner
                .stores
                .remove(store_id)
                .map(|_| ())
                .ok_or_else(|| StoreError::UnknownStore(store_id.to_owned()))
        });
        futures::future::ready(outcome).boxed()
    }

    fn add_documents(&self, store_id: &str, documents: Vec<D>) -> StoreFuture<()> {
        let outcome = self.begin_mutation().and_then(|mut inner| {
            inner
                .stores
                .get_mut(store_id)
                .map(|stored| stored.extend(documents))
                .ok_or_else(|| StoreError::UnknownStore(store_id.to_owned()))
        });
        futures::future::ready(outcome).boxed()
    }
}
