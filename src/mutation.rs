//! Store mutations: create a store, delete a store, add documents.
//!
//! Mutations share one small lifecycle, `Idle → Loading → Success | Error`.
//! They are never superseded, so there is no stale state and no race guard.
//! Every successful mutation goes through [`QueryClient::mutate`], which
//! invalidates cached reads of the mutated store.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use store_query::client::QueryClient;
//! use store_query::mock::MockStore;
//! use store_query::mutation::MutationObserver;
//! use store_query::request::CreateStoreRequest;
//!
//! # async fn demo() -> store_query::error::Result<()> {
//! let client = Arc::new(QueryClient::new(MockStore::<String>::new()));
//! let create = MutationObserver::new(client);
//!
//! create
//!     .run(CreateStoreRequest::new("books", ["title", "year"], "title"))
//!     .await?;
//! assert!(create.state().is_success());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::client::QueryClient;
use crate::error::{Result, StoreError};
use crate::request::{AddDocumentsRequest, CreateStoreRequest, DeleteStoreRequest, StoreId};
use crate::state_machine::StateMachine;
use crate::store::DocumentStore;

/// The state of a mutation.
#[derive(Debug)]
pub enum MutationState<R> {
    /// Mutation is idle (not yet started).
    Idle,
    /// Mutation is in progress.
    Loading { request: Arc<R> },
    /// Mutation succeeded.
    Success { request: Arc<R> },
    /// Mutation failed with an error.
    Error { request: Arc<R>, error: StoreError },
}

impl<R> Clone for MutationState<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Idle => Self::Idle,
            Self::Loading { request } => Self::Loading {
                request: Arc::clone(request),
            },
            Self::Success { request } => Self::Success {
                request: Arc::clone(request),
            },
            Self::Error { request, error } => Self::Error {
                request: Arc::clone(request),
                error: error.clone(),
            },
        }
    }
}

impl<R> Default for MutationState<R> {
    fn default() -> Self {
        Self::Idle
    }
}

impl<R> MutationState<R> {
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns `true` if the mutation is currently loading.
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub const fn is_fetching(&self) -> bool {
        self.is_loading()
    }

    pub const fn request(&self) -> Option<&Arc<R>> {
        match self {
            Self::Idle => None,
            Self::Loading { request } | Self::Success { request } | Self::Error { request, .. } => {
                Some(request)
            }
        }
    }

    pub const fn error(&self) -> Option<&StoreError> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum MutationAction<R> {
    Started { request: Arc<R> },
    Completed { request: Arc<R> },
    Failed { request: Arc<R>, error: StoreError },
}

fn from_idle_to_loading<R>(state: &MutationState<R>, action: &MutationAction<R>) -> Option<MutationState<R>> {
    match (state, action) {
        (MutationState::Idle, MutationAction::Started { request }) => Some(MutationState::Loading {
            request: Arc::clone(request),
        }),
        _ => None,
    }
}

fn from_loading_to_error<R>(state: &MutationState<R>, action: &MutationAction<R>) -> Option<MutationState<R>> {
    match (state, action) {
        (MutationState::Loading { .. }, MutationAction::Failed { request, error }) => {
            Some(MutationState::Error {
                request: Arc::clone(request),
                error: error.clone(),
            })
        }
        _ => None,
    }
}

fn from_loading_to_success<R>(state: &MutationState<R>, action: &MutationAction<R>) -> Option<MutationState<R>> {
    match (state, action) {
        (MutationState::Loading { .. }, MutationAction::Completed { request }) => {
            Some(MutationState::Success {
                request: Arc::clone(request),
            })
        }
        _ => None,
    }
}

/// Builds the state machine shared by every mutation.
#[must_use]
pub fn mutation_machine<R: 'static>() -> StateMachine<MutationState<R>, MutationAction<R>> {
    StateMachine::new(vec![
        Box::new(from_idle_to_loading::<R>),
        Box::new(from_loading_to_error::<R>),
        Box::new(from_loading_to_success::<R>),
    ])
}

/// A request that mutates one store through a [`QueryClient`].
pub trait StoreMutation<S: DocumentStore>: Send + Sync + 'static {
    /// The store the mutation invalidates.
    fn store_id(&self) -> &str;

    fn execute<'a>(&'a self, client: &'a QueryClient<S>) -> BoxFuture<'a, Result<()>>;
}

impl<S: DocumentStore> StoreMutation<S> for CreateStoreRequest {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn execute<'a>(&'a self, client: &'a QueryClient<S>) -> BoxFuture<'a, Result<()>> {
        client.create_store(self).boxed()
    }
}

impl<S: DocumentStore> StoreMutation<S> for DeleteStoreRequest {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn execute<'a>(&'a self, client: &'a QueryClient<S>) -> BoxFuture<'a, Result<()>> {
        client.delete_store(&self.store_id).boxed()
    }
}

impl<S: DocumentStore> StoreMutation<S> for AddDocumentsRequest<S::Document> {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    fn execute<'a>(&'a self, client: &'a QueryClient<S>) -> BoxFuture<'a, Result<()>> {
        client
            .add_documents(&self.store_id, self.documents.clone())
            .boxed()
    }
}

/// Runs mutations of one kind and tracks the state of the latest one.
pub struct MutationObserver<S: DocumentStore, R> {
    client: Arc<QueryClient<S>>,
    machine: StateMachine<MutationState<R>, MutationAction<R>>,
    state: watch::Sender<MutationState<R>>,
}

pub type CreateStoreObserver<S> = MutationObserver<S, CreateStoreRequest>;
pub type DeleteStoreObserver<S> = MutationObserver<S, DeleteStoreRequest>;
pub type AddDocumentsObserver<S> = MutationObserver<S, AddDocumentsRequest<<S as DocumentStore>::Document>>;

impl<S, R> MutationObserver<S, R>
where
    S: DocumentStore,
    R: StoreMutation<S>,
{
    #[must_use]
    pub fn new(client: Arc<QueryClient<S>>) -> Self {
        let (state, _) = watch::channel(MutationState::Idle);
        Self {
            client,
            machine: mutation_machine(),
            state,
        }
    }

    /// Runs `request`, tracking its progress in the observer's state.
    ///
    /// A settled previous mutation is forgotten first, so the observer always
    /// describes the latest request.
    pub async fn run(&self, request: R) -> Result<()> {
        let request = Arc::new(request);
        self.state.send_if_modified(|state| {
            let settled = state.is_success() || state.is_error();
            if settled {
                *state = MutationState::Idle;
            }
            settled
        });
        self.dispatch(&MutationAction::Started {
            request: Arc::clone(&request),
        });

        let result = request.execute(&self.client).await;
        match &result {
            Ok(()) => self.dispatch(&MutationAction::Completed { request }),
            Err(error) => {
                tracing::warn!(store_id = request.store_id(), %error, "mutation failed");
                self.dispatch(&MutationAction::Failed {
                    request,
                    error: error.clone(),
                });
            }
        }
        result
    }

    /// Applies an action to the observer's state directly.
    pub fn dispatch(&self, action: &MutationAction<R>) {
        self.state.send_modify(|state| {
            let current = std::mem::take(state);
            *state = self.machine.run(current, action);
        });
    }

    /// Returns the observer to `Idle`.
    pub fn reset(&self) {
        self.state.send_replace(MutationState::Idle);
    }

    pub fn state(&self) -> MutationState<R> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationState<R>> {
        self.state.subscribe()
    }
}

impl<S: DocumentStore, R: fmt::Debug> fmt::Debug for MutationObserver<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationObserver")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Mutations bound to one store.
#[derive(Debug)]
pub struct StoreMutator<'a, S: DocumentStore> {
    client: &'a QueryClient<S>,
    store_id: StoreId,
}

impl<'a, S: DocumentStore> StoreMutator<'a, S> {
    pub fn new(client: &'a QueryClient<S>, store_id: impl Into<StoreId>) -> Self {
        Self {
            client,
            store_id: store_id.into(),
        }
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub async fn create_store<I, F>(&self, index_config: I, key_path: impl Into<String>) -> Result<()>
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        let request = CreateStoreRequest::new(self.store_id.clone(), index_config, key_path);
        self.client.create_store(&request).await
    }

    pub async fn delete_store(&self) -> Result<()> {
        self.client.delete_store(&self.store_id).await
    }

    pub async fn add_documents(&self, documents: Vec<S::Document>) -> Result<()> {
        self.client.add_documents(&self.store_id, documents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStore;

    #[test]
    fn test_machine_lifecycle() {
        let machine = mutation_machine::<DeleteStoreRequest>();
        let request = Arc::new(DeleteStoreRequest::new("books"));

        let state = machine.run(
            MutationState::Idle,
            &MutationAction::Started {
                request: Arc::clone(&request),
            },
        );
        assert!(state.is_loading());
        assert!(state.is_fetching());

        let succeeded = machine.run(
            state.clone(),
            &MutationAction::Completed {
                request: Arc::clone(&request),
            },
        );
        assert!(succeeded.is_success());
        assert!(Arc::ptr_eq(succeeded.request().expect("request"), &request));

        let failed = machine.run(
            state,
            &MutationAction::Failed {
                request,
                error: StoreError::MutationFailed("locked".into()),
            },
        );
        assert!(failed.is_error());
        assert_eq!(failed.error(), Some(&StoreError::MutationFailed("locked".into())));
    }

    #[test]
    fn test_machine_has_no_other_transitions() {
        let machine = mutation_machine::<DeleteStoreRequest>();
        let request = Arc::new(DeleteStoreRequest::new("books"));

        let state = machine.run(
            MutationState::Idle,
            &MutationAction::Completed {
                request: Arc::clone(&request),
            },
        );
        assert!(state.is_idle());

        let state = machine.run(
            MutationState::Success {
                request: Arc::clone(&request),
            },
            &MutationAction::Started { request },
        );
        assert!(state.is_success());
    }

    #[tokio::test]
    async fn test_observer_runs_create_store() {
        let store = MockStore::<String>::new();
        let client = Arc::new(QueryClient::new(store.clone()));
        let observer: CreateStoreObserver<_> = MutationObserver::new(client);

        observer
            .run(CreateStoreRequest::new("books", ["title"], "title"))
            .await
            .expect("created");
        assert!(observer.state().is_success());
        assert_eq!(store.documents("books"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_observer_reports_failure() {
        let store = MockStore::<String>::new();
        let client = Arc::new(QueryClient::new(store.clone()));
        let observer: DeleteStoreObserver<_> = MutationObserver::new(client);

        let result = observer.run(DeleteStoreRequest::new("missing")).await;
        assert_eq!(result, Err(StoreError::UnknownStore("missing".into())));
        assert_eq!(
            observer.state().error(),
            Some(&StoreError::UnknownStore("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_observer_can_run_again_after_settling() {
        let store = MockStore::<String>::new();
        store.insert("books", Vec::new());
        let client = Arc::new(QueryClient::new(store.clone()));
        let observer: AddDocumentsObserver<MockStore<String>> = MutationObserver::new(client);

        observer
            .run(AddDocumentsRequest::new("books", vec!["dune".to_string()]))
            .await
            .expect("added");
        observer
            .run(AddDocumentsRequest::new("books", vec!["emma".to_string()]))
            .await
            .expect("added");

        let state = observer.state();
        assert!(state.is_success());
        assert_eq!(state.request().expect("request").documents, vec!["emma".to_string()]);
        assert_eq!(store.documents("books").map(|docs| docs.len()), Some(2));

        observer.reset();
        assert!(observer.state().is_idle());
    }

    #[tokio::test]
    async fn test_store_mutator() {
        let store = MockStore::<String>::new();
        let client = QueryClient::new(store.clone());
        let mutator = StoreMutator::new(&client, "books");
        assert_eq!(mutator.store_id(), "books");

        mutator.create_store(["title"], "title").await.expect("created");
        mutator
            .add_documents(vec!["dune".to_string()])
            .await
            .expect("added");
        assert_eq!(store.documents("books"), Some(vec!["dune".to_string()]));

        mutator.delete_store().await.expect("deleted");
        assert_eq!(store.documents("books"), None);
        assert_eq!(store.mutation_calls(), 3);
    }
}
