//! Cancelable query lifecycle.
//!
//! A query moves through `Idle → Loading → Success`, drops into `Stale` while a
//! newer request replaces a shown response, and into `Error` when the request it
//! is waiting for fails. Every run of an observer is tagged with a sequence
//! number; completions and failures are only applied when they carry the
//! sequence number the state is waiting for, so a late answer to a superseded
//! request can never overwrite a newer one.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use store_query::client::QueryClient;
//! use store_query::mock::MockStore;
//! use store_query::query::QueryObserver;
//! use store_query::request::QueryRequest;
//!
//! # async fn demo() {
//! let client = Arc::new(QueryClient::new(MockStore::<String>::new()));
//! let observer = QueryObserver::new(client, QueryRequest::new("books"));
//!
//! let mut states = observer.subscribe();
//! while !states.borrow_and_update().is_success() {
//!     let _ = states.changed().await;
//! }
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::client::{Listener, QueryClient, StoreChange, Trigger};
use crate::error::StoreError;
use crate::request::{Fingerprinter, QueryRequest};
use crate::state_machine::StateMachine;
use crate::store::{AbortHandle, DocumentStore, QueryResponse};

/// A request as issued by one observer run.
///
/// `seq` increases with every run of the observer; two tickets denote the
/// same run if and only if their sequence numbers are equal.
#[derive(Debug, Clone)]
pub struct RequestTicket<R> {
    pub seq: u64,
    pub request: Arc<R>,
}

impl<R> RequestTicket<R> {
    pub fn new(seq: u64, request: Arc<R>) -> Self {
        Self { seq, request }
    }

    /// Returns `true` if both tickets come from the same run.
    #[must_use]
    pub const fn is_same_run(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

pub type QueryTicket = RequestTicket<QueryRequest>;

/// The state of a cancelable query.
#[derive(Debug, Clone)]
pub enum QueryState<D> {
    /// No request issued yet.
    Idle,
    /// A request is in flight and nothing has been shown yet.
    Loading {
        request: QueryTicket,
        abort: AbortHandle,
        trigger: Trigger,
    },
    /// The response to `request`.
    Success {
        request: QueryTicket,
        response: Arc<QueryResponse<D>>,
    },
    /// The response to `request` is shown while `new_request` is in flight.
    Stale {
        request: QueryTicket,
        response: Arc<QueryResponse<D>>,
        new_request: QueryTicket,
        abort: AbortHandle,
        trigger: Trigger,
        /// Whether the per-filter stats of `response` are known not to match
        /// `new_request`.
        are_stats_stale: bool,
    },
    /// The last request failed.
    Error {
        request: QueryTicket,
        error: StoreError,
    },
}

impl<D> QueryState<D> {
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Returns `true` while a request is in flight.
    pub const fn is_fetching(&self) -> bool {
        matches!(self, Self::Loading { .. } | Self::Stale { .. })
    }

    /// The request whose outcome the state describes, or which is loading.
    pub const fn request(&self) -> Option<&QueryTicket> {
        match self {
            Self::Idle => None,
            Self::Loading { request, .. }
            | Self::Success { request, .. }
            | Self::Stale { request, .. }
            | Self::Error { request, .. } => Some(request),
        }
    }

    /// The request currently awaited, if any.
    pub const fn in_flight(&self) -> Option<&QueryTicket> {
        match self {
            Self::Loading { request, .. } => Some(request),
            Self::Stale { new_request, .. } => Some(new_request),
            _ => None,
        }
    }

    /// The response currently shown, if any.
    pub const fn response(&self) -> Option<&Arc<QueryResponse<D>>> {
        match self {
            Self::Success { response, .. } | Self::Stale { response, .. } => Some(response),
            _ => None,
        }
    }

    pub const fn error(&self) -> Option<&StoreError> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub const fn trigger(&self) -> Option<Trigger> {
        match self {
            Self::Loading { trigger, .. } | Self::Stale { trigger, .. } => Some(*trigger),
            _ => None,
        }
    }

    /// `true` only in a stale state whose stats no longer match the request in flight.
    pub const fn are_stats_stale(&self) -> bool {
        matches!(
            self,
            Self::Stale {
                are_stats_stale: true,
                ..
            }
        )
    }
}

impl<D> Default for QueryState<D> {
    fn default() -> Self {
        Self::Idle
    }
}

/// Events driving a [`QueryState`].
#[derive(Debug, Clone)]
pub enum QueryAction<D> {
    Started {
        request: QueryTicket,
        abort: AbortHandle,
        trigger: Trigger,
    },
    Completed {
        request: QueryTicket,
        response: Arc<QueryResponse<D>>,
    },
    Failed {
        request: QueryTicket,
        error: StoreError,
    },
}

/// Decides whether a superseded in-flight query gets aborted.
#[derive(Debug, Clone)]
pub struct AbortPolicy {
    fingerprinter: Arc<Fingerprinter>,
    cancellation_enabled: bool,
}

impl AbortPolicy {
    #[must_use]
    pub const fn new(fingerprinter: Arc<Fingerprinter>, cancellation_enabled: bool) -> Self {
        Self {
            fingerprinter,
            cancellation_enabled,
        }
    }

    /// A superseded request is aborted when the new one differs structurally or
    /// was started because the store changed.
    pub fn should_abort(&self, in_flight: &QueryTicket, next: &QueryTicket, trigger: Trigger) -> bool {
        self.cancellation_enabled
            && (trigger == Trigger::StoreMutation
                || !self
                    .fingerprinter
                    .are_equal(&in_flight.request, &next.request))
    }
}

fn are_stats_stale(shown: &QueryTicket, next: &QueryTicket, trigger: Trigger) -> bool {
    trigger == Trigger::StoreMutation || !shown.request.has_same_filters(&next.request)
}

fn from_idle_to_loading<D>(state: &QueryState<D>, action: &QueryAction<D>) -> Option<QueryState<D>> {
    match (state, action) {
        (
            QueryState::Idle,
            QueryAction::Started {
                request,
                abort,
                trigger,
            },
        ) => Some(QueryState::Loading {
            request: request.clone(),
            abort: abort.clone(),
            trigger: *trigger,
        }),
        _ => None,
    }
}

fn from_loading_to_loading<D>(
    policy: &AbortPolicy,
    state: &QueryState<D>,
    action: &QueryAction<D>,
) -> Option<QueryState<D>> {
    match (state, action) {
        (
            QueryState::Loading {
                request: in_flight,
                abort: in_flight_abort,
                ..
            },
            QueryAction::Started {
                request,
                abort,
                trigger,
            },
        ) => {
            if policy.should_abort(in_flight, request, *trigger) {
                in_flight_abort.abort();
            }
            Some(QueryState::Loading {
                request: request.clone(),
                abort: abort.clone(),
                trigger: *trigger,
            })
        }
        _ => None,
    }
}

fn from_loading_to_error<D>(state: &QueryState<D>, action: &QueryAction<D>) -> Option<QueryState<D>> {
    match (state, action) {
        (QueryState::Loading { request: in_flight, .. }, QueryAction::Failed { request, error })
            if in_flight.is_same_run(request) =>
        {
            Some(QueryState::Error {
                request: request.clone(),
                error: error.clone(),
            })
        }
        _ => None,
    }
}

fn from_loading_to_success<D>(state: &QueryState<D>, action: &QueryAction<D>) -> Option<QueryState<D>> {
    match (state, action) {
        (
            QueryState::Loading { request: in_flight, .. },
            QueryAction::Completed { request, response },
        ) if in_flight.is_same_run(request) => Some(QueryState::Success {
            request: request.clone(),
            response: Arc::clone(response),
        }),
        _ => None,
    }
}

fn from_success_to_stale<D>(state: &QueryState<D>, action: &QueryAction<D>) -> Option<QueryState<D>> {
    match (state, action) {
        (
            QueryState::Success { request: shown, response },
            QueryAction::Started {
                request,
                abort,
                trigger,
            },
        ) => Some(QueryState::Stale {
            request: shown.clone(),
            response: Arc::clone(response),
            new_request: request.clone(),
            abort: abort.clone(),
            trigger: *trigger,
            are_stats_stale: are_stats_stale(shown, request, *trigger),
        }),
        _ => None,
    }
}

fn from_stale_to_stale<D>(
    policy: &AbortPolicy,
    state: &QueryState<D>,
    action: &QueryAction<D>,
) -> Option<QueryState<D>> {
    match (state, action) {
        (
            QueryState::Stale {
                request: shown,
                response,
                new_request: in_flight,
                abort: in_flight_abort,
                ..
            },
            QueryAction::Started {
                request,
                abort,
                trigger,
            },
        ) => {
            if policy.should_abort(in_flight, request, *trigger) {
                in_flight_abort.abort();
            }
            Some(QueryState::Stale {
                request: shown.clone(),
                response: Arc::clone(response),
                new_request: request.clone(),
                abort: abort.clone(),
                trigger: *trigger,
                are_stats_stale: are_stats_stale(shown, request, *trigger),
            })
        }
        _ => None,
    }
}

fn from_stale_to_success<D>(state: &QueryState<D>, action: &QueryAction<D>) -> Option<QueryState<D>> {
    match (state, action) {
        (
            QueryState::Stale {
                new_request: in_flight,
                ..
            },
            QueryAction::Completed { request, response },
        ) if in_flight.is_same_run(request) => Some(QueryState::Success {
            request: request.clone(),
            response: Arc::clone(response),
        }),
        _ => None,
    }
}

fn from_stale_to_error<D>(state: &QueryState<D>, action: &QueryAction<D>) -> Option<QueryState<D>> {
    match (state, action) {
        (
            QueryState::Stale {
                new_request: in_flight,
                ..
            },
            QueryAction::Failed { request, error },
        ) if in_flight.is_same_run(request) => Some(QueryState::Error {
            request: request.clone(),
            error: error.clone(),
        }),
        _ => None,
    }
}

fn from_error_to_loading<D>(state: &QueryState<D>, action: &QueryAction<D>) -> Option<QueryState<D>> {
    match (state, action) {
        (
            QueryState::Error { .. },
            QueryAction::Started {
                request,
                abort,
                trigger,
            },
        ) => Some(QueryState::Loading {
            request: request.clone(),
            abort: abort.clone(),
            trigger: *trigger,
        }),
        _ => None,
    }
}

/// Builds the state machine of a cancelable query.
pub fn query_machine<D: 'static>(policy: &AbortPolicy) -> StateMachine<QueryState<D>, QueryAction<D>> {
    let loading_policy = policy.clone();
    let stale_policy = policy.clone();

    StateMachine::new(vec![
        Box::new(from_idle_to_loading::<D>),
        Box::new(move |state: &QueryState<D>, action: &QueryAction<D>| {
            from_loading_to_loading(&loading_policy, state, action)
        }),
        Box::new(from_loading_to_error::<D>),
        Box::new(from_loading_to_success::<D>),
        Box::new(from_success_to_stale::<D>),
        Box::new(move |state: &QueryState<D>, action: &QueryAction<D>| {
            from_stale_to_stale(&stale_policy, state, action)
        }),
        Box::new(from_stale_to_success::<D>),
        Box::new(from_stale_to_error::<D>),
        Box::new(from_error_to_loading::<D>),
    ])
}

struct ObserverInner<S: DocumentStore> {
    client: Arc<QueryClient<S>>,
    machine: StateMachine<QueryState<S::Document>, QueryAction<S::Document>>,
    state: watch::Sender<QueryState<S::Document>>,
    request: Mutex<Arc<QueryRequest>>,
    seq: AtomicU64,
    listener: Mutex<Option<Listener>>,
}

impl<S: DocumentStore> ObserverInner<S> {
    fn current_request(&self) -> Arc<QueryRequest> {
        Arc::clone(&self.request.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn dispatch(&self, action: &QueryAction<S::Document>) {
        self.state.send_modify(|state| {
            let current = std::mem::take(state);
            *state = self.machine.run(current, action);
        });
    }

    fn run(self: &Arc<Self>, trigger: Trigger) {
        // Held until `Started` is dispatched so that runs enter the machine in seq order.
        let request = self.request.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = RequestTicket::new(self.seq.fetch_add(1, Ordering::Relaxed) + 1, Arc::clone(&request));
        let (fetch, abort) = self.client.query(&request);
        self.dispatch(&QueryAction::Started {
            request: ticket.clone(),
            abort,
            trigger,
        });
        let store_id = request.store_id.clone();
        drop(request);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%store_id, "no tokio runtime, query cannot be driven");
            self.dispatch(&QueryAction::Failed {
                request: ticket,
                error: StoreError::NoRuntime,
            });
            return;
        };

        let observer = Arc::downgrade(self);
        runtime.spawn(async move {
            let result = fetch.await;
            let Some(observer) = observer.upgrade() else {
                return;
            };
            let action = match result {
                Ok(response) => QueryAction::Completed {
                    request: ticket,
                    response,
                },
                Err(error) => {
                    tracing::warn!(%store_id, %error, "query failed");
                    QueryAction::Failed {
                        request: ticket,
                        error,
                    }
                }
            };
            observer.dispatch(&action);
        });
    }

    fn subscribe(self: &Arc<Self>, store_id: &str) {
        let observer: Weak<Self> = Arc::downgrade(self);
        let listener: Listener = Arc::new(move |_: &StoreChange| {
            if let Some(observer) = observer.upgrade() {
                observer.run(Trigger::StoreMutation);
            }
        });
        self.client
            .subscribe_to_store_change(store_id, Arc::clone(&listener));
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn unsubscribe(&self, store_id: &str) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            self.client.unsubscribe_to_store_change(store_id, &listener);
        }
    }
}

/// Keeps one query's state in sync with the store.
///
/// On creation the observer issues its request and subscribes to changes of
/// the request's store; every store mutation re-issues the request with
/// [`Trigger::StoreMutation`]. Dropping the observer unsubscribes it.
///
/// Issuing a request spawns a task on the current tokio runtime. Outside a
/// runtime every run fails with [`StoreError::NoRuntime`].
pub struct QueryObserver<S: DocumentStore> {
    inner: Arc<ObserverInner<S>>,
}

impl<S: DocumentStore> QueryObserver<S> {
    /// Creates an observer and issues `request`.
    pub fn new(client: Arc<QueryClient<S>>, request: QueryRequest) -> Self {
        let policy = AbortPolicy::new(
            Arc::clone(client.fingerprinter()),
            client.config().cancellation_enabled,
        );
        let (state, _) = watch::channel(QueryState::Idle);
        let store_id = request.store_id.clone();

        let inner = Arc::new(ObserverInner {
            client,
            machine: query_machine(&policy),
            state,
            request: Mutex::new(Arc::new(request)),
            seq: AtomicU64::new(0),
            listener: Mutex::new(None),
        });
        inner.subscribe(&store_id);
        inner.run(Trigger::RequestChange);

        Self { inner }
    }

    /// Replaces the observed request and issues it.
    pub fn set_request(&self, request: QueryRequest) {
        let previous_store = self.inner.current_request().store_id.clone();
        let store_changed = previous_store != request.store_id;
        if store_changed {
            self.inner.unsubscribe(&previous_store);
        }

        let store_id = request.store_id.clone();
        *self
            .inner
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(request);

        if store_changed {
            self.inner.subscribe(&store_id);
        }
        self.inner.run(Trigger::RequestChange);
    }

    /// Issues the current request again.
    pub fn refetch(&self) {
        self.inner.run(Trigger::RequestChange);
    }

    /// Applies an action to the observer's state directly.
    pub fn dispatch(&self, action: &QueryAction<S::Document>) {
        self.inner.dispatch(action);
    }

    /// The current state.
    pub fn state(&self) -> QueryState<S::Document> {
        self.inner.state.borrow().clone()
    }

    pub fn request(&self) -> Arc<QueryRequest> {
        self.inner.current_request()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<S::Document>> {
        self.inner.state.subscribe()
    }

    /// Stream of states, starting with the current one.
    pub fn stream(&self) -> BoxStream<'static, QueryState<S::Document>> {
        WatchStream::new(self.subscribe()).boxed()
    }
}

impl<S: DocumentStore> Drop for QueryObserver<S> {
    fn drop(&mut self) {
        let store_id = self.inner.current_request().store_id.clone();
        self.inner.unsubscribe(&store_id);
    }
}

impl<S: DocumentStore> fmt::Debug for QueryObserver<S>
where
    S::Document: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("request", &self.inner.current_request())
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    type Doc = String;

    fn policy(cancellation_enabled: bool) -> AbortPolicy {
        AbortPolicy::new(
            Arc::new(Fingerprinter::new(Duration::from_secs(2))),
            cancellation_enabled,
        )
    }

    fn ticket(seq: u64, request: QueryRequest) -> QueryTicket {
        RequestTicket::new(seq, Arc::new(request))
    }

    fn started(request: &QueryTicket, trigger: Trigger) -> (QueryAction<Doc>, AbortHandle) {
        let abort = AbortHandle::new();
        let action = QueryAction::Started {
            request: request.clone(),
            abort: abort.clone(),
            trigger,
        };
        (action, abort)
    }

    fn completed(request: &QueryTicket, response: &Arc<QueryResponse<Doc>>) -> QueryAction<Doc> {
        QueryAction::Completed {
            request: request.clone(),
            response: Arc::clone(response),
        }
    }

    fn failed(request: &QueryTicket) -> QueryAction<Doc> {
        QueryAction::Failed {
            request: request.clone(),
            error: StoreError::QueryFailed("boom".into()),
        }
    }

    fn response(documents: &[&str]) -> Arc<QueryResponse<Doc>> {
        Arc::new(QueryResponse::new(
            documents.iter().map(ToString::to_string).collect(),
        ))
    }

    fn success(machine: &StateMachine<QueryState<Doc>, QueryAction<Doc>>, request: &QueryTicket) -> QueryState<Doc> {
        let (start, _) = started(request, Trigger::RequestChange);
        let state = machine.run(QueryState::Idle, &start);
        machine.run(state, &completed(request, &response(&["dune"])))
    }

    #[test]
    fn test_idle_to_success_keeps_response() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("books"));
        let (start, _) = started(&a, Trigger::RequestChange);

        let state = machine.run(QueryState::Idle, &start);
        assert!(state.is_loading());
        assert!(state.is_fetching());
        assert_eq!(state.trigger(), Some(Trigger::RequestChange));

        let expected = response(&["dune"]);
        let state = machine.run(state, &completed(&a, &expected));
        assert!(state.is_success());
        assert!(!state.is_fetching());
        assert!(Arc::ptr_eq(state.response().expect("response"), &expected));
    }

    #[test]
    fn test_superseded_completion_is_ignored() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("books"));
        let b = ticket(2, QueryRequest::new("books").with_filters_applied(["fiction"]));

        let (start_a, abort_a) = started(&a, Trigger::RequestChange);
        let (start_b, _) = started(&b, Trigger::RequestChange);
        let state = machine.run(QueryState::Idle, &start_a);
        let state = machine.run(state, &start_b);
        assert!(abort_a.is_aborted());

        let state = machine.run(state, &completed(&a, &response(&["late"])));
        assert!(state.is_loading());
        assert_eq!(state.in_flight().expect("in flight").seq, 2);

        let state = machine.run(state, &failed(&a));
        assert!(state.is_loading());
        assert_eq!(state.in_flight().expect("in flight").seq, 2);
    }

    #[test]
    fn test_structurally_equal_restart_is_not_aborted() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("books").with_filters_applied(["a", "b"]));
        let b = ticket(2, QueryRequest::new("books").with_filters_applied(["b", "a"]));

        let (start_a, abort_a) = started(&a, Trigger::RequestChange);
        let (start_b, _) = started(&b, Trigger::RequestChange);
        let state = machine.run(QueryState::Idle, &start_a);
        let state = machine.run(state, &start_b);
        assert!(!abort_a.is_aborted());

        // only the latest run may settle the state
        let state = machine.run(state, &completed(&a, &response(&[])));
        assert!(state.is_loading());
    }

    #[test]
    fn test_store_mutation_restart_aborts_equal_request() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("books"));
        let b = ticket(2, QueryRequest::new("books"));

        let (start_a, abort_a) = started(&a, Trigger::RequestChange);
        let (start_b, _) = started(&b, Trigger::StoreMutation);
        let state = machine.run(QueryState::Idle, &start_a);
        let state = machine.run(state, &start_b);
        assert!(abort_a.is_aborted());
        assert_eq!(state.trigger(), Some(Trigger::StoreMutation));
    }

    #[test]
    fn test_disabled_cancellation_never_aborts() {
        let machine = query_machine(&policy(false));
        let a = ticket(1, QueryRequest::new("books"));
        let b = ticket(2, QueryRequest::new("films"));

        let (start_a, abort_a) = started(&a, Trigger::RequestChange);
        let (start_b, _) = started(&b, Trigger::StoreMutation);
        let state = machine.run(QueryState::Idle, &start_a);
        let state = machine.run(state, &start_b);
        assert!(!abort_a.is_aborted());

        let state = machine.run(state, &completed(&a, &response(&[])));
        assert!(state.is_loading());
    }

    #[test]
    fn test_loading_failure_for_current_run() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("books"));
        let (start, _) = started(&a, Trigger::RequestChange);

        let state = machine.run(QueryState::Idle, &start);
        let state = machine.run(state, &failed(&a));
        assert!(state.is_error());
        assert_eq!(state.error(), Some(&StoreError::QueryFailed("boom".into())));

        let b = ticket(2, QueryRequest::new("books"));
        let (restart, _) = started(&b, Trigger::RequestChange);
        let state = machine.run(state, &restart);
        assert!(state.is_loading());
        assert_eq!(state.request().expect("request").seq, 2);
    }

    #[test]
    fn test_success_to_stale_keeps_shown_response() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("books").with_filters_applied(["a"]));
        let state = success(&machine, &a);
        let shown = Arc::clone(state.response().expect("response"));

        let b = ticket(2, QueryRequest::new("books").with_filters_applied(["a"]).with_page(2, 10));
        let (start_b, _) = started(&b, Trigger::RequestChange);
        let state = machine.run(state, &start_b);

        assert!(state.is_stale());
        assert!(state.is_fetching());
        assert!(Arc::ptr_eq(state.response().expect("response"), &shown));
        assert_eq!(state.request().expect("request").seq, 1);
        assert_eq!(state.in_flight().expect("in flight").seq, 2);
        assert!(!state.are_stats_stale());
    }

    #[test]
    fn test_stats_staleness() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("s").with_filters_applied(["a"]));

        let same = ticket(2, QueryRequest::new("s").with_filters_applied(["a"]));
        let (start, _) = started(&same, Trigger::RequestChange);
        let state = machine.run(success(&machine, &a), &start);
        assert!(!state.are_stats_stale());

        let (start, _) = started(&same, Trigger::StoreMutation);
        let state = machine.run(success(&machine, &a), &start);
        assert!(state.are_stats_stale());

        let other = ticket(3, QueryRequest::new("s").with_filters_applied(["b"]));
        let (start, _) = started(&other, Trigger::RequestChange);
        let state = machine.run(success(&machine, &a), &start);
        assert!(state.are_stats_stale());
    }

    #[test]
    fn test_stale_to_stale_compares_with_request_in_flight() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("s").with_filters_applied(["a"]));
        let b = ticket(2, QueryRequest::new("s").with_filters_applied(["b"]));
        let c = ticket(3, QueryRequest::new("s").with_filters_applied(["b"]));
        let d = ticket(4, QueryRequest::new("s").with_filters_applied(["a"]));

        let (start_b, abort_b) = started(&b, Trigger::RequestChange);
        let (start_c, abort_c) = started(&c, Trigger::RequestChange);
        let (start_d, _) = started(&d, Trigger::RequestChange);

        let state = machine.run(success(&machine, &a), &start_b);
        let state = machine.run(state, &start_c);
        assert!(!abort_b.is_aborted());
        assert!(state.are_stats_stale());

        let state = machine.run(state, &start_d);
        assert!(abort_c.is_aborted());
        assert!(!state.are_stats_stale());
        assert_eq!(state.request().expect("shown").seq, 1);
        assert_eq!(state.in_flight().expect("in flight").seq, 4);
    }

    #[test]
    fn test_stale_settles_only_for_request_in_flight() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("s"));
        let b = ticket(2, QueryRequest::new("s").with_filters_applied(["x"]));
        let (start_b, _) = started(&b, Trigger::RequestChange);
        let state = machine.run(success(&machine, &a), &start_b);

        let state = machine.run(state, &completed(&a, &response(&["late"])));
        assert!(state.is_stale());
        let state = machine.run(state, &failed(&a));
        assert!(state.is_stale());

        let fresh = response(&["fresh"]);
        let settled = machine.run(state.clone(), &completed(&b, &fresh));
        assert!(settled.is_success());
        assert_eq!(settled.request().expect("request").seq, 2);
        assert!(Arc::ptr_eq(settled.response().expect("response"), &fresh));

        let errored = machine.run(state, &failed(&b));
        assert!(errored.is_error());
        assert_eq!(errored.request().expect("request").seq, 2);
    }

    #[test]
    fn test_unmatched_actions_leave_state_unchanged() {
        let machine = query_machine(&policy(true));
        let a = ticket(1, QueryRequest::new("s"));

        let state = machine.run(QueryState::Idle, &completed(&a, &response(&[])));
        assert!(state.is_idle());
        let state = machine.run(state, &failed(&a));
        assert!(state.is_idle());

        let state = success(&machine, &a);
        let state = machine.run(state, &completed(&a, &response(&["again"])));
        assert!(state.is_success());
        assert_eq!(state.response().expect("response").documents, vec!["dune".to_string()]);
    }

    #[test]
    fn test_observer_without_runtime_reports_error() {
        let client = Arc::new(QueryClient::new(crate::mock::MockStore::<Doc>::new()));
        let observer = QueryObserver::new(client, QueryRequest::new("books"));

        let state = observer.state();
        assert!(state.is_error());
        assert_eq!(state.error(), Some(&StoreError::NoRuntime));
    }
}
