//! Index value lifecycle.
//!
//! Same shape as [`query`](crate::query) without aborts or triggers: index reads
//! are never cancelled and always refetch in full.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::client::{Listener, QueryClient, StoreChange};
use crate::error::StoreError;
use crate::query::RequestTicket;
use crate::request::IndexValuesRequest;
use crate::state_machine::StateMachine;
use crate::store::DocumentStore;

pub type IndexValuesTicket = RequestTicket<IndexValuesRequest>;

/// Values stored under one index.
pub type IndexValues = Arc<Vec<Value>>;

#[derive(Debug, Clone, Default)]
pub enum IndexValuesState {
    #[default]
    Idle,
    Loading {
        request: IndexValuesTicket,
    },
    Success {
        request: IndexValuesTicket,
        response: IndexValues,
    },
    Stale {
        request: IndexValuesTicket,
        response: IndexValues,
        new_request: IndexValuesTicket,
    },
    Error {
        request: IndexValuesTicket,
        error: StoreError,
    },
}

impl IndexValuesState {
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

    pub const fn is_fetching(&self) -> bool {
        matches!(self, Self::Loading { .. } | Self::Stale { .. })
    }

    /// The request whose values are shown, or which is loading.
    pub const fn request(&self) -> Option<&IndexValuesTicket> {
        match self {
            Self::Idle => None,
            Self::Loading { request }
            | Self::Success { request, .. }
            | Self::Stale { request, .. }
            | Self::Error { request, .. } => Some(request),
        }
    }

    pub const fn in_flight(&self) -> Option<&IndexValuesTicket> {
        match self {
            Self::Loading { request } | Self::Stale { new_request: request, .. } => Some(request),
            _ => None,
        }
    }

    pub const fn response(&self) -> Option<&IndexValues> {
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
}

#[derive(Debug, Clone)]
pub enum IndexValuesAction {
    Started {
        request: IndexValuesTicket,
    },
    Completed {
        request: IndexValuesTicket,
        response: IndexValues,
    },
    Failed {
        request: IndexValuesTicket,
        error: StoreError,
    },
}

fn start(state: &IndexValuesState, action: &IndexValuesAction) -> Option<IndexValuesState> {
    let IndexValuesAction::Started { request } = action else {
        return None;
    };
    match state {
        IndexValuesState::Idle | IndexValuesState::Loading { .. } | IndexValuesState::Error { .. } => {
            Some(IndexValuesState::Loading {
                request: request.clone(),
            })
        }
        IndexValuesState::Success {
            request: shown,
            response,
        }
        | IndexValuesState::Stale {
            request: shown,
            response,
            ..
        } => Some(IndexValuesState::Stale {
            request: shown.clone(),
            response: Arc::clone(response),
            new_request: request.clone(),
        }),
    }
}

fn complete(state: &IndexValuesState, action: &IndexValuesAction) -> Option<IndexValuesState> {
    let IndexValuesAction::Completed { request, response } = action else {
        return None;
    };
    state
        .in_flight()
        .filter(|in_flight| in_flight.is_same_run(request))
        .map(|_| IndexValuesState::Success {
            request: request.clone(),
            response: Arc::clone(response),
        })
}

fn fail(state: &IndexValuesState, action: &IndexValuesAction) -> Option<IndexValuesState> {
    let IndexValuesAction::Failed { request, error } = action else {
        return None;
    };
    state
        .in_flight()
        .filter(|in_flight| in_flight.is_same_run(request))
        .map(|_| IndexValuesState::Error {
            request: request.clone(),
            error: error.clone(),
        })
}

/// Builds the state machine of an index value query.
#[must_use]
pub fn index_values_machine() -> StateMachine<IndexValuesState, IndexValuesAction> {
    StateMachine::new(vec![Box::new(start), Box::new(complete), Box::new(fail)])
}

struct ObserverInner<S: DocumentStore> {
    client: Arc<QueryClient<S>>,
    machine: StateMachine<IndexValuesState, IndexValuesAction>,
    state: watch::Sender<IndexValuesState>,
    request: Mutex<Arc<IndexValuesRequest>>,
    seq: AtomicU64,
    listener: Mutex<Option<Listener>>,
}

impl<S: DocumentStore> ObserverInner<S> {
    fn current_request(&self) -> Arc<IndexValuesRequest> {
        Arc::clone(&self.request.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn dispatch(&self, action: &IndexValuesAction) {
        self.state.send_modify(|state| {
            let current = std::mem::take(state);
            *state = self.machine.run(current, action);
        });
    }

    fn run(self: &Arc<Self>) {
        let request = self.request.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = RequestTicket::new(
            self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            Arc::clone(&request),
        );
        let fetch = self.client.query_index_values(&request);
        self.dispatch(&IndexValuesAction::Started {
            request: ticket.clone(),
        });
        drop(request);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                store_id = %ticket.request.store_id,
                field = %ticket.request.field,
                "no tokio runtime, index values read cannot be driven"
            );
            self.dispatch(&IndexValuesAction::Failed {
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
                Ok(response) => IndexValuesAction::Completed {
                    request: ticket,
                    response,
                },
                Err(error) => {
                    tracing::warn!(
                        store_id = %ticket.request.store_id,
                        field = %ticket.request.field,
                        %error,
                        "index values read failed"
                    );
                    IndexValuesAction::Failed {
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
                observer.run();
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

/// Keeps the values of one index in sync with the store.
///
/// Reads run on the current tokio runtime. Outside a runtime every read fails
/// with [`StoreError::NoRuntime`].
pub struct IndexValuesObserver<S: DocumentStore> {
    inner: Arc<ObserverInner<S>>,
}

impl<S: DocumentStore> IndexValuesObserver<S> {
    /// Creates an observer, reads the index and re-reads it on every store mutation.
    pub fn new(client: Arc<QueryClient<S>>, request: IndexValuesRequest) -> Self {
        let (state, _) = watch::channel(IndexValuesState::Idle);
        let store_id = request.store_id.clone();
        let inner = Arc::new(ObserverInner {
            client,
            machine: index_values_machine(),
            state,
            request: Mutex::new(Arc::new(request)),
            seq: AtomicU64::new(0),
            listener: Mutex::new(None),
        });
        inner.subscribe(&store_id);
        inner.run();

        Self { inner }
    }

    /// Switches to another store or field and reads it.
    pub fn set_request(&self, request: IndexValuesRequest) {
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
        self.inner.run();
    }

    pub fn refetch(&self) {
        self.inner.run();
    }

    pub fn state(&self) -> IndexValuesState {
        self.inner.state.borrow().clone()
    }

    pub fn request(&self) -> Arc<IndexValuesRequest> {
        self.inner.current_request()
    }

    pub fn subscribe(&self) -> watch::Receiver<IndexValuesState> {
        self.inner.state.subscribe()
    }

    pub fn stream(&self) -> BoxStream<'static, IndexValuesState> {
        WatchStream::new(self.subscribe()).boxed()
    }
}

impl<S: DocumentStore> Drop for IndexValuesObserver<S> {
    fn drop(&mut self) {
        let store_id = self.inner.current_request().store_id.clone();
        self.inner.unsubscribe(&store_id);
    }
}

impl<S: DocumentStore> fmt::Debug for IndexValuesObserver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexValuesObserver")
            .field("request", &self.inner.current_request())
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}
