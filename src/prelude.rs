//! Prelude module for convenient imports.
//!
//! ```
//! use store_query::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The caching client
//! - [`DocumentStore`] - The store seam, with [`MockStore`] for tests
//! - [`QueryObserver`], [`IndexValuesObserver`], [`MutationObserver`] - Lifecycle observers
//! - Request and response types

pub use crate::client::{Listener, QueryClient, StoreChange, Trigger};
pub use crate::config::ClientConfig;
pub use crate::error::{Result, StoreError};
pub use crate::index_values::{IndexValuesObserver, IndexValuesState};
pub use crate::mock::MockStore;
pub use crate::mutation::{MutationObserver, MutationState, StoreMutator};
pub use crate::query::{QueryObserver, QueryState};
pub use crate::request::{
    AddDocumentsRequest, CreateStoreRequest, DeleteStoreRequest, FilterOperator, IndexValuesRequest,
    Operator, OrderDirection, QueryRequest,
};
pub use crate::state_machine::StateMachine;
pub use crate::store::{AbortHandle, DocumentStore, QueryResponse};
