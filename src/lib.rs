//! # store-query - cached, race-free reads over a document store
//!
//! store-query sits between an application and a document store that can run
//! filtered queries. It dedupes identical requests, caches responses per
//! store, invalidates them when the store is mutated, and tracks every read
//! through a small state machine so that late responses of superseded
//! requests can never overwrite newer ones.
//!
//! ## Architecture
//!
//! 1. **Store**: a [`DocumentStore`](store::DocumentStore) runs queries and mutations
//! 2. **Client**: a [`QueryClient`](client::QueryClient) caches reads and invalidates them on writes
//! 3. **Observers**: [`QueryObserver`](query::QueryObserver), [`IndexValuesObserver`](index_values::IndexValuesObserver)
//!    and [`MutationObserver`](mutation::MutationObserver) drive one lifecycle each
//! 4. **State machines**: a [`StateMachine`](state_machine::StateMachine) is an ordered list of transitions
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use store_query::prelude::*;
//!
//! # async fn demo() {
//! let store = MockStore::new();
//! store.insert("books", vec!["dune".to_string()]);
//! let client = Arc::new(QueryClient::new(store));
//!
//! let observer = QueryObserver::new(Arc::clone(&client), QueryRequest::new("books"));
//! let mut states = observer.subscribe();
//! while !states.borrow_and_update().is_success() {
//!     if states.changed().await.is_err() {
//!         break;
//!     }
//! }
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod index_values;
pub mod mock;
pub mod mutation;
pub mod prelude;
pub mod query;
pub mod request;
pub mod state_machine;
pub mod store;
