// Integration tests for query observers

use std::sync::Arc;

use store_query::prelude::*;
use store_query::query::QueryTicket;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

type Doc = serde_json::Value;

fn book(title: &str, genre: &str) -> Doc {
    serde_json::json!({ "title": title, "genre": genre })
}

fn seeded_store() -> MockStore<Doc> {
    let store = MockStore::new();
    store.insert("books", vec![book("dune", "fiction")]);
    store
}

fn fiction() -> QueryRequest {
    QueryRequest::new("books").with_filters_applied(["fiction"])
}

fn poetry() -> QueryRequest {
    QueryRequest::new("books").with_filters_applied(["poetry"])
}

async fn wait_until(
    states: &mut watch::Receiver<QueryState<Doc>>,
    predicate: impl FnMut(&QueryState<Doc>) -> bool,
) -> color_eyre::Result<QueryState<Doc>> {
    let state = timeout(Duration::from_secs(1), states.wait_for(predicate)).await??;
    Ok(state.clone())
}

fn seq(ticket: Option<&QueryTicket>) -> Option<u64> {
    ticket.map(|ticket| ticket.seq)
}

#[tokio::test]
async fn test_concurrent_identical_queries_hit_store_once() -> color_eyre::Result<()> {
    let store = seeded_store();
    let client = Arc::new(QueryClient::new(store.clone()));

    let first = QueryObserver::new(Arc::clone(&client), fiction());
    let second = QueryObserver::new(Arc::clone(&client), fiction());

    let mut first_states = first.subscribe();
    let mut second_states = second.subscribe();
    let a = wait_until(&mut first_states, QueryState::is_success).await?;
    let b = wait_until(&mut second_states, QueryState::is_success).await?;

    assert_eq!(store.query_calls(), 1);
    let (Some(a), Some(b)) = (a.response(), b.response()) else {
        panic!("both observers show a response");
    };
    assert!(Arc::ptr_eq(a, b));
    Ok(())
}

#[tokio::test]
async fn test_late_response_of_superseded_request_is_ignored() -> color_eyre::Result<()> {
    let store = seeded_store();
    store.hold_queries();
    let config = ClientConfig::default().with_cancellation(false);
    let client = Arc::new(QueryClient::with_config(store.clone(), config));

    let observer = QueryObserver::new(Arc::clone(&client), fiction());
    observer.set_request(poetry());
    assert_eq!(store.query_calls(), 2);
    assert!(!store.was_aborted(0));

    let mut states = observer.subscribe();
    assert!(store.release(1));
    let state = wait_until(&mut states, QueryState::is_success).await?;
    assert_eq!(seq(state.request()), Some(2));

    states.mark_unchanged();
    assert!(store.release(0));
    timeout(Duration::from_secs(1), states.changed()).await??;

    let state = observer.state();
    assert!(state.is_success());
    assert_eq!(seq(state.request()), Some(2));
    assert_eq!(
        state.request().map(|ticket| ticket.request.filters_applied.clone()),
        Some(vec!["poetry".to_string()])
    );
    Ok(())
}

#[tokio::test]
async fn test_superseded_request_is_aborted() -> color_eyre::Result<()> {
    let store = seeded_store();
    store.hold_queries();
    let client = Arc::new(QueryClient::new(store.clone()));

    let observer = QueryObserver::new(Arc::clone(&client), fiction());
    observer.set_request(poetry());
    assert!(store.was_aborted(0));
    assert!(!store.was_aborted(1));

    let mut states = observer.subscribe();
    assert!(store.release(1));
    let state = wait_until(&mut states, QueryState::is_success).await?;
    assert_eq!(seq(state.request()), Some(2));
    assert_eq!(client.query_cache().resolved_len("books"), 1);
    Ok(())
}

#[tokio::test]
async fn test_reissuing_identical_request_shares_fetch() -> color_eyre::Result<()> {
    let store = seeded_store();
    store.hold_queries();
    let client = Arc::new(QueryClient::new(store.clone()));

    let observer = QueryObserver::new(Arc::clone(&client), fiction());
    observer.set_request(fiction());
    assert_eq!(store.query_calls(), 1);
    assert_eq!(store.aborted_queries(), 0);

    let mut states = observer.subscribe();
    store.release_all();
    let state = wait_until(&mut states, QueryState::is_success).await?;
    assert_eq!(seq(state.request()), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_store_mutation_marks_stats_stale_and_refetches() -> color_eyre::Result<()> {
    let store = seeded_store();
    let client = Arc::new(QueryClient::new(store.clone()));
    let observer = QueryObserver::new(Arc::clone(&client), fiction());

    let mut states = observer.subscribe();
    let state = wait_until(&mut states, QueryState::is_success).await?;
    assert_eq!(state.response().map(|response| response.number_of_documents), Some(1));

    store.hold_queries();
    client.add_documents("books", vec![book("emma", "fiction")]).await?;

    let state = observer.state();
    assert!(state.is_stale());
    assert!(state.are_stats_stale());
    assert_eq!(state.trigger(), Some(Trigger::StoreMutation));
    assert_eq!(state.response().map(|response| response.number_of_documents), Some(1));
    assert_eq!(store.query_calls(), 2);

    store.release_all();
    let state = wait_until(&mut states, QueryState::is_success).await?;
    assert_eq!(state.response().map(|response| response.number_of_documents), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_store_mutation_aborts_identical_in_flight_request() -> color_eyre::Result<()> {
    let store = seeded_store();
    store.hold_queries();
    let client = Arc::new(QueryClient::new(store.clone()));
    let observer = QueryObserver::new(Arc::clone(&client), fiction());

    client.add_documents("books", vec![book("emma", "fiction")]).await?;
    assert_eq!(store.query_calls(), 2);
    assert!(store.was_aborted(0));

    let mut states = observer.subscribe();
    assert!(store.release(1));
    let state = wait_until(&mut states, QueryState::is_success).await?;
    assert_eq!(state.response().map(|response| response.number_of_documents), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_changing_filters_marks_stats_stale() -> color_eyre::Result<()> {
    let store = seeded_store();
    let client = Arc::new(QueryClient::new(store.clone()));
    let observer = QueryObserver::new(Arc::clone(&client), fiction());

    let mut states = observer.subscribe();
    wait_until(&mut states, QueryState::is_success).await?;

    store.hold_queries();
    observer.set_request(fiction().with_page(2, 10));
    let state = observer.state();
    assert!(state.is_stale());
    assert!(!state.are_stats_stale());

    observer.set_request(poetry());
    let state = observer.state();
    assert!(state.is_stale());
    assert!(state.are_stats_stale());
    Ok(())
}

#[tokio::test]
async fn test_failed_query_reports_error_then_recovers() -> color_eyre::Result<()> {
    let store = seeded_store();
    store.fail_next_query(StoreError::QueryFailed("corrupt index".into()));
    let client = Arc::new(QueryClient::new(store.clone()));
    let observer = QueryObserver::new(Arc::clone(&client), fiction());

    let mut states = observer.subscribe();
    let state = wait_until(&mut states, QueryState::is_error).await?;
    assert_eq!(state.error(), Some(&StoreError::QueryFailed("corrupt index".into())));

    observer.refetch();
    let state = wait_until(&mut states, QueryState::is_success).await?;
    assert_eq!(state.response().map(|response| response.number_of_documents), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_observer_follows_store_changes() -> color_eyre::Result<()> {
    let store = seeded_store();
    store.insert("films", Vec::new());
    let client = Arc::new(QueryClient::new(store.clone()));

    let observer = QueryObserver::new(Arc::clone(&client), fiction());
    assert_eq!(client.listener_count("books"), 1);

    observer.set_request(QueryRequest::new("films"));
    assert_eq!(client.listener_count("books"), 0);
    assert_eq!(client.listener_count("films"), 1);

    drop(observer);
    assert_eq!(client.listener_count("films"), 0);
    Ok(())
}

#[tokio::test]
async fn test_observers_sharing_a_fetch_abort_independently() -> color_eyre::Result<()> {
    let store = seeded_store();
    store.hold_queries();
    let client = Arc::new(QueryClient::new(store.clone()));

    let switching = QueryObserver::new(Arc::clone(&client), fiction());
    let staying = QueryObserver::new(Arc::clone(&client), fiction());
    assert_eq!(store.query_calls(), 1);

    switching.set_request(poetry());
    assert_eq!(store.query_calls(), 2);
    assert!(!store.was_aborted(0));

    let mut states = staying.subscribe();
    store.release_all();
    let state = wait_until(&mut states, |state| !state.is_fetching()).await?;
    assert!(state.is_success());
    assert_eq!(state.response().map(|response| response.number_of_documents), Some(1));

    let mut states = switching.subscribe();
    let state = wait_until(&mut states, QueryState::is_success).await?;
    assert_eq!(seq(state.request()), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_store_is_aborted_once_every_sharing_observer_moves_on() -> color_eyre::Result<()> {
    let store = seeded_store();
    store.hold_queries();
    let client = Arc::new(QueryClient::new(store.clone()));

    let first = QueryObserver::new(Arc::clone(&client), fiction());
    let second = QueryObserver::new(Arc::clone(&client), fiction());

    first.set_request(poetry());
    assert!(!store.was_aborted(0));
    second.set_request(poetry());
    assert!(store.was_aborted(0));
    assert_eq!(store.query_calls(), 2);

    let third = QueryObserver::new(Arc::clone(&client), fiction());
    assert_eq!(store.query_calls(), 3);
    assert!(third.state().is_loading());
    store.release_all();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reruns_track_latest_request() -> color_eyre::Result<()> {
    let store = seeded_store();
    store.hold_queries();
    let client = Arc::new(QueryClient::new(store.clone()));
    let observer = QueryObserver::new(Arc::clone(&client), fiction());

    for round in 0..50 {
        let mutation = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.add_documents("books", vec![book("emma", "fiction")]).await }
        });
        let genre = if round % 2 == 0 { "poetry" } else { "fiction" };
        observer.set_request(QueryRequest::new("books").with_filters_applied([genre]));
        mutation.await??;

        let state = observer.state();
        assert_eq!(
            state.in_flight().map(|ticket| ticket.request.filters_applied.clone()),
            Some(vec![genre.to_string()])
        );
    }

    store.release_all();
    Ok(())
}
