use super::*;
use crate::error::FetchError;
use crate::models::{Track, TrackFetcher, TrackStore};
use crate::testing::{ids, remote_track};
use futures::StreamExt;
use melo_remote::error::ErrorKind as RemoteErrorKind;
use melo_remote::models::RemoteTrack;
use melo_remote::{Call, MockCatalog};
use std::time::Duration;

type Tracks = Repository<Track, RemoteTrack>;

async fn repository(api: &Arc<MockCatalog>, strategy: CacheStrategy) -> Tracks {
    let db = Database::connect_in_memory().await.unwrap();
    let fetcher = Arc::new(TrackFetcher::new(api.clone(), 50));
    Repository::new(db, fetcher, Arc::new(TrackStore::default()), strategy, CancellationToken::new())
}

fn catalog(tracks: &[&str]) -> Arc<MockCatalog> {
    Arc::new(MockCatalog::default().with_tracks(tracks.iter().map(|id| remote_track(id, &["a1"]))))
}

fn hour() -> CacheStrategy {
    CacheStrategy::ttl(Duration::from_secs(3600))
}

#[tokio::test]
async fn test_first_emission_is_not_found() {
    let api = catalog(&["t1"]);
    let repo = repository(&api, hour()).await;
    let cell = repo.state_of("t1");
    let states: Vec<_> = cell.subscribe().take(3).collect().await;
    assert_eq!(states[0], CacheState::NotFound);
    assert_eq!(states[1], CacheState::Loading);
    assert_eq!(states[2].value().map(|t| t.id.as_str()), Some("t1"));
    assert_eq!(api.calls(Call::Tracks), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_fetch() {
    let api = Arc::new(
        MockCatalog::default()
            .with_tracks([remote_track("t1", &["a1"])])
            .with_delay(Duration::from_millis(200)),
    );
    let repo = repository(&api, hour()).await;
    let mut tasks = Vec::new();
    for n in 0..20 {
        let repo = repo.clone();
        tasks.push(tokio::spawn(async move {
            match n % 3 {
                0 => repo.refresh("t1").await,
                1 => repo.get("t1").await,
                _ => {
                    let cell = repo.state_of("t1");
                    let mut subscription = cell.subscribe();
                    subscription.wait_for(CacheState::is_terminal).await.unwrap()
                },
            }
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().value().is_some());
    }
    assert_eq!(api.calls(Call::Tracks), 1);
    assert!(!repo.is_in_flight("t1"));
}

#[tokio::test]
async fn test_states_of_batches_distinct_ids() {
    let api = Arc::new(
        MockCatalog::default()
            .with_tracks(["t1", "t2", "t3", "t4", "t5"].map(|id| remote_track(id, &[])))
            .with_max_batch_size(2),
    );
    let db = Database::connect_in_memory().await.unwrap();
    let fetcher = Arc::new(TrackFetcher::new(api.clone(), 50));
    assert_eq!(fetcher.max_batch_size(), 2);
    let repo: Tracks = Repository::new(db, fetcher, Arc::new(TrackStore::default()), hour(), CancellationToken::new());

    let cells = repo.states_of(["t1", "t2", "t1", "t3", "t4", "t5"]);
    assert_eq!(cells.len(), 6);
    assert!(cells[0].same_cell(&cells[2]));
    for cell in &cells {
        cell.subscribe().wait_for(CacheState::is_terminal).await.unwrap();
    }
    assert_eq!(api.requests(Call::Tracks), vec![ids(&["t1", "t2"]), ids(&["t3", "t4"]), ids(&["t5"])]);

    // Everything is cached now.
    repo.states_of(["t1", "t2", "t3"]);
    assert_eq!(repo.get("t4").await.value().map(|t| t.id.clone()), Some("t4".to_string()));
    assert_eq!(api.calls(Call::Tracks), 3);
}

#[tokio::test]
async fn test_valid_cache_is_served_without_fetching() {
    let api = catalog(&["t1"]);
    let repo = repository(&api, hour()).await;
    assert!(repo.get("t1").await.value().is_some());
    // No live cell is left: the second access reloads from the store.
    assert_eq!(repo.live_cells(), 0);
    let state = repo.get("t1").await;
    assert_eq!(state.value().map(|t| t.name.as_str()), Some("Track t1"));
    assert_eq!(api.calls(Call::Tracks), 1);
}

#[tokio::test]
async fn test_never_valid_always_fetches() {
    let api = catalog(&["t1"]);
    let repo = repository(&api, CacheStrategy::NeverValid).await;
    repo.get("t1").await;
    repo.get("t1").await;
    assert_eq!(api.calls(Call::Tracks), 2);
}

#[tokio::test]
async fn test_expired_value_is_never_published() {
    let api = catalog(&["t1"]);
    let repo = repository(&api, CacheStrategy::NeverValid).await;
    repo.get("t1").await;

    let cell = repo.state_of("t1");
    let states: Vec<_> = cell.subscribe().take(3).collect().await;
    assert_eq!(states[0], CacheState::NotFound);
    assert_eq!(states[1], CacheState::Loading);
    assert!(states[2].value().is_some());
    assert_eq!(api.calls(Call::Tracks), 2);
}

#[tokio::test]
async fn test_refreshable_serves_cached_value_then_refreshes() {
    let api = catalog(&["t1"]);
    let strategy = CacheStrategy::Ttl { valid_for: Duration::from_secs(3600), refresh_after: Some(Duration::ZERO) };
    let repo = repository(&api, strategy).await;
    repo.get("t1").await;

    let mut renamed = remote_track("t1", &["a1"]);
    renamed.name = "Renamed".to_string();
    api.insert_track(renamed);

    let cell = repo.state_of("t1");
    let states: Vec<_> = cell.subscribe().take(3).collect().await;
    assert_eq!(states[0], CacheState::NotFound);
    assert_eq!(states[1].value().map(|t| t.name.as_str()), Some("Track t1"));
    assert_eq!(states[2].value().map(|t| t.name.as_str()), Some("Renamed"));
    assert_eq!(api.calls(Call::Tracks), 2);
}

#[tokio::test]
async fn test_unknown_id_is_not_retried_automatically() {
    let api = catalog(&[]);
    let repo = repository(&api, hour()).await;
    let cell = repo.state_of("missing");
    let state = cell.subscribe().wait_for(CacheState::is_terminal).await.unwrap();
    assert_eq!(state, CacheState::Error(FetchError::NotFoundRemote("missing".to_string())));

    repo.state_of("missing");
    assert_eq!(repo.get("missing").await, state);
    assert_eq!(api.calls(Call::Tracks), 1);

    api.insert_track(remote_track("missing", &[]));
    assert!(repo.refresh("missing").await.value().is_some());
    assert_eq!(api.calls(Call::Tracks), 2);
}

#[tokio::test]
async fn test_error_supersedes_loaded_value() {
    let api = catalog(&["t1"]);
    let repo = repository(&api, hour()).await;
    let cell = repo.state_of("t1");
    cell.subscribe().wait_for(CacheState::is_terminal).await.unwrap();
    assert!(cell.get().value().is_some());

    api.fail(Call::Tracks, RemoteErrorKind::Network("offline".to_string()));
    let state = repo.refresh("t1").await;
    assert!(matches!(state, CacheState::Error(FetchError::NetworkFailure(_))));
    assert_eq!(cell.get(), state);

    api.clear_failure(Call::Tracks);
    assert!(repo.refresh("t1").await.value().is_some());
    assert!(cell.get().value().is_some());
}

#[tokio::test]
async fn test_refresh_fetches_even_when_cached() {
    let api = catalog(&["t1"]);
    let repo = repository(&api, CacheStrategy::NeverInvalidate).await;
    repo.get("t1").await;
    let cell = repo.state_of("t1");
    let mut subscription = cell.subscribe();
    let state = repo.refresh("t1").await;
    assert!(state.value().is_some());
    assert_eq!(api.calls(Call::Tracks), 2);
    // A forced fetch goes through Loading like any other cycle.
    assert!(subscription.wait_for(CacheState::is_loading).await.is_some());
}

#[tokio::test]
async fn test_cancellation_rolls_back_loading() {
    let api = Arc::new(
        MockCatalog::default()
            .with_tracks([remote_track("t1", &["a1"])])
            .with_delay(Duration::from_secs(30)),
    );
    let repo = repository(&api, hour()).await;
    let cell = repo.state_of("t1");
    let mut subscription = cell.subscribe();
    assert_eq!(subscription.next().await, Some(CacheState::NotFound));
    assert_eq!(subscription.next().await, Some(CacheState::Loading));
    assert!(repo.is_in_flight("t1"));

    repo.close();
    assert_eq!(subscription.next().await, Some(CacheState::NotFound));
    assert!(!repo.is_in_flight("t1"));
    assert_eq!(cell.get(), CacheState::NotFound);
    assert_eq!(api.calls(Call::Tracks), 1);

    // Nothing starts after closing.
    assert_eq!(repo.get("t1").await, CacheState::Error(FetchError::Cancelled));
    assert_eq!(cell.get(), CacheState::NotFound);
}

#[tokio::test]
async fn test_invalidate_forces_next_access_to_fetch() {
    let api = catalog(&["t1"]);
    let repo = repository(&api, CacheStrategy::NeverInvalidate).await;
    repo.get("t1").await;
    repo.invalidate("t1").await.unwrap();
    assert!(repo.get("t1").await.value().is_some());
    assert_eq!(api.calls(Call::Tracks), 2);
}

#[tokio::test]
async fn test_invalidate_reloads_live_cells() {
    let api = catalog(&["t1"]);
    let repo = repository(&api, CacheStrategy::NeverInvalidate).await;
    let cell = repo.state_of("t1");
    let mut subscription = cell.subscribe();
    subscription.wait_for(CacheState::is_terminal).await.unwrap();
    repo.invalidate("t1").await.unwrap();
    assert_eq!(subscription.next().await, Some(CacheState::Loading));
    assert!(subscription.next().await.is_some_and(|s| s.value().is_some()));
    assert_eq!(api.calls(Call::Tracks), 2);
}

#[tokio::test]
async fn test_unobserved_cells_are_released() {
    let api = catalog(&["t1", "t2"]);
    let repo = repository(&api, hour()).await;
    let kept = repo.state_of("t1");
    let dropped = repo.state_of("t2");
    dropped.subscribe().wait_for(CacheState::is_terminal).await.unwrap();
    kept.subscribe().wait_for(CacheState::is_terminal).await.unwrap();
    drop(dropped);
    assert_eq!(repo.live_cells(), 1);
    assert!(repo.state_of("t1").same_cell(&kept));
}

#[tokio::test]
#[should_panic(expected = "must not be empty")]
async fn test_empty_id_is_rejected() {
    let api = catalog(&[]);
    repository(&api, hour()).await.state_of("");
}
