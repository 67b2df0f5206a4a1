use super::*;
use crate::credentials::TokenUpdate;
use crate::error::AuthError;
use std::sync::atomic::AtomicUsize;
use tempfile::TempDir;
use tokio::sync::Notify;

/// Lifecycle double that counts calls; refreshes can be held open until
/// released.
struct MockLifecycle {
    refresh_calls: AtomicUsize,
    auth_flows: AtomicUsize,
    hold: bool,
    release: Notify,
}

impl MockLifecycle {
    fn new(hold: bool) -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            auth_flows: AtomicUsize::new(0),
            hold,
            release: Notify::new(),
        })
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn auth_flows(&self) -> usize {
        self.auth_flows.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialLifecycle for MockLifecycle {
    async fn refresh(&self) -> Result<RefreshOutcome> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold {
            self.release.notified().await;
        }
        Err(AuthError::TokenExchangeFailed("connection refused".to_string()))
    }

    fn start_auth_flow(&self) -> String {
        self.auth_flows.fetch_add(1, Ordering::SeqCst);
        "https://example.com/oauth/authorize?state=test".to_string()
    }
}

fn create_store(dir: &TempDir) -> Arc<CredentialStore> {
    Arc::new(CredentialStore::open(
        dir.path().join("credentials.json"),
        chrono::Duration::minutes(5),
    ))
}

fn seed(store: &CredentialStore, issued_at: DateTime<Utc>, expires_in: i64) {
    store
        .update(
            TokenUpdate {
                access_token: "access".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_in,
                installed_app_id: None,
                location_id: None,
            },
            issued_at,
        )
        .unwrap();
}

fn create_scheduler(
    store: &Arc<CredentialStore>,
    lifecycle: &Arc<MockLifecycle>,
) -> RefreshScheduler {
    RefreshScheduler::new(
        Arc::clone(store),
        Arc::clone(lifecycle) as Arc<dyn CredentialLifecycle>,
        Duration::from_millis(20),
    )
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_tick_without_record_is_idle() {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let lifecycle = MockLifecycle::new(false);
    let scheduler = create_scheduler(&store, &lifecycle);

    assert_eq!(scheduler.tick(Utc::now()), TickAction::Idle);
    assert_eq!(lifecycle.refresh_calls(), 0);
    assert_eq!(lifecycle.auth_flows(), 0);
}

#[tokio::test]
async fn test_tick_with_fresh_token_is_idle() {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let now = Utc::now();
    seed(&store, now, 3600);
    let lifecycle = MockLifecycle::new(false);
    let scheduler = create_scheduler(&store, &lifecycle);

    assert_eq!(scheduler.tick(now), TickAction::Idle);
    assert_eq!(lifecycle.refresh_calls(), 0);
}

#[tokio::test]
async fn test_refresh_not_duplicated_while_in_flight() {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let now = Utc::now();
    // Access token expires in four minutes, inside the five minute buffer
    seed(&store, now, 240);
    let lifecycle = MockLifecycle::new(true);
    let scheduler = create_scheduler(&store, &lifecycle);

    assert_eq!(scheduler.tick(now), TickAction::RefreshStarted);
    assert_eq!(
        scheduler.tick(now + chrono::Duration::seconds(1)),
        TickAction::RefreshInFlight
    );

    wait_until(|| lifecycle.refresh_calls() == 1).await;
    assert!(scheduler.is_refreshing());
    assert_eq!(lifecycle.refresh_calls(), 1);

    // The failed refresh is retried on a later tick
    lifecycle.release.notify_one();
    wait_until(|| !scheduler.is_refreshing()).await;
    assert_eq!(store.current().unwrap().access_token, "access");

    assert_eq!(
        scheduler.tick(now + chrono::Duration::seconds(60)),
        TickAction::RefreshStarted
    );
    lifecycle.release.notify_one();
    wait_until(|| lifecycle.refresh_calls() == 2 && !scheduler.is_refreshing()).await;
    assert_eq!(lifecycle.auth_flows(), 0);
}

#[tokio::test]
async fn test_expired_refresh_token_restarts_authorization() {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let now = Utc::now();
    seed(&store, now - chrono::Duration::days(31), 3600);
    let lifecycle = MockLifecycle::new(false);
    let scheduler = create_scheduler(&store, &lifecycle);

    assert_eq!(scheduler.tick(now), TickAction::Reauthorize);
    assert!(store.current().is_none());
    assert!(!store.path().exists());
    assert_eq!(lifecycle.auth_flows(), 1);
    assert_eq!(lifecycle.refresh_calls(), 0);

    // Nothing left to act on afterwards
    assert_eq!(scheduler.tick(now), TickAction::Idle);
    assert_eq!(lifecycle.auth_flows(), 1);
}

#[tokio::test]
async fn test_refresh_token_inside_buffer_restarts_authorization() {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let now = Utc::now();
    // Refresh token lapses in four minutes
    seed(
        &store,
        now - chrono::Duration::days(30) + chrono::Duration::minutes(4),
        3600,
    );
    let lifecycle = MockLifecycle::new(false);
    let scheduler = create_scheduler(&store, &lifecycle);

    assert_eq!(scheduler.tick(now), TickAction::Reauthorize);
    assert_eq!(lifecycle.refresh_calls(), 0);
}

#[tokio::test]
async fn test_tick_retries_failed_write() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("credentials.json");
    std::fs::create_dir(&path).unwrap();
    let store = Arc::new(CredentialStore::open(&path, chrono::Duration::minutes(5)));
    let now = Utc::now();
    seed(&store, now, 3600);
    assert!(store.is_dirty());

    std::fs::remove_dir(&path).unwrap();
    let lifecycle = MockLifecycle::new(false);
    let scheduler = create_scheduler(&store, &lifecycle);

    assert_eq!(scheduler.tick(now), TickAction::Idle);
    assert!(!store.is_dirty());
    assert!(path.is_file());
}

#[tokio::test]
async fn test_start_and_stop() {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    seed(&store, Utc::now(), 60);
    let lifecycle = MockLifecycle::new(false);
    let scheduler = create_scheduler(&store, &lifecycle);

    assert!(!scheduler.is_running());
    scheduler.start();
    scheduler.start();
    assert!(scheduler.is_running());

    wait_until(|| lifecycle.refresh_calls() >= 2).await;

    scheduler.stop();
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn test_stop_aborts_refresh_in_flight() {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let now = Utc::now();
    seed(&store, now, 60);
    let lifecycle = MockLifecycle::new(true);
    let scheduler = create_scheduler(&store, &lifecycle);

    assert_eq!(scheduler.tick(now), TickAction::RefreshStarted);
    wait_until(|| lifecycle.refresh_calls() == 1).await;

    scheduler.stop();
    wait_until(|| !scheduler.is_refreshing()).await;
}
