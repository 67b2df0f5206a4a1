//! Background refresh of the stored credentials.
//!
//! The scheduler polls on a fixed interval instead of arming a one-shot timer
//! per token, so a tick that was missed while the host slept is simply
//! picked up by the next one.

use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::oauth::RefreshOutcome;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Operations the scheduler needs from the OAuth flow.
#[async_trait]
pub trait CredentialLifecycle: Send + Sync {
    /// Exchange the stored refresh token for a new token pair
    async fn refresh(&self) -> Result<RefreshOutcome>;

    /// Begin a new authorization, returning the authorization URL
    fn start_auth_flow(&self) -> String;
}

/// What a single tick decided to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickAction {
    /// No record, or the access token is comfortably valid
    Idle,
    /// Refresh token lapsed: credentials cleared and authorization restarted
    Reauthorize,
    /// A refresh task was spawned
    RefreshStarted,
    /// A refresh was due but one is already running
    RefreshInFlight,
}

struct Shared {
    store: Arc<CredentialStore>,
    lifecycle: Arc<dyn CredentialLifecycle>,
    refresh_in_flight: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the in-flight flag when the refresh task ends, including on abort.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic credential refresher.
///
/// # Responsibilities
/// - Retry a credential file write that failed earlier
/// - Refresh the access token once it is inside the expiry buffer
/// - Restart authorization once the refresh token is inside the buffer
/// - Never run two refreshes at the same time
pub struct RefreshScheduler {
    shared: Arc<Shared>,
    poll_interval: Duration,
    /// Polling loop task handle
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<CredentialStore>,
        lifecycle: Arc<dyn CredentialLifecycle>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                lifecycle,
                refresh_in_flight: AtomicBool::new(false),
                refresh_task: Mutex::new(None),
            }),
            poll_interval,
            handle: Mutex::new(None),
        }
    }

    /// Starts the polling loop (non-blocking).
    ///
    /// The first tick runs immediately. Calling `start` on a running
    /// scheduler does nothing.
    pub fn start(&self) {
        let mut handle = lock(&self.handle);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Refresh scheduler already running");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let poll_interval = self.poll_interval;

        *handle = Some(tokio::spawn(async move {
            info!(
                interval_secs = poll_interval.as_secs(),
                "Starting refresh scheduler"
            );

            let mut timer = interval(poll_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                timer.tick().await;
                shared.tick(Utc::now());
            }
        }));
    }

    /// Stops the polling loop and aborts any refresh still in flight.
    pub fn stop(&self) {
        let loop_handle = lock(&self.handle).take();
        let refresh_handle = lock(&self.shared.refresh_task).take();

        if let Some(handle) = loop_handle {
            handle.abort();
            info!("Refresh scheduler stopped");
        }
        if let Some(handle) = refresh_handle {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Whether a refresh task is currently running
    pub fn is_refreshing(&self) -> bool {
        self.shared.refresh_in_flight.load(Ordering::Acquire)
    }

    /// Runs one scheduling step as of `now`.
    ///
    /// Must be called from within a Tokio runtime; refreshes are spawned.
    pub fn tick(&self, now: DateTime<Utc>) -> TickAction {
        self.shared.tick(now)
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> TickAction {
        if self.store.is_dirty() {
            self.store.retry_persist();
        }

        if self.store.current().is_none() {
            return TickAction::Idle;
        }

        if !self.store.is_refresh_valid(now) {
            warn!("Refresh token expired or about to expire, restarting authorization");
            self.store.clear();
            self.lifecycle.start_auth_flow();
            return TickAction::Reauthorize;
        }

        if self.store.is_access_valid(now) {
            return TickAction::Idle;
        }

        self.spawn_refresh()
    }

    fn spawn_refresh(self: &Arc<Self>) -> TickAction {
        if self
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Token refresh already in flight, skipping");
            return TickAction::RefreshInFlight;
        }

        info!("Access token near expiry, refreshing");

        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _guard = InFlightGuard(&shared.refresh_in_flight);

            match shared.lifecycle.refresh().await {
                Ok(RefreshOutcome::Refreshed(record)) => {
                    debug!(
                        access_expires_at = %record.access_expires_at,
                        "Scheduled refresh complete"
                    );
                }
                Ok(RefreshOutcome::Superseded) => {
                    debug!("Credentials changed during scheduled refresh, result discarded");
                }
                Ok(RefreshOutcome::ReauthorizationRequired { .. }) => {
                    warn!("Refresh token rejected during scheduled refresh, authorization restarted");
                }
                Err(e) => {
                    warn!(error = %e, "Token refresh failed, will retry on next tick");
                }
            }
        });

        *lock(&self.refresh_task) = Some(task);
        TickAction::RefreshStarted
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
