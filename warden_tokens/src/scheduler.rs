//! Expiry-driven renewal scheduling
//!
//! The scheduler watches the access token. Whenever it changes, any pending
//! wake-up is cancelled and a new one is computed from the token's `exp`:
//!
//! * more than [`REFRESH_THRESHOLD`] remaining: wake when the threshold is reached
//! * less than that: wake at half the remaining time, but no sooner than
//!   [`MIN_CHECK_INTERVAL`]
//! * already expired, absent or undecodable: stay idle
//!
//! On waking, the [`ExpiryHandler`] is invoked and the next wake-up is
//! computed from whatever token is current by then.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::watch;
use warden_clock::{Clock, System, UnixTime};

use crate::{claims::decode_expiry, task::TaskHandle, AccessToken};

/// How long before expiry a token becomes due for renewal
pub const REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// The shortest delay between two checks of the same token
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Computes how long to wait before checking a token expiring at `exp`
///
/// Returns `None` if the token has already expired.
pub fn next_check_delay(exp: UnixTime, now: UnixTime) -> Option<Duration> {
    let until_expiry = now.checked_duration_until(exp)?;

    if until_expiry > REFRESH_THRESHOLD {
        Some(until_expiry - REFRESH_THRESHOLD)
    } else {
        Some((until_expiry / 2).max(MIN_CHECK_INTERVAL))
    }
}

/// Callback invoked when the scheduler wakes up
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    /// Checks whether the current token needs renewal, renewing it if so
    async fn on_expiry_check(&self);
}

#[async_trait]
impl<H: ExpiryHandler + ?Sized> ExpiryHandler for Arc<H> {
    async fn on_expiry_check(&self) {
        H::on_expiry_check(&**self).await
    }
}

/// The observable state of an [`ExpiryScheduler`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// No token with a future expiry is held
    Idle,
    /// A wake-up is pending
    Scheduled {
        /// The wall-clock time of the pending wake-up
        fires_at: UnixTime,
    },
    /// The handler is running
    Fired,
}

/// A background task that wakes up shortly before the access token expires
///
/// Dropping the scheduler cancels any pending wake-up.
#[derive(Debug)]
pub struct ExpiryScheduler {
    state: watch::Receiver<SchedulerState>,
    _task: TaskHandle,
}

impl ExpiryScheduler {
    /// Spawns a scheduler over the given access token stream
    pub fn spawn<H>(tokens: watch::Receiver<Option<AccessToken>>, handler: H) -> Self
    where
        H: ExpiryHandler + 'static,
    {
        Self::spawn_with_clock(tokens, handler, System)
    }

    /// Spawns a scheduler that reads wall-clock time from `clock`
    pub fn spawn_with_clock<H, C>(
        tokens: watch::Receiver<Option<AccessToken>>,
        handler: H,
        clock: C,
    ) -> Self
    where
        H: ExpiryHandler + 'static,
        C: Clock + Send + Sync + 'static,
    {
        let (tx, rx) = watch::channel(SchedulerState::Idle);
        let task = TaskHandle::spawn(
            "expiry scheduler",
            run_scheduler(tokens, handler, tx, clock),
        );

        Self {
            state: rx,
            _task: task,
        }
    }

    /// The scheduler's current state
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }
}

async fn run_scheduler<H, C>(
    mut tokens: watch::Receiver<Option<AccessToken>>,
    handler: H,
    state: watch::Sender<SchedulerState>,
    clock: C,
) where
    H: ExpiryHandler,
    C: Clock,
{
    loop {
        let now = clock.now();
        let delay = tokens
            .borrow_and_update()
            .as_ref()
            .and_then(|t| decode_expiry(t.as_str()))
            .and_then(|exp| next_check_delay(exp, now));

        let Some(delay) = delay else {
            tracing::debug!("no renewable access token, scheduler idle");
            state.send_replace(SchedulerState::Idle);
            if tokens.changed().await.is_err() {
                tracing::debug!("token store dropped, stopping scheduler");
                return;
            }
            continue;
        };

        tracing::debug!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling token expiry check"
        );
        state.send_replace(SchedulerState::Scheduled {
            fires_at: now + delay,
        });

        tokio::select! {
            changed = tokens.changed() => {
                if changed.is_err() {
                    tracing::debug!("token store dropped, stopping scheduler");
                    return;
                }
                tracing::trace!("access token changed, rescheduling");
            }
            _ = tokio::time::sleep(delay) => {
                state.send_replace(SchedulerState::Fired);
                tracing::debug!("token expiry check due");
                handler.on_expiry_check().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{claims::test_support::token_expiring_at, TokenStore};

    const NOW_SECS: u64 = 1_700_000_000;

    #[derive(Debug, Default)]
    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl ExpiryHandler for CountingHandler {
        async fn on_expiry_check(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn token(exp_secs: u64) -> AccessToken {
        AccessToken::new(token_expiring_at(exp_secs))
    }

    #[test]
    fn delay_targets_threshold_for_long_lived_tokens() {
        let now = UnixTime::from_secs(NOW_SECS);
        assert_eq!(
            next_check_delay(UnixTime::from_secs(NOW_SECS + 3600), now),
            Some(Duration::from_secs(3300))
        );
    }

    #[test]
    fn delay_halves_remaining_time_inside_threshold() {
        let now = UnixTime::from_secs(NOW_SECS);
        assert_eq!(
            next_check_delay(UnixTime::from_secs(NOW_SECS + 120), now),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            next_check_delay(UnixTime::from_secs(NOW_SECS + 300), now),
            Some(Duration::from_secs(150))
        );
    }

    #[test]
    fn delay_is_floored_at_minimum_interval() {
        let now = UnixTime::from_secs(NOW_SECS);
        assert_eq!(
            next_check_delay(UnixTime::from_secs(NOW_SECS + 4), now),
            Some(MIN_CHECK_INTERVAL)
        );
    }

    #[test]
    fn expired_tokens_are_not_scheduled() {
        let now = UnixTime::from_secs(NOW_SECS);
        assert_eq!(next_check_delay(now, now), None);
        assert_eq!(next_check_delay(UnixTime::from_secs(NOW_SECS - 1), now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_without_token() {
        let store = TokenStore::in_memory();
        let clock = warden_clock::TestClock::new(UnixTime::from_secs(NOW_SECS));
        let handler = Arc::new(CountingHandler::default());

        let scheduler =
            ExpiryScheduler::spawn_with_clock(store.subscribe_access_token(), handler.clone(), clock);
        settle().await;

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        tokio::time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_at_threshold() {
        let store = TokenStore::in_memory();
        let clock = warden_clock::TestClock::new(UnixTime::from_secs(NOW_SECS));
        let handler = Arc::new(CountingHandler::default());
        store.set_access_token(Some(&token(NOW_SECS + 600))).unwrap();

        let scheduler = ExpiryScheduler::spawn_with_clock(
            store.subscribe_access_token(),
            handler.clone(),
            clock.clone(),
        );
        settle().await;

        assert_eq!(
            scheduler.state(),
            SchedulerState::Scheduled {
                fires_at: UnixTime::from_secs(NOW_SECS + 300)
            }
        );

        tokio::time::advance(Duration::from_secs(299)).await;
        settle().await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(301));
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);

        // 299 s remain, so the next check lands halfway there
        assert_eq!(
            scheduler.state(),
            SchedulerState::Scheduled {
                fires_at: UnixTime(NOW_SECS * 1000 + 301_000 + 149_500)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn token_change_reschedules_without_firing() {
        let store = TokenStore::in_memory();
        let clock = warden_clock::TestClock::new(UnixTime::from_secs(NOW_SECS));
        let handler = Arc::new(CountingHandler::default());
        store.set_access_token(Some(&token(NOW_SECS + 600))).unwrap();

        let scheduler = ExpiryScheduler::spawn_with_clock(
            store.subscribe_access_token(),
            handler.clone(),
            clock.clone(),
        );
        settle().await;

        tokio::time::advance(Duration::from_secs(200)).await;
        clock.advance(Duration::from_secs(200));
        store.set_access_token(Some(&token(NOW_SECS + 3800))).unwrap();
        settle().await;

        assert_eq!(
            scheduler.state(),
            SchedulerState::Scheduled {
                fires_at: UnixTime::from_secs(NOW_SECS + 3500)
            }
        );

        // The original wake-up at +300 s must not fire
        tokio::time::advance(Duration::from_secs(200)).await;
        settle().await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_token_cancels_pending_check() {
        let store = TokenStore::in_memory();
        let clock = warden_clock::TestClock::new(UnixTime::from_secs(NOW_SECS));
        let handler = Arc::new(CountingHandler::default());
        store.set_access_token(Some(&token(NOW_SECS + 600))).unwrap();

        let scheduler =
            ExpiryScheduler::spawn_with_clock(store.subscribe_access_token(), handler.clone(), clock);
        settle().await;

        store.destroy_tokens().unwrap();
        settle().await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_after_drop() {
        let store = TokenStore::in_memory();
        let clock = warden_clock::TestClock::new(UnixTime::from_secs(NOW_SECS));
        let handler = Arc::new(CountingHandler::default());
        store.set_access_token(Some(&token(NOW_SECS + 600))).unwrap();

        let scheduler =
            ExpiryScheduler::spawn_with_clock(store.subscribe_access_token(), handler.clone(), clock);
        settle().await;
        drop(scheduler);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
    }
}
