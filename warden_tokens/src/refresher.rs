//! Refresh-token renewal with single-flight suppression
//!
//! Two entry points share one in-flight guard:
//!
//! * [`TokenRefresher::refresh_now`] performs a single exchange using the stored
//!   refresh token. This is what the [`ExpiryScheduler`][crate::ExpiryScheduler]
//!   invokes through the [`ExpiryHandler`] implementation.
//! * [`TokenRefresher::start_refresh_cycle`] spawns a loop that refreshes
//!   immediately and then again after 90% of the reported token lifetime,
//!   retrying on a fixed interval after failures.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use warden_clock::{Clock, System};

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler, WithBackoff},
    claims::decode_expiry,
    scheduler::{ExpiryHandler, MIN_CHECK_INTERVAL, REFRESH_THRESHOLD},
    task::TaskHandle,
    AccessTokenRef, RefreshToken, TokenAuthority, TokenRequestError, TokenSet, TokenStore,
    TokenStoreError,
};

/// A predicate reporting whether the host is currently on a route where
/// renewal must not start, such as the login or callback routes
pub type RestrictedCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// An error while refreshing tokens
#[derive(Debug, Error)]
pub enum RefreshError {
    /// A refresh cycle was started while the host was on a restricted route
    #[error("refresh cycle must not be started on a restricted route")]
    RestrictedPath,
    /// The authority rejected the refresh or could not be reached
    #[error("error refreshing tokens")]
    Request(#[from] TokenRequestError),
    /// The refreshed tokens could not be stored
    #[error("error storing refreshed tokens")]
    Store(#[from] TokenStoreError),
}

/// The result of a refresh attempt that did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens were obtained and stored
    Refreshed,
    /// Another refresh was already running; nothing was done
    AlreadyInFlight,
    /// No refresh token is held; nothing was done
    NoRefreshToken,
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    authority: Arc<dyn TokenAuthority>,
    store: TokenStore,
    restricted: Option<RestrictedCheck>,
    backoff: ErrorBackoffConfig,
    clock: Arc<dyn Clock + Send + Sync>,
    in_flight: AtomicBool,
    cycle: Mutex<Option<TaskHandle>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("authority", &self.authority)
            .field("backoff", &self.backoff)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_restricted(&self) -> bool {
        self.restricted.as_ref().map_or(false, |check| check())
    }

    /// Exchanges `refresh_token` and stores the result, returning the delay
    /// until the next cycle should run
    async fn refresh_with(
        &self,
        refresh_token: Option<RefreshToken>,
    ) -> Result<(RefreshOutcome, Option<Duration>), RefreshError> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            tracing::debug!("refresh already in flight");
            return Ok((RefreshOutcome::AlreadyInFlight, None));
        };

        let Some(refresh_token) = refresh_token else {
            tracing::info!("no refresh token available, skipping refresh");
            return Ok((RefreshOutcome::NoRefreshToken, None));
        };

        let refreshed = self.authority.refresh(&refresh_token).await?;

        let current = self.store.tokens();
        let next_delay = self.next_cycle_delay(refreshed.expires_in, &refreshed.access_token);
        let tokens = TokenSet {
            access_token: Some(refreshed.access_token),
            refresh_token: Some(refreshed.refresh_token.unwrap_or(refresh_token)),
            id_token: refreshed.id_token.or(current.id_token),
        };

        self.store.store_tokens(&tokens)?;

        tracing::info!(
            next_refresh_secs = next_delay.as_secs(),
            "tokens refreshed"
        );

        Ok((RefreshOutcome::Refreshed, Some(next_delay)))
    }

    fn next_cycle_delay(&self, expires_in: Option<Duration>, access: &AccessTokenRef) -> Duration {
        let lifetime = expires_in.or_else(|| {
            decode_expiry(access.as_str())
                .and_then(|exp| self.clock.now().checked_duration_until(exp))
        });

        match lifetime {
            Some(lifetime) => {
                Duration::from_secs(lifetime.as_secs().saturating_mul(9) / 10).max(MIN_CHECK_INTERVAL)
            }
            None => {
                tracing::debug!("token lifetime unknown, using retry interval");
                self.backoff_delay()
            }
        }
    }

    fn backoff_delay(&self) -> Duration {
        ErrorBackoffHandler::new(self.backoff).error()
    }
}

/// Renews tokens using the stored refresh token
///
/// Cloning is cheap and clones share the in-flight guard and refresh cycle.
/// The refresh cycle is cancelled once every clone has been dropped.
#[derive(Clone, Debug)]
pub struct TokenRefresher {
    inner: Arc<Inner>,
}

/// Configures a [`TokenRefresher`]
#[must_use]
pub struct TokenRefresherBuilder {
    authority: Arc<dyn TokenAuthority>,
    store: TokenStore,
    restricted: Option<RestrictedCheck>,
    backoff: ErrorBackoffConfig,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for TokenRefresherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefresherBuilder")
            .field("authority", &self.authority)
            .field("has_restricted_check", &self.restricted.is_some())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl TokenRefresherBuilder {
    /// Refuses to start refresh cycles while `check` returns `true`
    pub fn restricted_when<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.restricted = Some(Arc::new(check));
        self
    }

    /// Sets the delay policy after failed refreshes
    pub fn backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reads wall-clock time from `clock`
    pub fn clock<C: Clock + Send + Sync + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Builds the refresher
    pub fn build(self) -> TokenRefresher {
        TokenRefresher {
            inner: Arc::new(Inner {
                authority: self.authority,
                store: self.store,
                restricted: self.restricted,
                backoff: self.backoff,
                clock: self.clock,
                in_flight: AtomicBool::new(false),
                cycle: Mutex::new(None),
            }),
        }
    }
}

impl TokenRefresher {
    /// Constructs a refresher with the default 60 second retry interval
    pub fn new(authority: Arc<dyn TokenAuthority>, store: TokenStore) -> Self {
        Self::builder(authority, store).build()
    }

    /// Starts configuring a refresher
    pub fn builder(authority: Arc<dyn TokenAuthority>, store: TokenStore) -> TokenRefresherBuilder {
        TokenRefresherBuilder {
            authority,
            store,
            restricted: None,
            backoff: ErrorBackoffConfig::default(),
            clock: Arc::new(System),
        }
    }

    /// Performs one refresh using the stored refresh token
    ///
    /// Returns [`RefreshOutcome::AlreadyInFlight`] without side effects if a
    /// refresh is already running. On failure the stored tokens are left as
    /// they were.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_now(&self) -> Result<RefreshOutcome, RefreshError> {
        let refresh_token = self.inner.store.refresh_token();
        let (outcome, _) = self.inner.refresh_with(refresh_token).await?;
        Ok(outcome)
    }

    /// Starts the periodic refresh cycle, beginning with `refresh_token`
    ///
    /// Later cycles use whatever refresh token is stored at the time. Starting
    /// a cycle while one is running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::RestrictedPath`] if the restricted-route check
    /// reports that renewal must not start.
    pub fn start_refresh_cycle(&self, refresh_token: RefreshToken) -> Result<(), RefreshError> {
        if self.inner.is_restricted() {
            tracing::error!("refresh cycle started on a restricted route");
            return Err(RefreshError::RestrictedPath);
        }

        let mut cycle = self
            .inner
            .cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if cycle.as_ref().map_or(false, |c| !c.is_finished()) {
            tracing::debug!("refresh cycle already running");
            return Ok(());
        }

        tracing::debug!("starting refresh cycle");
        *cycle = Some(TaskHandle::spawn(
            "refresh cycle",
            run_cycle(Arc::downgrade(&self.inner), refresh_token, self.inner.backoff),
        ));

        Ok(())
    }

    /// Cancels the refresh cycle, if one is running
    pub fn stop_refresh_cycle(&self) {
        let handle = self
            .inner
            .cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if handle.is_some() {
            tracing::debug!("stopping refresh cycle");
        }
    }

    /// Whether a refresh cycle is currently running
    pub fn is_cycle_running(&self) -> bool {
        self.inner
            .cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |c| !c.is_finished())
    }

    /// Whether a refresh exchange is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ExpiryHandler for TokenRefresher {
    async fn on_expiry_check(&self) {
        let now = self.inner.clock.now();
        let due = self
            .inner
            .store
            .access_token()
            .and_then(|t| decode_expiry(t.as_str()))
            .map_or(false, |exp| {
                now.checked_duration_until(exp)
                    .map_or(true, |remaining| remaining < REFRESH_THRESHOLD)
            });

        if !due {
            tracing::trace!("access token not yet due for renewal");
            return;
        }

        if let Err(err) = self.refresh_now().await {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(error, "error renewing expiring access token");
        }
    }
}

async fn run_cycle(inner: Weak<Inner>, first: RefreshToken, backoff: ErrorBackoffConfig) {
    let mut backoff = ErrorBackoffHandler::new(backoff);
    let mut next = Some(first);

    loop {
        let Some(this) = inner.upgrade() else {
            return;
        };

        let token = next.take().or_else(|| this.store.refresh_token());
        let delay = match this.refresh_with(token).await.with_backoff(&mut backoff) {
            Ok((RefreshOutcome::Refreshed, Some(delay))) => delay,
            Ok((RefreshOutcome::NoRefreshToken, _)) => {
                tracing::info!("refresh token cleared, ending refresh cycle");
                return;
            }
            Ok((_, _)) => {
                let delay = this.backoff_delay();
                tracing::debug!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "refresh skipped, will try again"
                );
                delay
            }
            Err((error, delay)) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "error refreshing tokens, will retry"
                );
                delay
            }
        };

        drop(this);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::AtomicUsize,
    };

    use warden_clock::{TestClock, UnixTime};

    use super::*;
    use crate::{
        claims::test_support::token_expiring_at, AccessToken, AuthorizationCodeRef, IdToken,
        RefreshTokenRef, RefreshedTokens,
    };

    const NOW_SECS: u64 = 1_700_000_000;

    #[derive(Debug, Default)]
    struct MockAuthority {
        calls: AtomicUsize,
        latency: Duration,
        responses: Mutex<VecDeque<Option<RefreshedTokens>>>,
        seen: Mutex<Vec<String>>,
    }

    impl MockAuthority {
        fn with_responses(responses: impl IntoIterator<Item = Option<RefreshedTokens>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn body_error() -> TokenRequestError {
        TokenRequestError::TokenBodyError(serde_json::from_str::<u8>("x").unwrap_err())
    }

    #[async_trait]
    impl TokenAuthority for MockAuthority {
        async fn refresh(
            &self,
            refresh_token: &RefreshTokenRef,
        ) -> Result<RefreshedTokens, TokenRequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push(refresh_token.as_str().to_owned());
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let next = self.responses.lock().unwrap().pop_front().flatten();
            next.ok_or_else(body_error)
        }

        async fn exchange_code(
            &self,
            _code: &AuthorizationCodeRef,
        ) -> Result<TokenSet, TokenRequestError> {
            Err(body_error())
        }
    }

    fn refreshed(expires_in: Option<u64>) -> RefreshedTokens {
        RefreshedTokens {
            access_token: AccessToken::new(token_expiring_at(NOW_SECS + 3600)),
            refresh_token: None,
            id_token: None,
            expires_in: expires_in.map(Duration::from_secs),
        }
    }

    fn seeded_store() -> TokenStore {
        let store = TokenStore::in_memory();
        store
            .store_tokens(&TokenSet::new(
                AccessToken::new(token_expiring_at(NOW_SECS + 60)),
                RefreshToken::from_static("r0"),
                IdToken::from_static("id0"),
            ))
            .unwrap();
        store
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn keeps_existing_tokens_the_authority_did_not_rotate() {
        let store = seeded_store();
        let authority = Arc::new(MockAuthority::with_responses([Some(refreshed(Some(3600)))]));
        let refresher = TokenRefresher::new(authority.clone(), store.clone());

        let outcome = refresher.refresh_now().await.unwrap();

        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert_eq!(store.refresh_token(), Some(RefreshToken::from_static("r0")));
        assert_eq!(store.id_token(), Some(IdToken::from_static("id0")));
        assert_eq!(
            store.access_token(),
            Some(AccessToken::new(token_expiring_at(NOW_SECS + 3600)))
        );
        assert_eq!(*authority.seen.lock().unwrap(), ["r0"]);
    }

    #[tokio::test]
    async fn stores_rotated_tokens() {
        let store = seeded_store();
        let mut response = refreshed(Some(3600));
        response.refresh_token = Some(RefreshToken::from_static("r1"));
        response.id_token = Some(IdToken::from_static("id1"));
        let authority = Arc::new(MockAuthority::with_responses([Some(response)]));
        let refresher = TokenRefresher::new(authority, store.clone());

        refresher.refresh_now().await.unwrap();

        assert_eq!(store.refresh_token(), Some(RefreshToken::from_static("r1")));
        assert_eq!(store.id_token(), Some(IdToken::from_static("id1")));
    }

    #[tokio::test]
    async fn missing_refresh_token_is_a_no_op() {
        let store = TokenStore::in_memory();
        let authority = Arc::new(MockAuthority::default());
        let refresher = TokenRefresher::new(authority.clone(), store);

        let outcome = refresher.refresh_now().await.unwrap();

        assert_eq!(outcome, RefreshOutcome::NoRefreshToken);
        assert_eq!(authority.calls(), 0);
    }

    #[tokio::test]
    async fn failure_keeps_existing_tokens() {
        let store = seeded_store();
        let before = store.tokens();
        let authority = Arc::new(MockAuthority::with_responses([None]));
        let refresher = TokenRefresher::new(authority, store.clone());

        let err = refresher.refresh_now().await.unwrap_err();

        assert!(matches!(err, RefreshError::Request(_)));
        assert_eq!(store.tokens(), before);
        assert!(!refresher.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_request() {
        let store = seeded_store();
        let authority = Arc::new(MockAuthority {
            latency: Duration::from_secs(1),
            ..MockAuthority::with_responses([Some(refreshed(Some(3600)))])
        });
        let refresher = TokenRefresher::new(authority.clone(), store);

        let (first, second) = tokio::join!(refresher.refresh_now(), refresher.refresh_now());

        assert_eq!(first.unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(second.unwrap(), RefreshOutcome::AlreadyInFlight);
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_makes_one_call() {
        let store = seeded_store();
        let authority = Arc::new(MockAuthority::with_responses([Some(refreshed(Some(3600)))]));
        let refresher = TokenRefresher::new(authority.clone(), store);

        refresher
            .start_refresh_cycle(RefreshToken::from_static("r0"))
            .unwrap();
        refresher
            .start_refresh_cycle(RefreshToken::from_static("r0"))
            .unwrap();
        settle().await;

        assert_eq!(authority.calls(), 1);
        assert!(refresher.is_cycle_running());
    }

    #[tokio::test]
    async fn restricted_route_refuses_to_start() {
        let store = seeded_store();
        let authority = Arc::new(MockAuthority::default());
        let refresher = TokenRefresher::builder(authority.clone(), store)
            .restricted_when(|| true)
            .build();

        let err = refresher
            .start_refresh_cycle(RefreshToken::from_static("r0"))
            .unwrap_err();

        assert!(matches!(err, RefreshError::RestrictedPath));
        assert!(!refresher.is_cycle_running());
        assert_eq!(authority.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_runs_again_at_ninety_percent_of_lifetime() {
        let store = seeded_store();
        let authority = Arc::new(MockAuthority::with_responses([
            Some(refreshed(Some(100))),
            Some(refreshed(Some(100))),
        ]));
        let refresher = TokenRefresher::new(authority.clone(), store);

        refresher
            .start_refresh_cycle(RefreshToken::from_static("r0"))
            .unwrap();
        settle().await;
        assert_eq!(authority.calls(), 1);

        tokio::time::advance(Duration::from_secs(89)).await;
        settle().await;
        assert_eq!(authority.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(authority.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_retries_after_a_minute() {
        let store = seeded_store();
        let before = store.tokens();
        let authority = Arc::new(MockAuthority::with_responses([
            None,
            Some(refreshed(Some(3600))),
        ]));
        let refresher = TokenRefresher::new(authority.clone(), store.clone());

        refresher
            .start_refresh_cycle(RefreshToken::from_static("r0"))
            .unwrap();
        settle().await;
        assert_eq!(authority.calls(), 1);
        assert_eq!(store.tokens(), before);

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(authority.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(authority.calls(), 2);
        assert_ne!(store.access_token(), before.access_token);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_cycle() {
        let store = seeded_store();
        let authority = Arc::new(MockAuthority::with_responses([
            Some(refreshed(Some(100))),
            Some(refreshed(Some(100))),
        ]));
        let refresher = TokenRefresher::new(authority.clone(), store);

        refresher
            .start_refresh_cycle(RefreshToken::from_static("r0"))
            .unwrap();
        settle().await;
        refresher.stop_refresh_cycle();
        assert!(!refresher.is_cycle_running());

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_refresher_cancels_the_cycle() {
        let store = seeded_store();
        let authority = Arc::new(MockAuthority::with_responses([
            Some(refreshed(Some(100))),
            Some(refreshed(Some(100))),
        ]));
        let refresher = TokenRefresher::new(authority.clone(), store);

        refresher
            .start_refresh_cycle(RefreshToken::from_static("r0"))
            .unwrap();
        settle().await;
        drop(refresher);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn expiry_check_only_refreshes_inside_threshold() {
        let clock = TestClock::new(UnixTime::from_secs(NOW_SECS));
        let store = TokenStore::in_memory();
        store
            .store_tokens(&TokenSet::new(
                AccessToken::new(token_expiring_at(NOW_SECS + 3600)),
                RefreshToken::from_static("r0"),
                IdToken::from_static("id0"),
            ))
            .unwrap();
        let authority = Arc::new(MockAuthority::with_responses([Some(refreshed(Some(3600)))]));
        let refresher = TokenRefresher::builder(authority.clone(), store)
            .clock(clock.clone())
            .build();

        refresher.on_expiry_check().await;
        assert_eq!(authority.calls(), 0);

        clock.advance(Duration::from_secs(3600 - 299));
        refresher.on_expiry_check().await;
        assert_eq!(authority.calls(), 1);
    }

    #[test]
    fn lifetime_falls_back_to_access_token_expiry() {
        let clock = TestClock::new(UnixTime::from_secs(NOW_SECS));
        let refresher = TokenRefresher::builder(Arc::new(MockAuthority::default()), TokenStore::in_memory())
            .clock(clock)
            .build();

        let access = AccessToken::new(token_expiring_at(NOW_SECS + 1000));
        assert_eq!(
            refresher.inner.next_cycle_delay(None, &access),
            Duration::from_secs(900)
        );
        assert_eq!(
            refresher
                .inner
                .next_cycle_delay(None, &AccessToken::from_static("opaque")),
            Duration::from_secs(60)
        );
        assert_eq!(
            refresher
                .inner
                .next_cycle_delay(Some(Duration::from_secs(1)), &access),
            MIN_CHECK_INTERVAL
        );
    }

    #[test]
    fn huge_lifetime_does_not_overflow() {
        let refresher = TokenRefresher::new(Arc::new(MockAuthority::default()), TokenStore::in_memory());
        let access = AccessToken::from_static("opaque");

        assert_eq!(
            refresher
                .inner
                .next_cycle_delay(Some(Duration::from_secs(u64::MAX / 2)), &access),
            Duration::from_secs(u64::MAX / 10)
        );
        assert_eq!(
            refresher
                .inner
                .next_cycle_delay(Some(Duration::from_secs(u64::MAX)), &access),
            Duration::from_secs(u64::MAX / 10)
        );
    }
}
