use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::watch;
use warden_clock::{Clock, System, UnixTime};
use warden_tokens::{AccessToken, AccessTokenRef, TaskHandle, TokenStore};

use crate::{FlagClient, FlagContext, FlagMap, FlagRequestError};

/// How long a bulk evaluation is considered fresh
pub const CACHE_VALIDITY: Duration = Duration::from_secs(5 * 60);

/// Callback invoked whenever the flag backend fails
pub type ErrorCallback = Arc<dyn Fn(&FlagRequestError) + Send + Sync>;

#[derive(Debug, Default)]
struct Snapshot {
    flags: Arc<FlagMap>,
    fetched_at: Option<UnixTime>,
}

struct Inner {
    client: Arc<dyn FlagClient>,
    tokens: TokenStore,
    context: ArcSwapOption<FlagContext>,
    cache: ArcSwap<Snapshot>,
    updates: watch::Sender<Arc<FlagMap>>,
    refresh_lock: tokio::sync::Mutex<()>,
    refresh_generation: AtomicU64,
    on_error: Option<ErrorCallback>,
    clock: Arc<dyn Clock + Send + Sync>,
}

/// Evaluates feature flags for the current user and caches the results
///
/// A bulk evaluation is cached for [`CACHE_VALIDITY`]. Reads that find the
/// cache stale trigger one bulk refresh, shared by all concurrent readers,
/// before answering. There is no background timer; refreshes are driven by
/// reads, by context changes, and by [`watch_access_token`].
///
/// Backend failures are logged and reported to the error callback. They never
/// clear the cache.
///
/// [`watch_access_token`]: FlagEvaluator::watch_access_token
#[derive(Clone)]
pub struct FlagEvaluator {
    inner: Arc<Inner>,
}

impl fmt::Debug for FlagEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagEvaluator")
            .field("client", &self.inner.client)
            .field("context", &self.inner.context.load())
            .field("cache", &self.inner.cache.load())
            .finish_non_exhaustive()
    }
}

/// Configures a [`FlagEvaluator`]
#[must_use]
pub struct FlagEvaluatorBuilder {
    client: Arc<dyn FlagClient>,
    tokens: TokenStore,
    context: Option<FlagContext>,
    on_error: Option<ErrorCallback>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for FlagEvaluatorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagEvaluatorBuilder")
            .field("client", &self.client)
            .field("context", &self.context)
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

impl FlagEvaluatorBuilder {
    /// Sets the context used for the first evaluation
    pub fn context(mut self, context: FlagContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Registers a callback for backend failures
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlagRequestError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Uses `clock` to judge cache freshness
    pub fn clock<C: Clock + Send + Sync + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Builds the evaluator with an empty cache
    pub fn build(self) -> FlagEvaluator {
        FlagEvaluator {
            inner: Arc::new(Inner {
                client: self.client,
                tokens: self.tokens,
                context: ArcSwapOption::from(self.context.map(Arc::new)),
                cache: ArcSwap::from_pointee(Snapshot::default()),
                updates: watch::Sender::new(Arc::default()),
                refresh_lock: tokio::sync::Mutex::new(()),
                refresh_generation: AtomicU64::new(0),
                on_error: self.on_error,
                clock: self.clock,
            }),
        }
    }
}

impl FlagEvaluator {
    /// Constructs an evaluator that reads the access token from `tokens`
    pub fn new(client: Arc<dyn FlagClient>, tokens: TokenStore) -> Self {
        Self::builder(client, tokens).build()
    }

    /// Starts configuring an evaluator
    pub fn builder(client: Arc<dyn FlagClient>, tokens: TokenStore) -> FlagEvaluatorBuilder {
        FlagEvaluatorBuilder {
            client,
            tokens,
            context: None,
            on_error: None,
            clock: Arc::new(System),
        }
    }

    /// The current evaluation context
    pub fn context(&self) -> Option<FlagContext> {
        self.inner.context.load_full().map(|c| (*c).clone())
    }

    /// Replaces the evaluation context and re-evaluates every flag
    pub async fn set_context(&self, context: Option<FlagContext>) {
        self.inner.context.store(context.map(Arc::new));
        tracing::debug!("flag context updated");
        self.refresh_feature_flags().await;
    }

    /// Reads a flag from the cache
    ///
    /// Unknown flags, and every flag before the first evaluation, are `false`.
    pub fn flag_enabled(&self, key: &str) -> bool {
        let cache = self.inner.cache.load();
        if cache.fetched_at.is_none() && cache.flags.is_empty() {
            tracing::trace!(flag = key, "flag checked before first evaluation");
            return false;
        }

        let enabled = cache.flags.get(key).copied().unwrap_or(false);
        tracing::trace!(flag = key, enabled, "flag read from cache");
        enabled
    }

    /// Whether a flag is enabled
    ///
    /// A stale cache is refreshed first. When `force_live` is set, the flag is
    /// also evaluated individually and the result merged into the cache; if
    /// that fails, the cached value is returned instead.
    pub async fn is_feature_enabled(&self, key: &str, force_live: bool) -> bool {
        self.refresh_if_stale().await;

        if !force_live {
            return self.flag_enabled(key);
        }

        let Some(token) = self.inner.tokens.access_token() else {
            tracing::info!(flag = key, "no access token, using cached flag value");
            return self.flag_enabled(key);
        };

        match self.inner.client.evaluate(&token, key).await {
            Ok(enabled) => {
                self.merge(key, enabled);
                enabled
            }
            Err(err) => {
                self.report(&err);
                self.flag_enabled(key)
            }
        }
    }

    /// The current flags, refreshing first if the cache is stale
    pub async fn feature_flags(&self) -> Arc<FlagMap> {
        self.refresh_if_stale().await;
        self.snapshot()
    }

    /// The current flags as cached, without refreshing
    pub fn snapshot(&self) -> Arc<FlagMap> {
        Arc::clone(&self.inner.cache.load().flags)
    }

    /// Forces a bulk evaluation with the stored access token
    pub async fn refresh_feature_flags(&self) {
        let _guard = self.inner.refresh_lock.lock().await;
        let token = self.inner.tokens.access_token();
        self.evaluate_locked(token.as_deref()).await;
    }

    /// Runs a bulk evaluation with `access_token`
    ///
    /// Without an access token this does nothing.
    pub async fn evaluate_flags(&self, access_token: Option<&AccessTokenRef>) {
        let _guard = self.inner.refresh_lock.lock().await;
        self.evaluate_locked(access_token).await;
    }

    /// When the cache was last filled by a bulk evaluation
    pub fn last_fetched(&self) -> Option<UnixTime> {
        self.inner.cache.load().fetched_at
    }

    /// Whether the cache is older than [`CACHE_VALIDITY`] or was never filled
    pub fn is_stale(&self) -> bool {
        match self.inner.cache.load().fetched_at {
            Some(at) => self.inner.clock.now().saturating_duration_since(at) >= CACHE_VALIDITY,
            None => true,
        }
    }

    /// Subscribes to cache updates
    pub fn updates(&self) -> watch::Receiver<Arc<FlagMap>> {
        self.inner.updates.subscribe()
    }

    /// Spawns a task that re-evaluates every flag whenever the access token changes
    ///
    /// The token held when this is called is evaluated immediately.
    pub fn watch_access_token(&self) -> TaskHandle {
        let evaluator = self.clone();
        let tokens = self.inner.tokens.subscribe_access_token();
        TaskHandle::spawn("flag watcher", watch_access_token(evaluator, tokens))
    }

    async fn refresh_if_stale(&self) {
        if !self.is_stale() {
            return;
        }

        let generation = self.inner.refresh_generation.load(Ordering::Acquire);
        let _guard = self.inner.refresh_lock.lock().await;

        if self.inner.refresh_generation.load(Ordering::Acquire) != generation {
            tracing::trace!("stale flag cache already refreshed by another reader");
            return;
        }

        if !self.is_stale() {
            return;
        }

        let token = self.inner.tokens.access_token();
        self.evaluate_locked(token.as_deref()).await;
    }

    async fn evaluate_locked(&self, access_token: Option<&AccessTokenRef>) {
        self.bulk_evaluate(access_token).await;
        self.inner.refresh_generation.fetch_add(1, Ordering::AcqRel);
    }

    async fn bulk_evaluate(&self, access_token: Option<&AccessTokenRef>) {
        let Some(access_token) = access_token else {
            tracing::info!("no access token, skipping flag evaluation");
            return;
        };

        let context = self.inner.context.load_full();
        match self
            .inner
            .client
            .bulk_evaluate(access_token, context.as_deref())
            .await
        {
            Ok(flags) => {
                let flags = Arc::new(flags);
                tracing::debug!(count = flags.len(), "flags evaluated");
                self.inner.cache.store(Arc::new(Snapshot {
                    flags: Arc::clone(&flags),
                    fetched_at: Some(self.inner.clock.now()),
                }));
                self.inner.updates.send_replace(flags);
            }
            Err(err) => self.report(&err),
        }
    }

    fn merge(&self, key: &str, enabled: bool) {
        self.inner.cache.rcu(|current| {
            let mut flags = FlagMap::clone(&current.flags);
            flags.insert(key.to_owned(), enabled);
            Snapshot {
                flags: Arc::new(flags),
                fetched_at: current.fetched_at,
            }
        });
        self.inner.updates.send_replace(self.snapshot());
    }

    fn report(&self, err: &FlagRequestError) {
        let error: &dyn std::error::Error = err;
        tracing::warn!(error, "flag evaluation failed");
        if let Some(on_error) = &self.inner.on_error {
            on_error(err);
        }
    }
}

async fn watch_access_token(
    evaluator: FlagEvaluator,
    mut tokens: watch::Receiver<Option<AccessToken>>,
) {
    loop {
        let token = tokens.borrow_and_update().clone();
        evaluator.evaluate_flags(token.as_deref()).await;

        if tokens.changed().await.is_err() {
            break;
        }
    }
}
