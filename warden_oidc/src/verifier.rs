use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use aliri::{
    jwa,
    jwt::{self, CoreHeaders, HasAlgorithm},
    Jwks, JwtRef,
};
use arc_swap::ArcSwapOption;
use reqwest::{
    header::{self, HeaderValue},
    Client, StatusCode, Url,
};
use warden_clock::{Clock, System, UnixTime};
use warden_tokens::{endpoint, AppIdRef, IdTokenRef};

use crate::{IdentityClaims, TokenVerificationError};

/// Minimum time between two key set fetches triggered by unknown key IDs
pub const DEFAULT_REFETCH_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct VolatileData {
    jwks: Jwks,
    etag: Option<HeaderValue>,
    last_modified: Option<HeaderValue>,
}

struct Inner {
    jwks_url: Url,
    client: Client,
    validator: jwt::CoreValidator,
    data: ArcSwapOption<VolatileData>,
    fetch_lock: tokio::sync::Mutex<()>,
    last_fetch_ms: AtomicU64,
    refetch_cooldown: Duration,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySetVerifier")
            .field("jwks_url", &self.jwks_url.as_str())
            .field("validator", &self.validator)
            .field("data", &self.data.load())
            .field("refetch_cooldown", &self.refetch_cooldown)
            .finish_non_exhaustive()
    }
}

/// Verifies identity tokens against a remote JSON Web Key Set
///
/// The key set is fetched on first use and held in memory. Later fetches are
/// conditional on the `ETag` or `Last-Modified` of the held copy. A token
/// naming a key ID that is not in the held set causes one refetch, at most once
/// per cooldown period, to pick up rotated keys.
///
/// Verification checks the signature, the approved algorithms, `iss`, `aud`,
/// and `exp`.
#[derive(Debug, Clone)]
#[must_use]
pub struct KeySetVerifier {
    inner: Arc<Inner>,
}

/// Configures a [`KeySetVerifier`]
#[must_use]
pub struct KeySetVerifierBuilder {
    jwks_url: Url,
    issuer: jwt::Issuer,
    audience: jwt::Audience,
    client: Option<Client>,
    algorithms: Vec<jwa::Algorithm>,
    leeway: Duration,
    refetch_cooldown: Duration,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for KeySetVerifierBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySetVerifierBuilder")
            .field("jwks_url", &self.jwks_url.as_str())
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("algorithms", &self.algorithms)
            .field("leeway", &self.leeway)
            .finish_non_exhaustive()
    }
}

fn default_algorithms() -> Vec<jwa::Algorithm> {
    #[allow(unused_mut)]
    let mut algorithms = Vec::new();
    #[cfg(feature = "rsa")]
    algorithms.extend([
        jwa::Algorithm::RS256,
        jwa::Algorithm::RS384,
        jwa::Algorithm::RS512,
    ]);
    algorithms
}

impl KeySetVerifierBuilder {
    /// Uses `client` for key set requests
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Replaces the set of approved signing algorithms
    ///
    /// Defaults to RS256, RS384 and RS512.
    pub fn approved_algorithms<I: IntoIterator<Item = jwa::Algorithm>>(mut self, algs: I) -> Self {
        self.algorithms = algs.into_iter().collect();
        self
    }

    /// Tolerates clock skew of up to `leeway` when checking `exp`
    pub fn leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Sets the minimum time between refetches caused by unknown key IDs
    pub fn refetch_cooldown(mut self, cooldown: Duration) -> Self {
        self.refetch_cooldown = cooldown;
        self
    }

    /// Reads wall-clock time for the refetch cooldown from `clock`
    pub fn clock<C: Clock + Send + Sync + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Builds the verifier
    ///
    /// No request is made until the first token is verified.
    pub fn build(self) -> Result<KeySetVerifier, reqwest::Error> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .user_agent(concat!("warden_oidc/", env!("CARGO_PKG_VERSION")))
                .build()?,
        };

        let validator = jwt::CoreValidator::default()
            .extend_approved_algorithms(self.algorithms)
            .require_issuer(self.issuer)
            .add_allowed_audience(self.audience)
            .with_leeway(self.leeway);

        Ok(KeySetVerifier {
            inner: Arc::new(Inner {
                jwks_url: self.jwks_url,
                client,
                validator,
                data: ArcSwapOption::empty(),
                fetch_lock: tokio::sync::Mutex::new(()),
                last_fetch_ms: AtomicU64::new(0),
                refetch_cooldown: self.refetch_cooldown,
                clock: self.clock,
            }),
        })
    }
}

impl KeySetVerifier {
    /// Starts configuring a verifier
    ///
    /// Tokens must be issued by `issuer` for `audience`.
    pub fn builder(jwks_url: Url, issuer: jwt::Issuer, audience: jwt::Audience) -> KeySetVerifierBuilder {
        KeySetVerifierBuilder {
            jwks_url,
            issuer,
            audience,
            client: None,
            algorithms: default_algorithms(),
            leeway: Duration::ZERO,
            refetch_cooldown: DEFAULT_REFETCH_COOLDOWN,
            clock: Arc::new(System),
        }
    }

    /// Starts configuring a verifier for tokens issued by an auth service
    ///
    /// The key set is expected at `{auth_base_url}/.well-known/jwks.json`, the
    /// issuer is the base URL itself, and the audience is the application ID.
    pub fn builder_for_authority(auth_base_url: &Url, app_id: &AppIdRef) -> KeySetVerifierBuilder {
        let jwks_url = endpoint(auth_base_url, &[".well-known", "jwks.json"]);
        let issuer = jwt::Issuer::new(auth_base_url.as_str().trim_end_matches('/').to_owned());
        let audience = jwt::Audience::new(app_id.as_str().to_owned());

        Self::builder(jwks_url, issuer, audience)
    }

    /// The key set location
    pub fn jwks_url(&self) -> &Url {
        &self.inner.jwks_url
    }

    /// Whether a key set is currently held
    pub fn has_key_set(&self) -> bool {
        self.inner.data.load().is_some()
    }

    /// Replaces the held key set without contacting the remote
    pub fn set_jwks(&self, jwks: Jwks) {
        self.inner.data.store(Some(Arc::new(VolatileData {
            jwks,
            etag: None,
            last_modified: None,
        })));
    }

    /// Verifies `token` and returns its claims
    ///
    /// # Errors
    ///
    /// * [`TokenVerificationError::TokenExpired`] if `exp` has passed
    /// * [`TokenVerificationError::InvalidToken`] if the token is malformed, its
    ///   signature does not match, or its algorithm, issuer or audience is not
    ///   acceptable
    /// * [`TokenVerificationError::Jwks`] if the key set cannot be obtained or
    ///   holds no key matching the token
    #[tracing::instrument(skip(self, token), fields(jwks.url = %self.inner.jwks_url))]
    pub async fn verify(&self, token: &IdTokenRef) -> Result<IdentityClaims, TokenVerificationError> {
        let jwt = JwtRef::from_str(token.as_str());
        let decomposed: jwt::Decomposed = jwt.decompose()?;
        let alg = decomposed.alg();
        let kid = decomposed.kid().map(ToOwned::to_owned);

        let mut data = self.key_set().await?;

        if data.jwks.get_key_by_opt(kid.as_deref(), alg).is_none() {
            if let Some(kid) = &kid {
                tracing::debug!(%kid, %alg, "unable to find matching key");
            } else {
                tracing::debug!(%alg, "unable to find matching key");
            }

            if self.refetch_allowed() {
                self.refresh().await?;
                data = self.key_set().await?;
            }
        }

        let key = data.jwks.get_key_by_opt(kid.as_deref(), alg).ok_or_else(|| {
            TokenVerificationError::jwks(match &kid {
                Some(kid) => format!("no key found matching kid {} and alg {}", kid, alg),
                None => format!("no key found matching alg {}", alg),
            })
        })?;

        let validated: jwt::Validated<IdentityClaims> =
            decomposed.verify(key, &self.inner.validator)?;
        let (_, claims) = validated.extract();

        Ok(claims)
    }

    fn refetch_allowed(&self) -> bool {
        let last = UnixTime(self.inner.last_fetch_ms.load(Ordering::Acquire));
        let elapsed = self.inner.clock.now().saturating_duration_since(last);
        if elapsed < self.inner.refetch_cooldown {
            tracing::debug!(
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "key set refetched recently, not refetching"
            );
            false
        } else {
            true
        }
    }

    async fn key_set(&self) -> Result<Arc<VolatileData>, TokenVerificationError> {
        if let Some(data) = self.inner.data.load_full() {
            return Ok(data);
        }

        self.refresh().await?;

        self.inner
            .data
            .load_full()
            .ok_or_else(|| TokenVerificationError::jwks("key set unavailable"))
    }

    /// Fetches the key set from the remote URL
    ///
    /// The request is conditional when a key set with an `ETag` or
    /// `Last-Modified` is already held. On failure the held key set is kept.
    #[tracing::instrument(skip(self), fields(jwks.url = %self.inner.jwks_url))]
    pub async fn refresh(&self) -> Result<(), TokenVerificationError> {
        let _guard = self.inner.fetch_lock.lock().await;

        tracing::debug!("refreshing JWKS");
        let mut request = self.inner.client.get(self.inner.jwks_url.clone());

        if let Some(data) = &*self.inner.data.load() {
            if let Some(etag) = &data.etag {
                request = request.header(header::IF_NONE_MATCH, etag)
            } else if let Some(last_modified) = &data.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified)
            }
        }

        let response = request.send().await.map_err(|err| {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(error, "JWKS refresh failed; unable to send request");
            TokenVerificationError::jwks(err.to_string())
        })?;

        self.inner
            .last_fetch_ms
            .store(self.inner.clock.now().as_millis(), Ordering::Release);

        if response.status() == StatusCode::NOT_MODIFIED && self.has_key_set() {
            tracing::debug!("JWKS not modified");
            return Ok(());
        } else if let Err(err) = response.error_for_status_ref() {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(
                error,
                http.status_code = response.status().as_u16(),
                "JWKS refresh failed; unexpected response status",
            );
            return Err(TokenVerificationError::jwks(err.to_string()));
        }

        let etag = response.headers().get(header::ETAG).map(ToOwned::to_owned);
        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .map(ToOwned::to_owned);

        match response.json::<Jwks>().await {
            Ok(jwks) => {
                let keys = jwks.keys().len();
                self.inner.data.store(Some(Arc::new(VolatileData {
                    jwks,
                    etag,
                    last_modified,
                })));
                tracing::info!(keys, "JWKS refreshed");
                Ok(())
            }
            Err(err) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(error, "JWKS refresh failed; unexpected error");
                Err(TokenVerificationError::jwks(err.to_string()))
            }
        }
    }
}
