//! Completing a login

use std::{fmt, sync::Arc};

use thiserror::Error;
use tokio::sync::watch;
use warden_clock::{Clock, System};
use warden_tokens::{
    claims::decode_expiry, AccessToken, AuthorizationCodeRef, TaskHandle, TokenAuthority,
    TokenRequestError, TokenStore, TokenStoreError,
};

/// An error completing a login
#[derive(Debug, Error)]
pub enum CallbackError {
    /// The callback carried no authorization code
    #[error("no authorization code provided")]
    MissingCode,
    /// The authorization code could not be exchanged
    #[error("unable to exchange authorization code")]
    Exchange(#[from] TokenRequestError),
    /// The exchanged tokens could not be stored
    #[error("unable to store exchanged tokens")]
    Store(#[from] TokenStoreError),
}

/// Exchanges authorization codes for tokens and reports sign-in state
#[derive(Clone)]
pub struct AuthClient {
    authority: Arc<dyn TokenAuthority>,
    tokens: TokenStore,
    login_route: String,
    default_redirect_route: String,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthClient")
            .field("authority", &self.authority)
            .field("tokens", &self.tokens)
            .field("login_route", &self.login_route)
            .field("default_redirect_route", &self.default_redirect_route)
            .finish_non_exhaustive()
    }
}

impl AuthClient {
    /// Constructs a client that stores exchanged tokens in `tokens`
    ///
    /// After a callback completes, the user is sent to `default_redirect_route`,
    /// or back to `login_route` if it failed.
    pub fn new(
        authority: Arc<dyn TokenAuthority>,
        tokens: TokenStore,
        login_route: impl Into<String>,
        default_redirect_route: impl Into<String>,
    ) -> Self {
        Self {
            authority,
            tokens,
            login_route: login_route.into(),
            default_redirect_route: default_redirect_route.into(),
            clock: Arc::new(System),
        }
    }

    /// Judges access token expiry against `clock`
    #[must_use]
    pub fn with_clock<C: Clock + Send + Sync + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Exchanges `code` for a token set and stores it
    ///
    /// # Errors
    ///
    /// Fails if `code` is empty, the exchange is rejected, or the tokens cannot
    /// be persisted.
    #[tracing::instrument(skip_all)]
    pub async fn handle_callback(&self, code: &str) -> Result<(), CallbackError> {
        if code.is_empty() {
            return Err(CallbackError::MissingCode);
        }

        let tokens = self
            .authority
            .exchange_code(AuthorizationCodeRef::from_str(code))
            .await?;
        self.tokens.store_tokens(&tokens)?;

        tracing::info!("login completed");
        Ok(())
    }

    /// Completes a login and returns the route to continue to
    ///
    /// Failures are logged and resolve to the login route.
    pub async fn complete_callback(&self, code: Option<&str>) -> &str {
        match self.handle_callback(code.unwrap_or_default()).await {
            Ok(()) => &self.default_redirect_route,
            Err(err) => {
                let error: &dyn std::error::Error = &err;
                tracing::warn!(error, "login callback failed, returning to login");
                &self.login_route
            }
        }
    }

    /// Whether an unexpired access token is stored
    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated_with_clock(&self.clock)
    }

    /// Spawns a task that republishes [`is_authenticated`] whenever it changes
    ///
    /// The value is recomputed when the access token changes and when the
    /// held token reaches its `exp`.
    ///
    /// [`is_authenticated`]: AuthClient::is_authenticated
    pub fn watch_authenticated(&self) -> (watch::Receiver<bool>, TaskHandle) {
        let (tx, rx) = watch::channel(self.is_authenticated());
        let task = TaskHandle::spawn(
            "authenticated watcher",
            watch_authenticated(self.clone(), self.tokens.subscribe_access_token(), tx),
        );
        (rx, task)
    }
}

async fn watch_authenticated(
    auth: AuthClient,
    mut access: watch::Receiver<Option<AccessToken>>,
    authenticated: watch::Sender<bool>,
) {
    loop {
        let until_expiry = access
            .borrow_and_update()
            .as_ref()
            .and_then(|t| decode_expiry(t.as_str()))
            .and_then(|exp| auth.clock.now().checked_duration_until(exp));

        let now = auth.is_authenticated();
        authenticated.send_if_modified(|current| {
            let changed = *current != now;
            *current = now;
            changed
        });

        match until_expiry {
            Some(delay) => {
                tokio::select! {
                    changed = access.changed() => if changed.is_err() { return },
                    _ = tokio::time::sleep(delay) => {
                        tracing::debug!("access token expired");
                    }
                }
            }
            None => {
                if access.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
