use std::{fmt, sync::Arc};

use thiserror::Error;
use tokio::sync::watch;
use warden_flags::{FlagEvaluator, HttpFlagClient};
use warden_oidc::{KeySetVerifier, ProfileWatcher};
use warden_tokens::{
    AppId, ExpiryScheduler, HttpTokenAuthority, PersistentStore, RestrictedCheck, SchedulerState,
    TaskHandle, TokenAuthority, TokenRefresher, TokenStore,
};

use crate::{
    AuthClient, CallbackError, Config, ConfigError, Endpoints, LoginRedirector, LogoutRedirector,
    Navigator, RenewalStrategy, TeamManagement,
};

/// An error starting a session
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configuration is unusable
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    /// The HTTP client could not be constructed
    #[error("unable to construct HTTP client")]
    HttpClient(#[from] reqwest::Error),
}

/// Every component of the runtime, wired together
///
/// Starting a session spawns the background tasks that keep the profile,
/// the feature flags and the access token current. Dropping the session, or
/// calling [`shutdown`](Session::shutdown), stops all of them.
///
/// Must be started from within a tokio runtime.
pub struct Session {
    config: Config,
    endpoints: Endpoints,
    tokens: TokenStore,
    refresher: TokenRefresher,
    verifier: KeySetVerifier,
    profile: ProfileWatcher,
    flags: FlagEvaluator,
    auth: AuthClient,
    login: LoginRedirector,
    logout: LogoutRedirector,
    team: TeamManagement,
    authenticated: watch::Receiver<bool>,
    scheduler: Option<ExpiryScheduler>,
    tasks: Vec<TaskHandle>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("app_id", &self.config.app_id)
            .field("stage", &self.config.stage)
            .field("renewal", &self.config.renewal)
            .field("tokens", &self.tokens)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Validates `config`, constructs every component, and starts the background tasks
    ///
    /// Tokens are loaded from `storage`. `restricted` reports whether the host
    /// is on a route where renewal must not start; see
    /// [`Config::is_restricted_route`].
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    #[tracing::instrument(skip_all, fields(app_id = %config.app_id, stage = ?config.stage))]
    pub fn start<S>(
        config: Config,
        storage: S,
        navigator: Arc<dyn Navigator>,
        restricted: Option<RestrictedCheck>,
    ) -> Result<Self, SessionError>
    where
        S: PersistentStore + 'static,
    {
        let endpoints = config.validate()?;
        let app_id = AppId::new(config.app_id.clone());

        let client = reqwest::Client::builder()
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let tokens = TokenStore::new(storage);
        if let Err(err) = tokens.clear_expired_tokens() {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(error, "unable to clear expired tokens");
        }

        let authority: Arc<dyn TokenAuthority> = Arc::new(HttpTokenAuthority::new(
            client.clone(),
            &endpoints.auth_base_url,
            app_id.clone(),
        ));

        let mut refresher = TokenRefresher::builder(Arc::clone(&authority), tokens.clone());
        if let Some(check) = restricted {
            refresher = refresher.restricted_when(move || check());
        }
        let refresher = refresher.build();

        let verifier = KeySetVerifier::builder_for_authority(&endpoints.auth_base_url, &app_id)
            .client(client.clone())
            .build()?;
        let profile = ProfileWatcher::spawn(verifier.clone(), tokens.subscribe_id_token());

        let flag_client = HttpFlagClient::new(client.clone(), &endpoints.flags_base_url, app_id.clone());
        let mut flags = FlagEvaluator::builder(Arc::new(flag_client), tokens.clone());
        if let Some(context) = config.initial_flags_context.clone() {
            flags = flags.context(context);
        }
        let flags = flags.build();

        let auth = AuthClient::new(
            authority,
            tokens.clone(),
            config.login_route.clone(),
            config.default_redirect_route.clone(),
        );
        let (authenticated, auth_task) = auth.watch_authenticated();

        let login = LoginRedirector::new(
            tokens.clone(),
            endpoints.auth_base_url.clone(),
            app_id.clone(),
            endpoints.callback_url.clone(),
            Arc::clone(&navigator),
        )
        .disable_redirects(config.disable_redirects);
        let logout = LogoutRedirector::new(
            tokens.clone(),
            endpoints.auth_base_url.clone(),
            app_id.clone(),
            endpoints.callback_url.clone(),
            navigator,
        )
        .disable_redirects(config.disable_redirects);

        let team = TeamManagement::new(
            client,
            tokens.clone(),
            &endpoints.auth_base_url,
            &app_id,
            endpoints.team_management_url.clone(),
        );

        let mut tasks = vec![auth_task, flags.watch_access_token()];
        let scheduler = match config.renewal {
            RenewalStrategy::ExpiryScheduled => {
                if !tokens.is_authenticated() && tokens.refresh_token().is_some() {
                    let refresher = refresher.clone();
                    tasks.push(TaskHandle::spawn("initial refresh", async move {
                        if let Err(err) = refresher.refresh_now().await {
                            let error: &dyn std::error::Error = &err;
                            tracing::warn!(error, "initial token refresh failed");
                        }
                    }));
                }
                Some(ExpiryScheduler::spawn(
                    tokens.subscribe_access_token(),
                    refresher.clone(),
                ))
            }
            RenewalStrategy::RefreshCycle => {
                start_cycle(&refresher, &tokens);
                None
            }
        };

        tracing::info!(renewal = ?config.renewal, "session started");

        Ok(Self {
            config,
            endpoints,
            tokens,
            refresher,
            verifier,
            profile,
            flags,
            auth,
            login,
            logout,
            team,
            authenticated,
            scheduler,
            tasks,
        })
    }

    /// The validated configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The resolved service URLs
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// The token store
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// The token refresher
    pub fn refresher(&self) -> &TokenRefresher {
        &self.refresher
    }

    /// The identity token verifier
    pub fn verifier(&self) -> &KeySetVerifier {
        &self.verifier
    }

    /// The verified profile of the signed-in user
    pub fn profile(&self) -> &ProfileWatcher {
        &self.profile
    }

    /// The feature flag evaluator
    pub fn flags(&self) -> &FlagEvaluator {
        &self.flags
    }

    /// The login callback handler
    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// The login redirector
    pub fn login(&self) -> &LoginRedirector {
        &self.login
    }

    /// The logout redirector
    pub fn logout(&self) -> &LogoutRedirector {
        &self.logout
    }

    /// The team management handover client
    pub fn team(&self) -> &TeamManagement {
        &self.team
    }

    /// Whether an unexpired access token is held, updated as the token changes
    pub fn authenticated(&self) -> watch::Receiver<bool> {
        self.authenticated.clone()
    }

    /// The expiry scheduler's state, when renewal is expiry-scheduled
    pub fn scheduler_state(&self) -> Option<SchedulerState> {
        self.scheduler.as_ref().map(ExpiryScheduler::state)
    }

    /// Exchanges a callback's authorization code and stores the tokens
    ///
    /// With [`RenewalStrategy::RefreshCycle`], the refresh cycle is started
    /// once the tokens are stored.
    ///
    /// # Errors
    ///
    /// See [`AuthClient::handle_callback`].
    pub async fn handle_callback(&self, code: &str) -> Result<(), CallbackError> {
        self.auth.handle_callback(code).await?;
        self.after_login();
        Ok(())
    }

    /// Completes a login and returns the route to continue to
    ///
    /// See [`AuthClient::complete_callback`].
    pub async fn complete_callback(&self, code: Option<&str>) -> &str {
        let route = self.auth.complete_callback(code).await;
        if self.tokens.access_token().is_some() {
            self.after_login();
        }
        route
    }

    fn after_login(&self) {
        if self.config.renewal == RenewalStrategy::RefreshCycle {
            start_cycle(&self.refresher, &self.tokens);
        }
    }

    /// Stops every background task
    pub fn shutdown(self) {
        tracing::info!("session shutting down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.refresher.stop_refresh_cycle();
        self.tasks.clear();
        self.scheduler = None;
    }
}

fn start_cycle(refresher: &TokenRefresher, tokens: &TokenStore) {
    let Some(refresh_token) = tokens.refresh_token() else {
        tracing::info!("no refresh token, not starting refresh cycle");
        return;
    };

    if let Err(err) = refresher.start_refresh_cycle(refresh_token) {
        let error: &dyn std::error::Error = &err;
        tracing::warn!(error, "refresh cycle not started");
    }
}
