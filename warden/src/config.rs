//! Runtime configuration
//!
//! A [`Config`] is usually deserialized from the host application's settings
//! (camelCase keys, every field but `appId` optional) or assembled with
//! [`Config::builder`]. It is validated once, when a session starts, by
//! [`Config::validate`], which also resolves the configured URLs.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use warden_flags::FlagContext;

/// The default authentication service
pub const DEFAULT_AUTH_BASE_URL: &str = "https://auth.nblocks.cloud";
/// The default feature flag service
pub const DEFAULT_FLAGS_BASE_URL: &str = "https://backendless.nblocks.cloud";
/// The default team management portal
pub const DEFAULT_TEAM_MANAGEMENT_URL: &str =
    "https://backendless.nblocks.cloud/user-management-portal/users";

const LOGGED_CRATES: &[&str] = &["warden", "warden_tokens", "warden_oidc", "warden_flags"];

/// The deployment stage of the host application
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    #[allow(missing_docs)]
    Dev,
    #[allow(missing_docs)]
    Stage,
    #[allow(missing_docs)]
    #[default]
    Prod,
}

/// How the access token is kept fresh
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenewalStrategy {
    /// Wake up shortly before the access token expires and refresh then
    #[default]
    ExpiryScheduled,
    /// Refresh on a fixed cycle derived from each token's lifetime
    RefreshCycle,
}

/// Settings for a [`Session`](crate::Session)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// The application's ID with the authentication service; required
    pub app_id: String,
    /// Base URL of the authentication service
    pub auth_base_url: String,
    /// Base URL of the feature flag service
    pub flags_base_url: String,
    /// Route that starts a login
    pub login_route: String,
    /// Route that starts a logout
    pub logout_route: String,
    /// Route the authentication service returns to with a code
    pub callback_route: String,
    /// Route to land on after a successful login
    pub default_redirect_route: String,
    /// Route that receives handovers from other applications
    pub handover_path: String,
    /// Absolute callback URL passed to the authentication service as `redirect_uri`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Team management portal; the hosted portal if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_management_url: Option<String>,
    /// Flag context used before the host sets one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_flags_context: Option<FlagContext>,
    /// Enables verbose logging
    pub debug: bool,
    #[allow(missing_docs)]
    pub stage: Stage,
    /// Computes redirect URLs without navigating to them
    pub disable_redirects: bool,
    #[allow(missing_docs)]
    pub renewal: RenewalStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            auth_base_url: DEFAULT_AUTH_BASE_URL.to_owned(),
            flags_base_url: DEFAULT_FLAGS_BASE_URL.to_owned(),
            login_route: "/login".to_owned(),
            logout_route: "/logout".to_owned(),
            callback_route: "/auth/callback".to_owned(),
            default_redirect_route: "/".to_owned(),
            handover_path: "/".to_owned(),
            callback_url: None,
            team_management_url: None,
            initial_flags_context: None,
            debug: false,
            stage: Stage::default(),
            disable_redirects: false,
            renewal: RenewalStrategy::default(),
        }
    }
}

/// A configuration that cannot be used
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `appId` is missing or blank
    #[error("appId is required and must be set")]
    MissingAppId,
    /// A URL setting does not parse
    #[error("{field} is not a valid URL")]
    InvalidUrl {
        /// The offending setting
        field: &'static str,
        /// The parse failure
        source: url::ParseError,
    },
    /// A URL setting parses but cannot have paths appended to it
    #[error("{field} must be an http or https URL")]
    UnsupportedUrl {
        /// The offending setting
        field: &'static str,
    },
}

/// The URLs of a validated [`Config`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    /// See [`Config::auth_base_url`]
    pub auth_base_url: Url,
    /// See [`Config::flags_base_url`]
    pub flags_base_url: Url,
    /// See [`Config::callback_url`]
    pub callback_url: Option<Url>,
    /// See [`Config::team_management_url`]; the hosted portal when unset
    pub team_management_url: Url,
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|source| ConfigError::InvalidUrl { field, source })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ConfigError::UnsupportedUrl { field }),
    }
}

impl Config {
    /// Starts building a configuration for `app_id` with every other setting at its default
    pub fn builder(app_id: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                app_id: app_id.into(),
                ..Config::default()
            },
        }
    }

    /// Checks the configuration and resolves its URLs
    ///
    /// # Errors
    ///
    /// Fails if `appId` is blank or any URL is malformed.
    pub fn validate(&self) -> Result<Endpoints, ConfigError> {
        if self.app_id.trim().is_empty() {
            return Err(ConfigError::MissingAppId);
        }

        Ok(Endpoints {
            auth_base_url: parse_url("authBaseUrl", &self.auth_base_url)?,
            flags_base_url: parse_url("flagsBaseUrl", &self.flags_base_url)?,
            callback_url: self
                .callback_url
                .as_deref()
                .map(|u| parse_url("callbackUrl", u))
                .transpose()?,
            team_management_url: parse_url(
                "teamManagementUrl",
                self.team_management_url
                    .as_deref()
                    .unwrap_or(DEFAULT_TEAM_MANAGEMENT_URL),
            )?,
        })
    }

    /// Whether `route` is one on which token renewal must not start
    ///
    /// These are the login, logout and callback routes and anything beneath
    /// them, where tokens are about to be replaced or discarded.
    pub fn is_restricted_route(&self, route: &str) -> bool {
        let path = route.split(|c| c == '?' || c == '#').next().unwrap_or_default();
        [&self.login_route, &self.logout_route, &self.callback_route]
            .iter()
            .any(|r| {
                let r = r.trim_end_matches('/');
                path.strip_prefix(r)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
    }

    /// A `tracing` filter directive matching the `debug` setting
    ///
    /// Suitable for `tracing_subscriber::EnvFilter::new`.
    pub fn log_filter(&self) -> String {
        let level = if self.debug { "debug" } else { "info" };
        LOGGED_CRATES
            .iter()
            .map(|c| format!("{}={}", c, level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Assembles a [`Config`]
#[derive(Clone, Debug)]
#[must_use]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Sets [`Config::auth_base_url`]
    pub fn auth_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.auth_base_url = url.into();
        self
    }

    /// Sets [`Config::flags_base_url`]
    pub fn flags_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.flags_base_url = url.into();
        self
    }

    /// Sets [`Config::login_route`]
    pub fn login_route(mut self, route: impl Into<String>) -> Self {
        self.config.login_route = route.into();
        self
    }

    /// Sets [`Config::logout_route`]
    pub fn logout_route(mut self, route: impl Into<String>) -> Self {
        self.config.logout_route = route.into();
        self
    }

    /// Sets [`Config::callback_route`]
    pub fn callback_route(mut self, route: impl Into<String>) -> Self {
        self.config.callback_route = route.into();
        self
    }

    /// Sets [`Config::default_redirect_route`]
    pub fn default_redirect_route(mut self, route: impl Into<String>) -> Self {
        self.config.default_redirect_route = route.into();
        self
    }

    /// Sets [`Config::handover_path`]
    pub fn handover_path(mut self, path: impl Into<String>) -> Self {
        self.config.handover_path = path.into();
        self
    }

    /// Sets [`Config::callback_url`]
    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.config.callback_url = Some(url.into());
        self
    }

    /// Sets [`Config::team_management_url`]
    pub fn team_management_url(mut self, url: impl Into<String>) -> Self {
        self.config.team_management_url = Some(url.into());
        self
    }

    /// Sets [`Config::initial_flags_context`]
    pub fn initial_flags_context(mut self, context: FlagContext) -> Self {
        self.config.initial_flags_context = Some(context);
        self
    }

    /// Sets [`Config::debug`]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Sets [`Config::stage`]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.config.stage = stage;
        self
    }

    /// Sets [`Config::disable_redirects`]
    pub fn disable_redirects(mut self, disable: bool) -> Self {
        self.config.disable_redirects = disable;
        self
    }

    /// Sets [`Config::renewal`]
    pub fn renewal(mut self, renewal: RenewalStrategy) -> Self {
        self.config.renewal = renewal;
        self
    }

    /// Validates and returns the configuration
    ///
    /// # Errors
    ///
    /// See [`Config::validate`].
    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use serde_json::json;

    use super::*;

    #[test]
    fn partial_settings_take_defaults() -> Result<()> {
        let config: Config = serde_json::from_value(json!({
            "appId": "app-1",
            "debug": true,
            "stage": "DEV",
            "renewal": "refresh-cycle",
        }))?;

        assert_eq!(config.app_id, "app-1");
        assert_eq!(config.auth_base_url, DEFAULT_AUTH_BASE_URL);
        assert_eq!(config.login_route, "/login");
        assert_eq!(config.logout_route, "/logout");
        assert_eq!(config.callback_route, "/auth/callback");
        assert_eq!(config.default_redirect_route, "/");
        assert_eq!(config.handover_path, "/");
        assert_eq!(config.stage, Stage::Dev);
        assert_eq!(config.renewal, RenewalStrategy::RefreshCycle);
        assert!(config.debug);
        assert!(!config.disable_redirects);

        Ok(())
    }

    #[test]
    fn blank_app_id_is_rejected() {
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::MissingAppId)
        ));
        assert!(matches!(
            Config::builder("  ").build(),
            Err(ConfigError::MissingAppId)
        ));
    }

    #[test]
    fn malformed_urls_are_rejected() {
        let err = Config::builder("app-1")
            .auth_base_url("not a url")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { field: "authBaseUrl", .. }));

        let err = Config::builder("app-1")
            .callback_url("mailto:someone@example.com")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedUrl { field: "callbackUrl" }));
    }

    #[test]
    fn endpoints_fall_back_to_hosted_portal() -> Result<()> {
        let endpoints = Config::builder("app-1").build()?.validate()?;

        assert_eq!(endpoints.auth_base_url.as_str(), "https://auth.nblocks.cloud/");
        assert_eq!(endpoints.team_management_url.as_str(), DEFAULT_TEAM_MANAGEMENT_URL);
        assert_eq!(endpoints.callback_url, None);

        Ok(())
    }

    #[test]
    fn renewal_is_restricted_on_auth_routes() {
        let config = Config::default();
        assert!(config.is_restricted_route("/login"));
        assert!(config.is_restricted_route("/auth/callback?code=abc"));
        assert!(config.is_restricted_route("/logout#bye"));
        assert!(!config.is_restricted_route("/"));
        assert!(!config.is_restricted_route("/loginhelp"));
        assert!(!config.is_restricted_route("/dashboard/login"));
    }

    #[test]
    fn renewal_is_restricted_beneath_auth_routes() {
        let config = Config::default();
        assert!(config.is_restricted_route("/login/sso"));
        assert!(config.is_restricted_route("/login/"));
        assert!(config.is_restricted_route("/auth/callback/"));
        assert!(config.is_restricted_route("/logout/confirm?next=/"));

        let config = Config {
            login_route: "/signin/".to_owned(),
            ..Config::default()
        };
        assert!(config.is_restricted_route("/signin"));
        assert!(config.is_restricted_route("/signin/sso"));
        assert!(!config.is_restricted_route("/signing"));
    }

    #[test]
    fn log_filter_follows_debug_flag() {
        let quiet = Config::default().log_filter();
        assert!(quiet.contains("warden_tokens=info"));

        let verbose = Config {
            debug: true,
            ..Config::default()
        }
        .log_filter();
        assert!(verbose.contains("warden=debug"));
        assert!(verbose.contains("warden_flags=debug"));
    }
}
