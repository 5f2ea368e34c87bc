//! Login and logout redirects

use std::{fmt, sync::Arc};

use thiserror::Error;
use url::Url;
use warden_tokens::{endpoint, AppId, TokenStore};

/// Moves the host application to another location
pub trait Navigator: fmt::Debug + Send + Sync {
    /// Navigates to `url`
    fn navigate(&self, url: &Url);
}

/// A [`Navigator`] that only logs where it would have gone
#[derive(Clone, Copy, Debug, Default)]
pub struct LogOnlyNavigator;

impl Navigator for LogOnlyNavigator {
    fn navigate(&self, url: &Url) {
        tracing::info!(%url, "navigation requested");
    }
}

/// Callback invoked when a redirect URL cannot be built
pub type RedirectErrorCallback = Arc<dyn Fn(&RedirectError) + Send + Sync>;

/// Which redirect is being performed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RedirectKind {
    #[allow(missing_docs)]
    Login,
    #[allow(missing_docs)]
    Logout,
}

impl RedirectKind {
    fn segment(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
        }
    }
}

impl fmt::Display for RedirectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

/// A redirect URL could not be built
#[derive(Debug, Error)]
#[error("unable to build {kind} URL from {base}")]
pub struct RedirectError {
    kind: RedirectKind,
    base: Url,
}

impl RedirectError {
    /// The redirect that failed
    pub fn kind(&self) -> RedirectKind {
        self.kind
    }
}

/// Builds `{base}/url/{login|logout}/{app_id}`, with `redirect_uri` when given
///
/// Returns `None` if `base` cannot carry a path.
pub fn redirect_url(
    kind: RedirectKind,
    base: &Url,
    app_id: &AppId,
    redirect_uri: Option<&Url>,
) -> Option<Url> {
    if base.cannot_be_a_base() {
        return None;
    }

    let mut url = endpoint(base, &["url", kind.segment(), app_id.as_str()]);
    if let Some(redirect_uri) = redirect_uri {
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_uri.as_str());
    }
    Some(url)
}

#[derive(Clone)]
struct Redirector {
    kind: RedirectKind,
    tokens: TokenStore,
    auth_base_url: Url,
    app_id: AppId,
    redirect_uri: Option<Url>,
    navigator: Arc<dyn Navigator>,
    disable_redirects: bool,
    on_error: Option<RedirectErrorCallback>,
}

impl fmt::Debug for Redirector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redirector")
            .field("kind", &self.kind)
            .field("auth_base_url", &self.auth_base_url.as_str())
            .field("app_id", &self.app_id)
            .field("disable_redirects", &self.disable_redirects)
            .finish_non_exhaustive()
    }
}

impl Redirector {
    fn url(&self) -> Option<Url> {
        redirect_url(
            self.kind,
            &self.auth_base_url,
            &self.app_id,
            self.redirect_uri.as_ref(),
        )
    }

    #[tracing::instrument(skip(self), fields(redirect.kind = %self.kind))]
    fn redirect(&self) -> Result<Url, RedirectError> {
        if let Err(err) = self.tokens.destroy_tokens() {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(error, "unable to clear stored tokens before redirect");
        }

        let Some(url) = self.url() else {
            let err = RedirectError {
                kind: self.kind,
                base: self.auth_base_url.clone(),
            };
            tracing::error!(%err, "failed to get redirect URL");
            if let Some(on_error) = &self.on_error {
                on_error(&err);
            }
            return Err(err);
        };

        if self.disable_redirects {
            tracing::info!(%url, "redirects disabled, not navigating");
        } else {
            tracing::debug!(%url, "redirecting");
            self.navigator.navigate(&url);
        }

        Ok(url)
    }
}

macro_rules! redirector {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $method:ident, $url:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        pub struct $name(Redirector);

        impl $name {
            /// Constructs a redirector
            ///
            /// `redirect_uri` is passed to the authentication service so that
            /// it can send the user back afterwards.
            pub fn new(
                tokens: TokenStore,
                auth_base_url: Url,
                app_id: AppId,
                redirect_uri: Option<Url>,
                navigator: Arc<dyn Navigator>,
            ) -> Self {
                Self(Redirector {
                    kind: $kind,
                    tokens,
                    auth_base_url,
                    app_id,
                    redirect_uri,
                    navigator,
                    disable_redirects: false,
                    on_error: None,
                })
            }

            /// Computes and logs the URL without navigating to it
            #[must_use]
            pub fn disable_redirects(mut self, disable: bool) -> Self {
                self.0.disable_redirects = disable;
                self
            }

            /// Registers a callback for URLs that cannot be built
            #[must_use]
            pub fn on_error<F>(mut self, f: F) -> Self
            where
                F: Fn(&RedirectError) + Send + Sync + 'static,
            {
                self.0.on_error = Some(Arc::new(f));
                self
            }

            /// The URL that a redirect would navigate to
            pub fn $url(&self) -> Option<Url> {
                self.0.url()
            }

            /// Clears every stored token and navigates to the URL
            ///
            /// # Errors
            ///
            /// Fails, after invoking the error callback, if the URL cannot be
            /// built. Tokens are cleared regardless.
            pub fn $method(&self) -> Result<Url, RedirectError> {
                self.0.redirect()
            }
        }
    };
}

redirector!(
    /// Signs the user out locally and sends them to the hosted login page
    LoginRedirector,
    RedirectKind::Login,
    redirect_to_login,
    login_url
);

redirector!(
    /// Signs the user out locally and sends them to the hosted logout page
    LogoutRedirector,
    RedirectKind::Logout,
    redirect_to_logout,
    logout_url
);
