//! Client-side authentication runtime
//!
//! `warden` keeps a signed-in user's credentials, identity and entitlements
//! current on the client:
//!
//! * tokens are stored, persisted and renewed before they expire
//!   ([`warden_tokens`]);
//! * the identity token is verified against the auth service's key set and
//!   exposed as a [`Profile`] ([`warden_oidc`]);
//! * feature flags are evaluated and cached ([`warden_flags`]).
//!
//! A [`Session`] wires all of these together from a [`Config`] and owns every
//! background task it starts.
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden::{Config, LogOnlyNavigator, Session};
//! use warden_tokens::InMemoryStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::builder("my-app")
//!     .callback_url("https://app.example.com/auth/callback")
//!     .build()?;
//!
//! let session = Session::start(config, InMemoryStore::new(), Arc::new(LogOnlyNavigator), None)?;
//!
//! let next = session.complete_callback(Some("code-from-query")).await;
//! println!("continue to {next}");
//!
//! if session.flags().is_feature_enabled("new-dashboard", false).await {
//!     println!("new dashboard enabled");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `file` (default): persist tokens to a JSON file.
//! * `rsa` (default), `hmac`, `ec`: identity token signature algorithms.
//! * `rustls-tls` / `default-tls`: select the TLS backend used by `reqwest`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod auth;
pub mod config;
mod redirect;
mod session;
mod team;

pub use auth::{AuthClient, CallbackError};
pub use config::{Config, ConfigBuilder, ConfigError, Endpoints, RenewalStrategy, Stage};
pub use redirect::{
    redirect_url, LogOnlyNavigator, LoginRedirector, LogoutRedirector, Navigator, RedirectError,
    RedirectErrorCallback, RedirectKind,
};
pub use session::{Session, SessionError};
pub use team::{HandoverError, TeamManagement};

pub use warden_flags::{FlagContext, FlagEvaluator};
pub use warden_oidc::{Profile, ProfileWatcher, TenantInfo, TokenVerificationError};
pub use warden_tokens::{PersistentStore, TokenStore};
