//! Client-side credential lifecycle management
//!
//! This crate holds the access, refresh and identity tokens of a signed-in
//! user and keeps them fresh without the rest of the application needing to
//! care when renewal happens.
//!
//! * [`TokenStore`] is the single source of truth. Each token kind is persisted
//!   through a [`PersistentStore`] and published on a `tokio::sync::watch`
//!   channel, so consumers either read the current value synchronously or
//!   subscribe to changes.
//! * [`ExpiryScheduler`] watches the access token and wakes up shortly before it
//!   expires, handing off to an [`ExpiryHandler`].
//! * [`TokenRefresher`] exchanges the refresh token with a [`TokenAuthority`],
//!   either on demand or as a self-rescheduling cycle, and never runs two
//!   exchanges at once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden_tokens::{AppId, ExpiryScheduler, HttpTokenAuthority, TokenRefresher, TokenStore};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = TokenStore::new(warden_tokens::persistence::FileStore::open("credentials.json")?);
//!
//! let authority = HttpTokenAuthority::new(
//!     reqwest::Client::new(),
//!     &reqwest::Url::parse("https://auth.nblocks.cloud")?,
//!     AppId::from_static("my-app"),
//! );
//!
//! let refresher = TokenRefresher::new(Arc::new(authority), store.clone());
//! let _scheduler = ExpiryScheduler::spawn(store.subscribe_access_token(), refresher);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `file` (default): a [`PersistentStore`] backed by a JSON file.
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

mod authority;
pub mod backoff;
mod braids;
pub mod claims;
pub mod persistence;
mod refresher;
mod scheduler;
mod store;
mod task;
mod tokens;

pub use authority::{endpoint, HttpTokenAuthority, TokenAuthority, TokenRequestError};
pub use braids::*;
pub use persistence::{InMemoryStore, PersistentStore};
pub use refresher::{
    RefreshError, RefreshOutcome, RestrictedCheck, TokenRefresher, TokenRefresherBuilder,
};
pub use scheduler::{
    next_check_delay, ExpiryHandler, ExpiryScheduler, SchedulerState, MIN_CHECK_INTERVAL,
    REFRESH_THRESHOLD,
};
pub use store::{TokenStore, TokenStoreError};
pub use task::TaskHandle;
pub use tokens::{RefreshedTokens, TokenKind, TokenSet};
