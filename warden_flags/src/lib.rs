//! Feature flag evaluation for a signed-in user
//!
//! [`FlagEvaluator`] asks a [`FlagClient`] to evaluate every flag at once and
//! caches the answer for [`CACHE_VALIDITY`]. Individual flags can also be
//! checked live, bypassing the cache, with the result merged back into it.
//!
//! The access token used for evaluation is read from a
//! [`warden_tokens::TokenStore`]; without one, evaluation is skipped and every
//! flag reads as disabled.
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden_flags::{FlagEvaluator, HttpFlagClient};
//! use warden_tokens::{AppId, TokenStore};
//!
//! # async fn run(store: TokenStore) -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpFlagClient::new(
//!     reqwest::Client::new(),
//!     &reqwest::Url::parse("https://backendless.nblocks.cloud")?,
//!     AppId::from_static("my-app"),
//! );
//!
//! let flags = FlagEvaluator::new(Arc::new(client), store);
//! let _watcher = flags.watch_access_token();
//!
//! if flags.is_feature_enabled("new-dashboard", false).await {
//!     println!("showing the new dashboard");
//! }
//! # Ok(())
//! # }
//! ```

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

mod client;
mod context;
mod evaluator;

pub use client::{FlagClient, FlagMap, FlagRequestError, HttpFlagClient};
pub use context::{DeviceContext, FlagContext, OrgContext, UserContext};
pub use evaluator::{ErrorCallback, FlagEvaluator, FlagEvaluatorBuilder, CACHE_VALIDITY};
