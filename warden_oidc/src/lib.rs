//! Identity token verification and profile mapping
//!
//! A signed-in user's identity token is verified against the JSON Web Key Set
//! published by the auth service and turned into a [`Profile`].
//!
//! * [`KeySetVerifier`] fetches and caches the key set, then checks a token's
//!   signature, algorithm, issuer, audience and expiry.
//! * [`ProfileWatcher`] follows the identity token held by a
//!   [`warden_tokens::TokenStore`] and republishes the verified profile every
//!   time the token changes.
//!
//! ```no_run
//! use warden_oidc::{KeySetVerifier, ProfileWatcher};
//! use warden_tokens::{AppIdRef, TokenStore};
//!
//! # async fn run(store: TokenStore) -> Result<(), Box<dyn std::error::Error>> {
//! let base = reqwest::Url::parse("https://auth.nblocks.cloud")?;
//! let verifier =
//!     KeySetVerifier::builder_for_authority(&base, AppIdRef::from_static("my-app")).build()?;
//!
//! let watcher = ProfileWatcher::spawn(verifier, store.subscribe_id_token());
//! let mut profiles = watcher.subscribe();
//! while profiles.changed().await.is_ok() {
//!     if let Some(profile) = &*profiles.borrow() {
//!         println!("signed in as {}", profile.id);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `rsa` (default): RS256, RS384 and RS512 signatures, approved by default.
//! * `hmac` (default): HMAC signatures, which must be approved explicitly.
//! * `ec`: elliptic curve signatures, which must be approved explicitly.

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

mod claims;
mod error;
mod profile;
mod verifier;
mod watcher;

pub use claims::IdentityClaims;
pub use error::{TokenVerificationError, VerificationErrorKind};
pub use profile::{Profile, TenantInfo};
pub use verifier::{KeySetVerifier, KeySetVerifierBuilder, DEFAULT_REFETCH_COOLDOWN};
pub use watcher::ProfileWatcher;
