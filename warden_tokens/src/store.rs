use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::watch;
use warden_clock::{Clock, System};

use crate::{
    claims::decode_expiry,
    persistence::{InMemoryStore, PersistentStore, StoreError},
    AccessToken, IdToken, RefreshToken, TokenKind, TokenSet,
};

/// An error persisting a token
#[derive(Debug, Error)]
#[error("error persisting {kind} token")]
pub struct TokenStoreError {
    kind: TokenKind,
    #[source]
    source: StoreError,
}

impl TokenStoreError {
    /// The kind of token that could not be persisted
    pub fn kind(&self) -> TokenKind {
        self.kind
    }
}

struct Channels {
    access: watch::Sender<Option<AccessToken>>,
    refresh: watch::Sender<Option<RefreshToken>>,
    id: watch::Sender<Option<IdToken>>,
}

impl Channels {
    fn publish(&self, kind: TokenKind, value: Option<&str>) {
        match kind {
            TokenKind::Access => {
                self.access.send_replace(value.map(AccessToken::from));
            }
            TokenKind::Refresh => {
                self.refresh.send_replace(value.map(RefreshToken::from));
            }
            TokenKind::Id => {
                self.id.send_replace(value.map(IdToken::from));
            }
        }
    }

    fn current(&self, kind: TokenKind) -> Option<String> {
        match kind {
            TokenKind::Access => self.access.borrow().as_ref().map(|t| t.as_str().to_owned()),
            TokenKind::Refresh => self.refresh.borrow().as_ref().map(|t| t.as_str().to_owned()),
            TokenKind::Id => self.id.borrow().as_ref().map(|t| t.as_str().to_owned()),
        }
    }
}

struct Inner {
    storage: Mutex<Box<dyn PersistentStore>>,
    channels: Channels,
}

/// The single source of truth for the user's credentials
///
/// Each token kind is persisted through a [`PersistentStore`] and published on
/// its own watch channel. Every mutation is persisted before it is published,
/// so a subscriber never observes a value that storage does not hold. A kind
/// whose write fails keeps its previous value on both sides.
///
/// Cloning the store is cheap and all clones share the same state.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("access_token", &*self.inner.channels.access.borrow())
            .field("refresh_token", &*self.inner.channels.refresh.borrow())
            .field("id_token", &*self.inner.channels.id.borrow())
            .finish()
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl TokenStore {
    /// Constructs a store over `storage`, loading any tokens already persisted
    pub fn new<S: PersistentStore + 'static>(storage: S) -> Self {
        let access = storage.get(TokenKind::Access.storage_key());
        let refresh = storage.get(TokenKind::Refresh.storage_key());
        let id = storage.get(TokenKind::Id.storage_key());

        tracing::debug!(
            has_access_token = access.is_some(),
            has_refresh_token = refresh.is_some(),
            has_id_token = id.is_some(),
            "loaded persisted tokens"
        );

        let channels = Channels {
            access: watch::Sender::new(access.map(AccessToken::new)),
            refresh: watch::Sender::new(refresh.map(RefreshToken::new)),
            id: watch::Sender::new(id.map(IdToken::new)),
        };

        Self {
            inner: Arc::new(Inner {
                storage: Mutex::new(Box::new(storage)),
                channels,
            }),
        }
    }

    /// Constructs a store that keeps tokens in memory only
    pub fn in_memory() -> Self {
        Self::new(InMemoryStore::new())
    }

    fn storage(&self) -> MutexGuard<'_, Box<dyn PersistentStore>> {
        self.inner
            .storage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(
        storage: &mut dyn PersistentStore,
        channels: &Channels,
        kind: TokenKind,
        value: Option<&str>,
    ) -> Result<(), TokenStoreError> {
        let key = kind.storage_key();
        let result = match value {
            Some(v) => storage.set(key, v),
            None => storage.remove(key),
        };

        match result {
            Ok(()) => {
                channels.publish(kind, value);
                Ok(())
            }
            Err(source) => {
                let error: &dyn std::error::Error = &*source;
                tracing::error!(error, token.kind = %kind, "failed to persist token");
                Err(TokenStoreError { kind, source })
            }
        }
    }

    /// Persists (or, when `None`, removes) the token of `kind` and publishes it
    ///
    /// Only the stream for `kind` is notified.
    pub fn set_token(&self, kind: TokenKind, value: Option<&str>) -> Result<(), TokenStoreError> {
        let mut storage = self.storage();
        Self::write(&mut **storage, &self.inner.channels, kind, value)
    }

    /// Sets the access token
    pub fn set_access_token(&self, token: Option<&AccessToken>) -> Result<(), TokenStoreError> {
        self.set_token(TokenKind::Access, token.map(|t| t.as_str()))
    }

    /// Sets the refresh token
    pub fn set_refresh_token(&self, token: Option<&RefreshToken>) -> Result<(), TokenStoreError> {
        self.set_token(TokenKind::Refresh, token.map(|t| t.as_str()))
    }

    /// Sets the identity token
    pub fn set_id_token(&self, token: Option<&IdToken>) -> Result<(), TokenStoreError> {
        self.set_token(TokenKind::Id, token.map(|t| t.as_str()))
    }

    /// Replaces all three tokens under a single write lock
    ///
    /// Kinds absent from `tokens` are removed. Every kind is attempted even if
    /// an earlier one fails; the first failure is returned.
    pub fn store_tokens(&self, tokens: &TokenSet) -> Result<(), TokenStoreError> {
        let mut storage = self.storage();
        let mut first_error = None;

        for kind in TokenKind::ALL {
            if let Err(err) = Self::write(&mut **storage, &self.inner.channels, kind, tokens.get(kind))
            {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Clears all three tokens, publishing `None` on every stream
    ///
    /// Clearing an already empty store is a no-op apart from the notifications.
    pub fn destroy_tokens(&self) -> Result<(), TokenStoreError> {
        tracing::debug!("destroying stored tokens");
        self.store_tokens(&TokenSet::default())
    }

    /// The last known value of the token of `kind`
    pub fn get_token(&self, kind: TokenKind) -> Option<String> {
        self.inner.channels.current(kind)
    }

    /// The current access token
    pub fn access_token(&self) -> Option<AccessToken> {
        self.inner.channels.access.borrow().clone()
    }

    /// The current refresh token
    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.inner.channels.refresh.borrow().clone()
    }

    /// The current identity token
    pub fn id_token(&self) -> Option<IdToken> {
        self.inner.channels.id.borrow().clone()
    }

    /// A snapshot of all three tokens
    pub fn tokens(&self) -> TokenSet {
        TokenSet {
            access_token: self.access_token(),
            refresh_token: self.refresh_token(),
            id_token: self.id_token(),
        }
    }

    /// Subscribes to access token changes
    ///
    /// The receiver immediately observes the current value.
    pub fn subscribe_access_token(&self) -> watch::Receiver<Option<AccessToken>> {
        self.inner.channels.access.subscribe()
    }

    /// Subscribes to refresh token changes
    pub fn subscribe_refresh_token(&self) -> watch::Receiver<Option<RefreshToken>> {
        self.inner.channels.refresh.subscribe()
    }

    /// Subscribes to identity token changes
    pub fn subscribe_id_token(&self) -> watch::Receiver<Option<IdToken>> {
        self.inner.channels.id.subscribe()
    }

    /// Whether the access token is absent, undecodable, or past its `exp`
    #[inline]
    pub fn is_access_token_expired(&self) -> bool {
        self.is_access_token_expired_with_clock(&System)
    }

    /// Whether the access token is absent, undecodable, or past its `exp`
    /// according to `clock`
    pub fn is_access_token_expired_with_clock<C: Clock>(&self, clock: &C) -> bool {
        let exp = self
            .inner
            .channels
            .access
            .borrow()
            .as_ref()
            .and_then(|t| decode_expiry(t.as_str()));

        match exp {
            Some(exp) => exp <= clock.now(),
            None => true,
        }
    }

    /// Whether an unexpired access token is held
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        !self.is_access_token_expired()
    }

    /// Whether an unexpired access token is held according to `clock`
    #[inline]
    pub fn is_authenticated_with_clock<C: Clock>(&self, clock: &C) -> bool {
        !self.is_access_token_expired_with_clock(clock)
    }

    /// Clears the access and refresh tokens whose `exp` has passed
    ///
    /// Each kind is judged independently. Tokens without a decodable `exp`
    /// are left alone, since refresh tokens are frequently opaque.
    #[inline]
    pub fn clear_expired_tokens(&self) -> Result<(), TokenStoreError> {
        self.clear_expired_tokens_with_clock(&System)
    }

    /// Clears expired access and refresh tokens according to `clock`
    pub fn clear_expired_tokens_with_clock<C: Clock>(
        &self,
        clock: &C,
    ) -> Result<(), TokenStoreError> {
        let now = clock.now();
        let mut storage = self.storage();
        let mut first_error = None;

        for kind in [TokenKind::Access, TokenKind::Refresh] {
            let expired = self
                .inner
                .channels
                .current(kind)
                .and_then(|t| decode_expiry(&t))
                .map_or(false, |exp| exp <= now);

            if expired {
                tracing::info!(token.kind = %kind, "clearing expired token");
                if let Err(err) = Self::write(&mut **storage, &self.inner.channels, kind, None) {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
