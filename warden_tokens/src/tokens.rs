use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::{AccessToken, IdToken, RefreshToken};

/// The three kinds of credentials held for a signed-in user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// The bearer token presented to APIs
    Access,
    /// The long-lived token used to obtain new access tokens
    Refresh,
    /// The OpenID Connect identity token describing the user
    Id,
}

impl TokenKind {
    /// Every token kind, in a stable order
    pub const ALL: [TokenKind; 3] = [TokenKind::Access, TokenKind::Refresh, TokenKind::Id];

    /// The key under which a token of this kind is persisted
    #[inline]
    pub const fn storage_key(self) -> &'static str {
        match self {
            TokenKind::Access => "access_token",
            TokenKind::Refresh => "refresh_token",
            TokenKind::Id => "id_token",
        }
    }

}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::Id => "id",
        })
    }
}

/// A full set of credentials as issued by the authentication backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// The access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessToken>,
    /// The refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
    /// The identity token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdToken>,
}

impl TokenSet {
    /// Constructs a complete token set
    pub fn new(access_token: AccessToken, refresh_token: RefreshToken, id_token: IdToken) -> Self {
        Self {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            id_token: Some(id_token),
        }
    }

    /// The value held for `kind`, as a plain string
    pub fn get(&self, kind: TokenKind) -> Option<&str> {
        match kind {
            TokenKind::Access => self.access_token.as_deref().map(|t| t.as_str()),
            TokenKind::Refresh => self.refresh_token.as_deref().map(|t| t.as_str()),
            TokenKind::Id => self.id_token.as_deref().map(|t| t.as_str()),
        }
    }
}

/// Tokens obtained from a refresh exchange
///
/// The authority may decline to rotate the refresh token or omit the identity
/// token, in which case the existing values should be kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshedTokens {
    /// The new access token
    pub access_token: AccessToken,
    /// A rotated refresh token, if the authority issued one
    pub refresh_token: Option<RefreshToken>,
    /// A new identity token, if the authority issued one
    pub id_token: Option<IdToken>,
    /// The lifetime of the new access token, if reported
    pub expires_in: Option<Duration>,
}
