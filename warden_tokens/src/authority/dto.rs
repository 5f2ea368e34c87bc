//! Wire shapes for the token endpoints

use serde::{Deserialize, Serialize};

use crate::{AccessToken, AppIdRef, AuthorizationCodeRef, IdToken, RefreshToken, RefreshTokenRef};

#[derive(Debug, Serialize)]
pub(super) struct RefreshTokenRequest<'a> {
    pub client_id: &'a AppIdRef,
    pub grant_type: &'static str,
    pub refresh_token: &'a RefreshTokenRef,
}

#[derive(Debug, Serialize)]
pub(super) struct CodeExchangeRequest<'a> {
    pub code: &'a AuthorizationCodeRef,
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default)]
    pub id_token: Option<IdToken>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}
