//! The authentication backend's token endpoints

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;

use crate::{AppId, AuthorizationCodeRef, RefreshTokenRef, RefreshedTokens, TokenSet};

mod dto;

/// A backend that issues tokens
#[async_trait]
pub trait TokenAuthority: fmt::Debug + Send + Sync {
    /// Exchanges a refresh token for a new access token
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedTokens, TokenRequestError>;

    /// Exchanges the authorization code returned to the callback route for a token set
    async fn exchange_code(&self, code: &AuthorizationCodeRef)
        -> Result<TokenSet, TokenRequestError>;
}

/// An error while attempting to request tokens from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// An error from the authority with an error body
    #[error("error requesting token from authority: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(reqwest::Error),
}

/// Appends path segments to `base`, percent-encoding each one
///
/// A trailing slash on `base` does not produce an empty segment.
pub fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// A [`TokenAuthority`] reached over HTTP
///
/// * refresh: `POST {base}/token`
/// * code exchange: `POST {base}/token/code/{app_id}`
#[derive(Debug, Clone)]
pub struct HttpTokenAuthority {
    client: reqwest::Client,
    app_id: AppId,
    token_url: Url,
    code_url: Url,
}

impl HttpTokenAuthority {
    /// Constructs an authority rooted at `auth_base_url`
    pub fn new(client: reqwest::Client, auth_base_url: &Url, app_id: AppId) -> Self {
        let token_url = endpoint(auth_base_url, &["token"]);
        let code_url = endpoint(auth_base_url, &["token", "code", app_id.as_str()]);
        Self {
            client,
            app_id,
            token_url,
            code_url,
        }
    }

    /// The refresh endpoint
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }
}

#[async_trait]
impl TokenAuthority for HttpTokenAuthority {
    #[tracing::instrument(
        err,
        skip(self, refresh_token),
        fields(token_url = %self.token_url, credentials.client_id = %self.app_id),
    )]
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedTokens, TokenRequestError> {
        let request = dto::RefreshTokenRequest {
            client_id: &self.app_id,
            grant_type: "refresh_token",
            refresh_token,
        };

        let resp = post_json(&self.client, self.token_url.clone(), &request).await?;

        tracing::info!(
            has_id_token = resp.id_token.is_some(),
            has_refresh_token = resp.refresh_token.is_some(),
            expires_in = resp.expires_in,
            "received refreshed tokens"
        );

        Ok(RefreshedTokens {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            id_token: resp.id_token,
            expires_in: resp.expires_in.map(Duration::from_secs),
        })
    }

    #[tracing::instrument(err, skip(self, code), fields(token_url = %self.code_url))]
    async fn exchange_code(
        &self,
        code: &AuthorizationCodeRef,
    ) -> Result<TokenSet, TokenRequestError> {
        let request = dto::CodeExchangeRequest { code };

        let resp = post_json(&self.client, self.code_url.clone(), &request).await?;

        tracing::info!(
            has_id_token = resp.id_token.is_some(),
            has_refresh_token = resp.refresh_token.is_some(),
            "exchanged authorization code for tokens"
        );

        Ok(TokenSet {
            access_token: Some(resp.access_token),
            refresh_token: resp.refresh_token,
            id_token: resp.id_token,
        })
    }
}

async fn post_json<S: serde::Serialize>(
    client: &reqwest::Client,
    url: Url,
    payload: &S,
) -> Result<dto::TokenResponse, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let resp = client
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from authority"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(TokenRequestError::BodyReadError)?;
        return Err(TokenRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(TokenRequestError::BodyReadError)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let with = Url::parse("https://auth.example.com/").unwrap();
        let without = Url::parse("https://auth.example.com").unwrap();
        let nested = Url::parse("https://example.com/auth/").unwrap();

        assert_eq!(
            endpoint(&with, &["token", "code", "app"]).as_str(),
            "https://auth.example.com/token/code/app"
        );
        assert_eq!(
            endpoint(&without, &["token"]).as_str(),
            "https://auth.example.com/token"
        );
        assert_eq!(
            endpoint(&nested, &["token"]).as_str(),
            "https://example.com/auth/token"
        );
    }

    #[test]
    fn endpoint_encodes_segments() {
        let base = Url::parse("https://auth.example.com").unwrap();
        assert_eq!(
            endpoint(&base, &["flags", "a b/c"]).as_str(),
            "https://auth.example.com/flags/a%20b%2Fc"
        );
    }
}
