//! Handing the signed-in user over to the team management portal

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use warden_tokens::{endpoint, AccessTokenRef, AppId, TokenStore};

/// An error obtaining a team management URL
#[derive(Debug, Error)]
pub enum HandoverError {
    /// No access token is stored
    #[error("user must be authenticated to access team management")]
    NotAuthenticated,
    /// The authentication service responded with an error status
    #[error("error requesting handover code: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the handover body
    #[error("error deserializing handover body")]
    HandoverBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(reqwest::Error),
    /// Unable to send the request
    #[error("error sending handover request")]
    RequestSend(reqwest::Error),
    /// The response carried no code
    #[error("failed to get handover code")]
    MissingCode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HandoverRequest<'a> {
    access_token: &'a AccessTokenRef,
}

#[derive(Debug, Deserialize)]
struct HandoverResponse {
    #[serde(default)]
    code: Option<String>,
}

/// Builds links into the team management portal
///
/// The portal signs the user in with a one-time handover code obtained with
/// their access token.
#[derive(Clone, Debug)]
pub struct TeamManagement {
    client: reqwest::Client,
    tokens: TokenStore,
    handover_url: Url,
    portal_url: Url,
}

impl TeamManagement {
    /// Constructs a handover client
    ///
    /// Codes are requested from `{auth_base_url}/handover/code/{app_id}`.
    pub fn new(
        client: reqwest::Client,
        tokens: TokenStore,
        auth_base_url: &Url,
        app_id: &AppId,
        portal_url: Url,
    ) -> Self {
        Self {
            client,
            tokens,
            handover_url: endpoint(auth_base_url, &["handover", "code", app_id.as_str()]),
            portal_url,
        }
    }

    /// A portal URL carrying a fresh handover code
    ///
    /// # Errors
    ///
    /// Fails if no access token is stored, the request fails, or no code is
    /// returned.
    #[tracing::instrument(err, skip(self), fields(handover_url = %self.handover_url))]
    pub async fn team_management_url(&self) -> Result<Url, HandoverError> {
        let access_token = self
            .tokens
            .access_token()
            .ok_or(HandoverError::NotAuthenticated)?;

        let resp = self
            .client
            .post(self.handover_url.clone())
            .json(&HandoverRequest {
                access_token: &access_token,
            })
            .send()
            .await
            .map_err(HandoverError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received handover response"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let body = resp.text().await.map_err(HandoverError::BodyReadError)?;
            return Err(HandoverError::ErrorWithBody {
                source: error,
                body,
            });
        }

        let body = resp.bytes().await.map_err(HandoverError::BodyReadError)?;
        let code = serde_json::from_slice::<HandoverResponse>(&body)?
            .code
            .filter(|c| !c.is_empty())
            .ok_or(HandoverError::MissingCode)?;

        let mut url = self.portal_url.clone();
        url.query_pairs_mut().append_pair("code", &code);
        Ok(url)
    }
}
