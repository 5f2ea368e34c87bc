//! The flag evaluation backend

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_tokens::{endpoint, AccessTokenRef, AppId};

use crate::FlagContext;

/// Flag name to enabled state
pub type FlagMap = BTreeMap<String, bool>;

/// A backend that evaluates feature flags for the holder of an access token
#[async_trait]
pub trait FlagClient: fmt::Debug + Send + Sync {
    /// Evaluates every flag defined for the application
    async fn bulk_evaluate(
        &self,
        access_token: &AccessTokenRef,
        context: Option<&FlagContext>,
    ) -> Result<FlagMap, FlagRequestError>;

    /// Evaluates a single flag
    async fn evaluate(
        &self,
        access_token: &AccessTokenRef,
        flag: &str,
    ) -> Result<bool, FlagRequestError>;
}

/// An error while requesting a flag evaluation
#[derive(Debug, Error)]
pub enum FlagRequestError {
    /// The backend responded with an error status
    #[error("error evaluating flags: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the evaluation body
    #[error("error deserializing flag evaluation body")]
    EvaluationBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(reqwest::Error),
    /// Unable to send the request
    #[error("error sending request to flag backend")]
    RequestSend(reqwest::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkEvaluationRequest<'a> {
    access_token: &'a AccessTokenRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a FlagContext>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluationRequest<'a> {
    access_token: &'a AccessTokenRef,
}

#[derive(Debug, Deserialize)]
struct BulkEvaluationResponse {
    #[serde(default)]
    flags: Vec<FlagResponse>,
}

#[derive(Debug, Deserialize)]
struct FlagResponse {
    flag: String,
    evaluation: Evaluation,
}

#[derive(Debug, Deserialize)]
struct Evaluation {
    enabled: bool,
}

/// A [`FlagClient`] reached over HTTP
///
/// * bulk: `POST {base}/flags/bulkEvaluate/{app_id}`
/// * single: `POST {base}/flags/evaluate/{app_id}/{flag}`
#[derive(Debug, Clone)]
pub struct HttpFlagClient {
    client: reqwest::Client,
    base_url: Url,
    app_id: AppId,
    bulk_url: Url,
}

impl HttpFlagClient {
    /// Constructs a client rooted at `flags_base_url`
    pub fn new(client: reqwest::Client, flags_base_url: &Url, app_id: AppId) -> Self {
        let bulk_url = endpoint(flags_base_url, &["flags", "bulkEvaluate", app_id.as_str()]);
        Self {
            client,
            base_url: flags_base_url.clone(),
            app_id,
            bulk_url,
        }
    }

    /// The bulk evaluation endpoint
    pub fn bulk_url(&self) -> &Url {
        &self.bulk_url
    }

    fn flag_url(&self, flag: &str) -> Url {
        endpoint(&self.base_url, &["flags", "evaluate", self.app_id.as_str(), flag])
    }

    async fn post_json<S, R>(&self, url: Url, payload: &S) -> Result<R, FlagRequestError>
    where
        S: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let resp = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(FlagRequestError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received flag evaluation response"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let body = resp.text().await.map_err(FlagRequestError::BodyReadError)?;
            return Err(FlagRequestError::ErrorWithBody {
                source: error,
                body,
            });
        }

        let body = resp.bytes().await.map_err(FlagRequestError::BodyReadError)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl FlagClient for HttpFlagClient {
    #[tracing::instrument(err, skip_all, fields(flags_url = %self.bulk_url))]
    async fn bulk_evaluate(
        &self,
        access_token: &AccessTokenRef,
        context: Option<&FlagContext>,
    ) -> Result<FlagMap, FlagRequestError> {
        let request = BulkEvaluationRequest {
            access_token,
            context,
        };

        let resp: BulkEvaluationResponse = self.post_json(self.bulk_url.clone(), &request).await?;

        Ok(resp
            .flags
            .into_iter()
            .map(|f| (f.flag, f.evaluation.enabled))
            .collect())
    }

    #[tracing::instrument(err, skip(self, access_token))]
    async fn evaluate(
        &self,
        access_token: &AccessTokenRef,
        flag: &str,
    ) -> Result<bool, FlagRequestError> {
        let request = EvaluationRequest { access_token };

        let resp: Evaluation = self.post_json(self.flag_url(flag), &request).await?;

        Ok(resp.enabled)
    }
}
