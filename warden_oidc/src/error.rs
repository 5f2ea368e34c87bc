use aliri::error::{ClaimsRejected, JwtVerifyError};
use thiserror::Error;

/// An error verifying an identity token
///
/// Errors are cheap to clone so that they can be broadcast to every
/// interested subscriber.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenVerificationError {
    /// The token's `exp` claim is in the past
    #[error("Token has expired")]
    TokenExpired,
    /// The token is malformed, has a bad signature, or carries unacceptable claims
    #[error("Invalid token{}", suffix(.detail))]
    InvalidToken {
        /// What was wrong with the token
        detail: Option<String>,
    },
    /// The key set could not be fetched, parsed, or did not contain a usable key
    #[error("Failed to fetch or validate JWKS{}", suffix(.detail))]
    Jwks {
        /// What went wrong with the key set
        detail: Option<String>,
    },
}

/// Discriminates the variants of [`TokenVerificationError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VerificationErrorKind {
    /// See [`TokenVerificationError::TokenExpired`]
    TokenExpired,
    /// See [`TokenVerificationError::InvalidToken`]
    InvalidToken,
    /// See [`TokenVerificationError::Jwks`]
    Jwks,
}

fn suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {}", d),
        None => String::new(),
    }
}

impl TokenVerificationError {
    pub(crate) fn invalid(detail: impl Into<String>) -> Self {
        Self::InvalidToken {
            detail: Some(detail.into()),
        }
    }

    pub(crate) fn jwks(detail: impl Into<String>) -> Self {
        Self::Jwks {
            detail: Some(detail.into()),
        }
    }

    /// The kind of failure
    pub fn kind(&self) -> VerificationErrorKind {
        match self {
            Self::TokenExpired => VerificationErrorKind::TokenExpired,
            Self::InvalidToken { .. } => VerificationErrorKind::InvalidToken,
            Self::Jwks { .. } => VerificationErrorKind::Jwks,
        }
    }

    /// Additional detail, if any
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::TokenExpired => None,
            Self::InvalidToken { detail } | Self::Jwks { detail } => detail.as_deref(),
        }
    }
}

impl From<JwtVerifyError> for TokenVerificationError {
    fn from(err: JwtVerifyError) -> Self {
        match err {
            JwtVerifyError::ClaimsRejected(ClaimsRejected::TokenExpired) => Self::TokenExpired,
            JwtVerifyError::ClaimsRejected(rejected) => Self::invalid(rejected.to_string()),
            JwtVerifyError::JwkVerifyError(err) => {
                Self::invalid(format!("signature rejected: {}", err))
            }
            other => Self::invalid(other.to_string()),
        }
    }
}
