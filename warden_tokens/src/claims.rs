//! Unverified inspection of JWT payloads
//!
//! The access token's signature is the resource server's concern. The client
//! only needs to know when the token stops being useful, so the payload is
//! decoded without any key material.

use aliri_base64::Base64Url;
use serde::Deserialize;
use warden_clock::UnixTime;

#[derive(Deserialize)]
struct ExpiryClaim {
    #[serde(default)]
    exp: Option<u64>,
}

/// Decodes the `exp` claim of a JWT-shaped token without verifying it
///
/// Returns `None` if the token does not have three segments, the payload is not
/// base64url-encoded JSON, or the `exp` claim is absent or not an integer.
pub fn decode_expiry(token: &str) -> Option<UnixTime> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return None,
    };

    let raw = Base64Url::from_encoded(payload).ok()?;
    let claim: ExpiryClaim = serde_json::from_slice(raw.as_slice()).ok()?;
    claim.exp.map(UnixTime::from_secs)
}
