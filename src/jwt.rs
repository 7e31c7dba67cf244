//! Minimal JWT claim inspection. Signatures are not verified; the token is
//! only checked for expiry before it is handed out.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

use crate::error::{Result, RotationError};

/// Tokens closer than this to expiry are treated as expired
pub const EXPIRY_BUFFER_SECONDS: i64 = 60;

/// Decode the claims segment of a compact JWT
pub fn claims(token: &str) -> Result<Value> {
    let mut parts = token.trim().split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(RotationError::InvalidState("token is not a JWT".to_string())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| RotationError::InvalidState(format!("JWT payload is not base64url: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| RotationError::InvalidState(format!("JWT payload is not JSON: {}", e)))
}

/// The `exp` claim, if present
pub fn expires_at(token: &str) -> Result<Option<DateTime<Utc>>> {
    let claims = claims(token)?;
    let exp = match claims.get("exp") {
        Some(Value::Number(n)) => n.as_f64().map(|v| v as i64),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    Ok(exp.and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
}

/// Whether `token` is a JWT that stays valid for more than the expiry buffer
///
/// Undecodable tokens and tokens without `exp` are not valid.
pub fn is_valid(token: &str, now: DateTime<Utc>) -> bool {
    match expires_at(token) {
        Ok(Some(exp)) => exp - Duration::seconds(EXPIRY_BUFFER_SECONDS) > now,
        _ => false,
    }
}

#[cfg(test)]
pub(crate) fn token_expiring_at(exp: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"svc","exp":{}}}"#, exp.timestamp()));
    format!("{}.{}.signature", header, payload)
}
