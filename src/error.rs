//! Error taxonomy for provisioning and rotation.
//!
//! Configuration errors surface at setup time, before anything is made live.
//! Everything else surfaces while a rotator runs and is turned into a failed
//! [`RotationEvent`](crate::events::RotationEvent) at the invocation boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification carried on failed rotation events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Config,
    AccessDenied,
    ExternalAuthority,
    Transient,
    Store,
    InvalidState,
    Notification,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Config => "config",
            ErrorClass::AccessDenied => "access_denied",
            ErrorClass::ExternalAuthority => "external_authority",
            ErrorClass::Transient => "transient",
            ErrorClass::Store => "store",
            ErrorClass::InvalidState => "invalid_state",
            ErrorClass::Notification => "notification",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RotationError {
    /// Undefined identity reference, empty required parameter, bad master format
    #[error("configuration error: {0}")]
    Config(String),

    /// A caller tried to read a secret it is not allow-listed for
    #[error("access denied: {identity} is not allowed to {action} on {secret}")]
    AccessDenied {
        identity: String,
        action: String,
        secret: String,
    },

    /// The remote identity provider rejected the credential exchange
    #[error("external authority rejected the exchange (status {status}): {message}")]
    ExternalAuthority { status: u16, message: String },

    /// Network trouble or a 5xx; the next scheduled firing retries
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret store error: {0}")]
    Store(String),

    /// The rotation step protocol was violated (unknown token, rotation disabled, ...)
    #[error("invalid rotation state: {0}")]
    InvalidState(String),

    #[error("notification delivery failed: {0}")]
    Notification(String),
}

pub type Result<T> = std::result::Result<T, RotationError>;

impl RotationError {
    pub fn config(message: impl Into<String>) -> Self {
        RotationError::Config(message.into())
    }

    pub fn access_denied(
        identity: impl std::fmt::Display,
        action: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        RotationError::AccessDenied {
            identity: identity.to_string(),
            action: action.into(),
            secret: secret.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RotationError::Config(_) => ErrorClass::Config,
            RotationError::AccessDenied { .. } => ErrorClass::AccessDenied,
            RotationError::ExternalAuthority { .. } => ErrorClass::ExternalAuthority,
            RotationError::Transient(_) => ErrorClass::Transient,
            RotationError::NotFound(_) | RotationError::Store(_) => ErrorClass::Store,
            RotationError::InvalidState(_) => ErrorClass::InvalidState,
            RotationError::Notification(_) => ErrorClass::Notification,
        }
    }

    /// Whether the next natural scheduler firing may succeed without operator action
    pub fn is_transient(&self) -> bool {
        matches!(self, RotationError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RotationError::access_denied("arn:aws:iam::1:role/x", "secretsmanager:GetSecretValue", "master");
        assert_eq!(
            err.to_string(),
            "access denied: arn:aws:iam::1:role/x is not allowed to secretsmanager:GetSecretValue on master"
        );

        let err = RotationError::ExternalAuthority {
            status: 401,
            message: "expired api key".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "external authority rejected the exchange (status 401): expired api key"
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(RotationError::config("x").class(), ErrorClass::Config);
        assert_eq!(RotationError::NotFound("x".into()).class(), ErrorClass::Store);
        assert_eq!(RotationError::Transient("x".into()).class(), ErrorClass::Transient);
        assert!(RotationError::Transient("x".into()).is_transient());
        assert!(!RotationError::config("x").is_transient());
    }

    #[test]
    fn test_error_class_serialization() {
        let json = serde_json::to_string(&ErrorClass::ExternalAuthority).unwrap();
        assert_eq!(json, "\"external_authority\"");
        assert_eq!(ErrorClass::AccessDenied.to_string(), "access_denied");
    }
}
