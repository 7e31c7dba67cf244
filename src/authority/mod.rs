//! External identity authorities that exchange a master credential for a
//! short-lived token.

mod ica;
mod pieriandx;

pub use ica::{IcaAuthority, ProjectScope};
pub use pieriandx::{PierianDxAuthority, PierianDxCredentials};

use std::sync::Arc;

use crate::backends::SecretValue;
use crate::config::AuthorityConfig;
use crate::error::{Result, RotationError};

#[async_trait::async_trait]
pub trait CredentialAuthority: Send + Sync {
    /// Exchange the master value for a new derived credential
    async fn exchange(&self, master: &SecretValue) -> Result<SecretValue>;

    /// Get the authority type name for display purposes
    fn authority_type(&self) -> &'static str;
}

/// Type alias for the shared authority trait object
pub type Authority = Arc<dyn CredentialAuthority>;

/// Build the authority described by `config`
pub fn from_config(config: &AuthorityConfig) -> Result<Authority> {
    let authority: Authority = match config {
        AuthorityConfig::IcaV1 {
            base_url,
            project_id,
            project_ids,
        } => Arc::new(IcaAuthority::v1(
            base_url,
            project_id.clone(),
            project_ids.clone(),
        )?),
        AuthorityConfig::IcaV2 { base_url } => Arc::new(IcaAuthority::v2(base_url)),
        AuthorityConfig::Pieriandx { base_url } => Arc::new(PierianDxAuthority::new(base_url)),
    };
    Ok(authority)
}

/// Server errors and throttling are worth retrying on the next firing; any
/// other rejection needs an operator
pub(crate) fn classify_status(status: u16, body: &str) -> RotationError {
    let message = truncate(body.trim(), 200);
    if status >= 500 || status == 429 {
        RotationError::Transient(format!("authority returned {}: {}", status, message))
    } else {
        RotationError::ExternalAuthority { status, message }
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> RotationError {
    RotationError::Transient(format!("could not reach authority: {}", err))
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(503, "unavailable").is_transient());
        assert!(classify_status(429, "slow down").is_transient());
        assert!(matches!(
            classify_status(401, "invalid api key"),
            RotationError::ExternalAuthority { status: 401, .. }
        ));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://ica.illumina.com/ica/rest/", "/api/tokens"), "https://ica.illumina.com/ica/rest/api/tokens");
    }

    #[test]
    fn test_from_config() {
        let v2 = from_config(&AuthorityConfig::IcaV2 {
            base_url: "https://ica.illumina.com/ica/rest".to_string(),
        })
        .unwrap();
        assert_eq!(v2.authority_type(), "ICA v2");

        let bad = from_config(&AuthorityConfig::IcaV1 {
            base_url: "https://aps2.platform.illumina.com".to_string(),
            project_id: None,
            project_ids: vec![],
        });
        assert!(matches!(bad.err(), Some(RotationError::Config(_))));
    }
}
