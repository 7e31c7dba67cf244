use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use super::{classify_status, classify_transport, join_url, CredentialAuthority};
use crate::backends::SecretValue;
use crate::error::{Result, RotationError};

const TOKEN_HEADER: &str = "X-Auth-Token";

/// Master secret layout for PierianDx
#[derive(Clone, Deserialize, Serialize)]
pub struct PierianDxCredentials {
    pub email: String,
    pub password: String,
    pub institution: String,
}

impl fmt::Debug for PierianDxCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PierianDxCredentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("institution", &self.institution)
            .finish()
    }
}

impl PierianDxCredentials {
    pub fn parse(master: &SecretValue) -> Result<Self> {
        let credentials: Self = serde_json::from_str(master.expose()).map_err(|e| {
            RotationError::config(format!(
                "PierianDx master secret must be a JSON object with email, password and institution: {}",
                e
            ))
        })?;
        if credentials.email.is_empty() || credentials.password.is_empty() {
            return Err(RotationError::config(
                "PierianDx master secret has an empty email or password",
            ));
        }
        Ok(credentials)
    }
}

/// PierianDx login exchange: email/password for a JWT
pub struct PierianDxAuthority {
    client: Client,
    base_url: String,
}

impl PierianDxAuthority {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl CredentialAuthority for PierianDxAuthority {
    async fn exchange(&self, master: &SecretValue) -> Result<SecretValue> {
        let credentials = PierianDxCredentials::parse(master)?;
        let url = join_url(&self.base_url, "v2.0.0/login");
        debug!("Logging in to PierianDx as {}", credentials.email);

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .header("X-Auth-Email", &credentials.email)
            .header("X-Auth-Key", &credentials.password)
            .header("X-Auth-Institution", &credentials.institution)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let token = token.ok_or_else(|| RotationError::ExternalAuthority {
            status: status.as_u16(),
            message: format!("login response has no {} header", TOKEN_HEADER),
        })?;

        info!("Exchanged PierianDx credentials for a new token");
        Ok(SecretValue::from(token))
    }

    fn authority_type(&self) -> &'static str {
        "PierianDx"
    }
}
