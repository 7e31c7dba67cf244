use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::backends::SecretValue;
use crate::error::{Result, RotationError};
use crate::targets::target::SyncTarget;

const PUT_SECRET_ENDPOINT: &str = "api/2.0/secrets/put";

/// Databricks workspace secret scopes, written with a personal access token
pub struct DatabricksTarget {
    client: Client,
    host: String,
    token: SecretValue,
}

impl DatabricksTarget {
    pub fn new(host: &str, token: SecretValue, timeout: Duration) -> Result<Self> {
        info!("Creating Databricks target for: {}", host);

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RotationError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            host: host.trim().to_string(),
            token: token.trimmed(),
        })
    }

    /// Full URL of the put-secret endpoint
    pub(crate) fn build_url(&self) -> String {
        let host = if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.clone()
        } else {
            format!("https://{}", self.host)
        };
        format!("{}/{}", host.trim_end_matches('/'), PUT_SECRET_ENDPOINT)
    }
}

#[async_trait::async_trait]
impl SyncTarget for DatabricksTarget {
    async fn put_secret(&self, scope: &str, key: &str, value: &SecretValue) -> Result<()> {
        let url = self.build_url();
        debug!("Calling Databricks endpoint: {}", url);

        let body = json!({
            "scope": scope,
            "key": key,
            "string_value": value.expose(),
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| RotationError::Transient(format!("Failed to reach Databricks: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(if status.is_server_error() {
                RotationError::Transient(format!("Databricks returned {}: {}", status, error_text))
            } else {
                RotationError::Store(format!(
                    "Databricks put-secret failed with status {}: {}",
                    status, error_text
                ))
            });
        }

        info!("Successfully updated Databricks secret {}/{}", scope, key);
        Ok(())
    }

    fn target_type(&self) -> &'static str {
        "databricks"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn target(host: &str) -> DatabricksTarget {
        DatabricksTarget::new(host, SecretValue::from("dapi-token\n"), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_build_url_with_bare_host() {
        assert_eq!(
            target("adb-123.azuredatabricks.net").build_url(),
            "https://adb-123.azuredatabricks.net/api/2.0/secrets/put"
        );
    }

    #[test]
    fn test_build_url_with_trailing_slash() {
        assert_eq!(
            target("https://adb-123.azuredatabricks.net/").build_url(),
            "https://adb-123.azuredatabricks.net/api/2.0/secrets/put"
        );
    }

    #[tokio::test]
    async fn test_put_secret() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/2.0/secrets/put")
            .match_header("authorization", "Bearer dapi-token")
            .match_body(Matcher::Json(json!({
                "scope": "orcabus",
                "key": "orcabus_jwt",
                "string_value": "jwt-value"
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        target(&server.url())
            .put_secret("orcabus", "orcabus_jwt", &SecretValue::from("jwt-value"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_put_secret_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/2.0/secrets/put")
            .with_status(403)
            .with_body(r#"{"error_code":"PERMISSION_DENIED"}"#)
            .create_async()
            .await;

        let err = target(&server.url())
            .put_secret("orcabus", "orcabus_jwt", &SecretValue::from("jwt-value"))
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::Store(_)));
    }
}
