use reqwest::header::ACCEPT;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{classify_status, classify_transport, join_url, CredentialAuthority};
use crate::backends::SecretValue;
use crate::error::{Result, RotationError};

const API_KEY_HEADER: &str = "X-API-Key";
const V1_ACCEPT: &str = "application/json";
const V2_ACCEPT: &str = "application/vnd.illumina.v3+json";

/// Which projects a v1 token is scoped to
///
/// ICA v1 cannot issue a token for several projects, so multi-project scope
/// produces a JSON object of project id to token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectScope {
    Single(String),
    Multi(Vec<String>),
}

#[derive(Debug, Clone)]
enum IcaVersion {
    V1(ProjectScope),
    V2,
}

/// Illumina Connected Analytics API key to JWT exchange
pub struct IcaAuthority {
    client: Client,
    base_url: String,
    version: IcaVersion,
}

impl IcaAuthority {
    /// Exactly one of `project_id` and `project_ids` must be given
    pub fn v1(base_url: &str, project_id: Option<String>, project_ids: Vec<String>) -> Result<Self> {
        let project_id = project_id.filter(|p| !p.trim().is_empty());
        let scope = match (project_id, project_ids.is_empty()) {
            (Some(_), false) => {
                return Err(RotationError::config(
                    "only one of project_id or project_ids can be set for ICA v1",
                ))
            }
            (None, true) => {
                return Err(RotationError::config(
                    "one of project_id or project_ids must be set for ICA v1",
                ))
            }
            (Some(id), true) => ProjectScope::Single(id),
            (None, false) => ProjectScope::Multi(project_ids),
        };

        Ok(Self {
            client: Client::new(),
            base_url: base_url.to_string(),
            version: IcaVersion::V1(scope),
        })
    }

    pub fn v2(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.to_string(),
            version: IcaVersion::V2,
        }
    }

    async fn token_v1(&self, api_key: &str, project_id: &str) -> Result<String> {
        let url = join_url(&self.base_url, "v1/tokens");
        debug!("Requesting ICA v1 token for project {}", project_id);

        let response = self
            .client
            .post(&url)
            .query(&[("cid", project_id)])
            .header(ACCEPT, V1_ACCEPT)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await
            .map_err(classify_transport)?;

        token_from(response, 201, "access_token").await
    }

    async fn token_v2(&self, api_key: &str) -> Result<String> {
        let url = join_url(&self.base_url, "api/tokens");
        debug!("Requesting ICA v2 token from {}", url);

        let response = self
            .client
            .post(&url)
            .header(ACCEPT, V2_ACCEPT)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await
            .map_err(classify_transport)?;

        token_from(response, 200, "token").await
    }
}

async fn token_from(response: reqwest::Response, expected: u16, attribute: &str) -> Result<String> {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(classify_transport)?;
    if status != expected {
        return Err(classify_status(status, &body));
    }

    let json: Value = serde_json::from_str(&body).map_err(|e| RotationError::ExternalAuthority {
        status,
        message: format!("token response is not JSON: {}", e),
    })?;
    json.get(attribute)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RotationError::ExternalAuthority {
            status,
            message: format!("token response has no '{}'", attribute),
        })
}

#[async_trait::async_trait]
impl CredentialAuthority for IcaAuthority {
    async fn exchange(&self, master: &SecretValue) -> Result<SecretValue> {
        let api_key = master.expose();
        let token = match &self.version {
            IcaVersion::V2 => self.token_v2(api_key).await?,
            IcaVersion::V1(ProjectScope::Single(project_id)) => {
                self.token_v1(api_key, project_id).await?
            }
            IcaVersion::V1(ProjectScope::Multi(project_ids)) => {
                let mut tokens = BTreeMap::new();
                for project_id in project_ids {
                    tokens.insert(project_id.clone(), self.token_v1(api_key, project_id).await?);
                }
                serde_json::to_string(&tokens)
                    .map_err(|e| RotationError::Store(format!("Failed to serialize tokens: {}", e)))?
            }
        };

        info!("Exchanged API key for a new {} token", self.authority_type());
        Ok(SecretValue::from(token))
    }

    fn authority_type(&self) -> &'static str {
        match self.version {
            IcaVersion::V1(_) => "ICA v1",
            IcaVersion::V2 => "ICA v2",
        }
    }
}
