use aws_sdk_ssm::error::DisplayErrorContext;
use aws_sdk_ssm::types::ParameterType;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, RotationError};

/// Key/value parameters used for Slack settings and for publishing where
/// derived secrets live
#[async_trait::async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<String>;

    async fn put(&self, name: &str, value: &str) -> Result<()>;
}

/// AWS SSM Parameter Store
pub struct SsmParameterStore {
    client: aws_sdk_ssm::Client,
}

impl SsmParameterStore {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ssm::Client::new(config),
        }
    }
}

#[async_trait::async_trait]
impl ParameterStore for SsmParameterStore {
    async fn get(&self, name: &str) -> Result<String> {
        debug!("Reading SSM parameter {}", name);
        let resp = self
            .client
            .get_parameter()
            .name(name)
            .with_decryption(true)
            .send()
            .await
            .map_err(|e| {
                RotationError::Store(format!(
                    "SSM GetParameter failed for '{}': {}",
                    name,
                    DisplayErrorContext(&e)
                ))
            })?;

        resp.parameter
            .and_then(|p| p.value)
            .ok_or_else(|| RotationError::Store(format!("SSM parameter '{}' exists but has no value", name)))
    }

    async fn put(&self, name: &str, value: &str) -> Result<()> {
        self.client
            .put_parameter()
            .name(name)
            .value(value)
            .r#type(ParameterType::String)
            .overwrite(true)
            .send()
            .await
            .map_err(|e| {
                RotationError::Store(format!(
                    "SSM PutParameter failed for '{}': {}",
                    name,
                    DisplayErrorContext(&e)
                ))
            })?;
        info!("Published SSM parameter {}", name);
        Ok(())
    }
}

/// In-process parameters for local runs and tests
#[derive(Default)]
pub struct MemoryParameterStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(values: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            values: RwLock::new(values.into_iter().collect()),
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().await.clone()
    }
}

#[async_trait::async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn get(&self, name: &str) -> Result<String> {
        self.values
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RotationError::NotFound(format!("parameter {}", name)))
    }

    async fn put(&self, name: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}
