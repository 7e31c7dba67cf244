use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{DatabricksTarget, TargetInstance, TargetType};
use crate::backends::{ParameterStore, Store};
use crate::error::{Result, RotationError};
use crate::events::RotationEvent;
use crate::identity::Identity;
use crate::scheduler::{Invocable, Payload};

/// Payload key: secret whose current value is copied
pub const SOURCE_SECRET_KEY: &str = "ORCABUS_TOKEN_SECRETS_MANAGER_ARN";
/// Payload key: secret holding the target's access token
pub const TARGET_TOKEN_KEY: &str = "DATABRICKS_SERVICE_USER_TOKEN_SECRETS_MANAGER_ARN";
/// Payload key: parameter holding the target's host
pub const TARGET_HOST_KEY: &str = "DATABRICKS_HOST_SSM_PARAMETER_NAME";

/// Copies a derived secret into a sync target on every invocation
///
/// Everything that varies per run comes from the payload, so the same job
/// can be scheduled with different secrets.
pub struct SyncJob {
    name: String,
    identity: Identity,
    store: Store,
    params: Arc<dyn ParameterStore>,
    target_type: TargetType,
    scope: String,
    key: String,
    timeout: Duration,
}

impl SyncJob {
    pub fn new(
        name: impl Into<String>,
        identity: Identity,
        store: Store,
        params: Arc<dyn ParameterStore>,
        target_type: TargetType,
        scope: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            identity,
            store,
            params,
            target_type,
            scope: scope.into(),
            key: key.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The payload a scheduled run of this job expects
    pub fn payload(source_secret: &str, token_secret: &str, host_parameter: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert(SOURCE_SECRET_KEY.to_string(), source_secret.to_string());
        payload.insert(TARGET_TOKEN_KEY.to_string(), token_secret.to_string());
        payload.insert(TARGET_HOST_KEY.to_string(), host_parameter.to_string());
        payload
    }

    async fn build_target(&self, payload: &Payload) -> Result<TargetInstance> {
        let token_secret = required(payload, TARGET_TOKEN_KEY)?;
        let host_parameter = required(payload, TARGET_HOST_KEY)?;

        let token = self.store.read(token_secret, &self.identity).await?;
        let host = self.params.get(host_parameter).await?;

        match self.target_type {
            TargetType::Databricks => Ok(Box::new(DatabricksTarget::new(&host, token, self.timeout)?)),
        }
    }

    pub async fn run(&self, payload: &Payload) -> Result<()> {
        let source_secret = required(payload, SOURCE_SECRET_KEY)?;
        let target = self.build_target(payload).await?;

        debug!("Copying {} to {} {}/{}", source_secret, target.target_type(), self.scope, self.key);
        let value = self.store.read(source_secret, &self.identity).await?;
        target.put_secret(&self.scope, &self.key, &value).await?;

        info!("Synced {} to {}", source_secret, target.target_type());
        Ok(())
    }
}

fn required<'a>(payload: &'a Payload, key: &str) -> Result<&'a str> {
    payload
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RotationError::config(format!("payload is missing {}", key)))
}

#[async_trait::async_trait]
impl Invocable for SyncJob {
    async fn invoke(&self, payload: &Payload) -> Option<RotationEvent> {
        let event = match self.run(payload).await {
            Ok(()) => RotationEvent::succeeded(&self.name),
            Err(e) => {
                warn!("Sync job {} failed: {}", self.name, e);
                RotationEvent::failed(&self.name, &e)
            }
        };
        Some(event)
    }

    fn target_secret(&self) -> &str {
        &self.name
    }
}
