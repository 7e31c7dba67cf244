use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_secretsmanager::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_secretsmanager::types::RotationRulesType;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::secret_store::{
    RotationBinding, SecretDescription, SecretHandle, SecretStore, SecretValue, AWSCURRENT,
    AWSPENDING,
};
use crate::error::{Result, RotationError};
use crate::identity::Identity;
use crate::policy::PolicyDocument;
use crate::scheduler::Schedule;

/// Load the shared AWS configuration for `region`, falling back to
/// `AWS_REGION` and then `us-east-1`
pub async fn load_sdk_config(region: Option<String>) -> SdkConfig {
    let region_str = region.unwrap_or_else(|| {
        std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string())
    });

    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region_str))
        .load()
        .await
}

/// The identity the process runs as, from STS `GetCallerIdentity`
pub async fn caller_identity(config: &SdkConfig) -> Result<Identity> {
    let sts = aws_sdk_sts::Client::new(config);
    let response = sts.get_caller_identity().send().await.map_err(|e| {
        RotationError::Transient(format!(
            "Failed to get caller identity: {}",
            DisplayErrorContext(&e)
        ))
    })?;

    let arn = response
        .arn()
        .ok_or_else(|| RotationError::Store("STS returned no caller ARN".to_string()))?;
    Ok(Identity::role(role_arn_from_assumed(arn)))
}

/// `arn:aws:sts::<acct>:assumed-role/<role>/<session>` -> `arn:aws:iam::<acct>:role/<role>`
///
/// Resource policy conditions on `aws:PrincipalArn` compare against the role ARN.
pub fn role_arn_from_assumed(arn: &str) -> String {
    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    if parts.len() == 6 && parts[2] == "sts" {
        if let Some(rest) = parts[5].strip_prefix("assumed-role/") {
            let role = rest.split('/').next().unwrap_or(rest);
            return format!("arn:{}:iam::{}:role/{}", parts[1], parts[4], role);
        }
    }
    arn.to_string()
}

/// AWS Secrets Manager store
///
/// Policy evaluation happens server-side against the credentials the client
/// was built with, so the `caller` of a read is only used for diagnostics.
pub struct AwsSecretsStore {
    client: SecretsManagerClient,
}

impl AwsSecretsStore {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: SecretsManagerClient::new(config),
        }
    }

    pub fn from_client(client: SecretsManagerClient) -> Self {
        Self { client }
    }
}

fn classify<E, R>(err: SdkError<E, R>, action: &str, secret_id: &str, caller: Option<&Identity>) -> RotationError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    if matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return RotationError::Transient(format!(
            "{} on {} failed: {}",
            action,
            secret_id,
            DisplayErrorContext(&err)
        ));
    }

    let message = format!("{} on {} failed: {}", action, secret_id, DisplayErrorContext(&err));
    match err.code() {
        Some("AccessDeniedException") => RotationError::access_denied(
            caller
                .map(ToString::to_string)
                .unwrap_or_else(|| "current credentials".to_string()),
            action,
            secret_id,
        ),
        Some("ResourceNotFoundException") => RotationError::NotFound(secret_id.to_string()),
        Some("ResourceExistsException") | Some("InvalidRequestException") => {
            RotationError::InvalidState(message)
        }
        Some("ThrottlingException") | Some("InternalServiceError") => {
            RotationError::Transient(message)
        }
        _ => RotationError::Store(message),
    }
}

fn to_versions(stages: Option<&HashMap<String, Vec<String>>>) -> BTreeMap<String, Vec<String>> {
    stages
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl SecretStore for AwsSecretsStore {
    async fn create(
        &self,
        name: &str,
        description: &str,
        initial_value: Option<SecretValue>,
    ) -> Result<SecretHandle> {
        debug!("Creating secret in AWS Secrets Manager: {}", name);

        let response = self
            .client
            .create_secret()
            .name(name)
            .description(description)
            .set_secret_string(initial_value.map(|v| v.expose().to_string()))
            .send()
            .await
            .map_err(|e| classify(e, "secretsmanager:CreateSecret", name, None))?;

        let arn = response
            .arn()
            .ok_or_else(|| RotationError::Store(format!("CreateSecret returned no ARN for {}", name)))?;
        info!("Successfully created secret '{}' in AWS Secrets Manager", name);

        Ok(SecretHandle {
            name: name.to_string(),
            arn: arn.to_string(),
        })
    }

    async fn read(&self, secret_id: &str, caller: &Identity) -> Result<SecretValue> {
        self.read_version(secret_id, caller, None, Some(AWSCURRENT))
            .await?
            .ok_or_else(|| RotationError::NotFound(format!("{} has no current value", secret_id)))
    }

    async fn read_version(
        &self,
        secret_id: &str,
        caller: &Identity,
        version_id: Option<&str>,
        stage: Option<&str>,
    ) -> Result<Option<SecretValue>> {
        debug!("Reading secret from AWS Secrets Manager: {} as {}", secret_id, caller);

        let result = self
            .client
            .get_secret_value()
            .secret_id(secret_id)
            .set_version_id(version_id.map(str::to_string))
            .set_version_stage(stage.map(str::to_string))
            .send()
            .await;

        match result {
            Ok(response) => Ok(response.secret_string().map(SecretValue::from)),
            // a staged version without a value yet is reported as not found
            Err(e) if version_id.is_some() && e.code() == Some("ResourceNotFoundException") => {
                Ok(None)
            }
            Err(e) => Err(classify(e, crate::policy::GET_SECRET_VALUE, secret_id, Some(caller))),
        }
    }

    async fn write(&self, secret_id: &str, value: SecretValue) -> Result<()> {
        self.client
            .put_secret_value()
            .secret_id(secret_id)
            .secret_string(value.expose())
            .send()
            .await
            .map_err(|e| classify(e, "secretsmanager:PutSecretValue", secret_id, None))?;

        info!("Successfully updated secret '{}' in AWS Secrets Manager", secret_id);
        Ok(())
    }

    async fn put_pending(&self, secret_id: &str, token: &str, value: SecretValue) -> Result<()> {
        self.client
            .put_secret_value()
            .secret_id(secret_id)
            .client_request_token(token)
            .secret_string(value.expose())
            .version_stages(AWSPENDING)
            .send()
            .await
            .map_err(|e| classify(e, "secretsmanager:PutSecretValue", secret_id, None))?;

        debug!("Stored pending version {} of {}", token, secret_id);
        Ok(())
    }

    async fn promote(&self, secret_id: &str, token: &str) -> Result<()> {
        let description = self.describe(secret_id).await?;
        let current = description.current_version().map(str::to_string);
        if current.as_deref() == Some(token) {
            debug!("Version {} of {} is already {}", token, secret_id, AWSCURRENT);
            return Ok(());
        }

        self.client
            .update_secret_version_stage()
            .secret_id(secret_id)
            .version_stage(AWSCURRENT)
            .move_to_version_id(token)
            .set_remove_from_version_id(current)
            .send()
            .await
            .map_err(|e| classify(e, "secretsmanager:UpdateSecretVersionStage", secret_id, None))?;

        info!("Promoted version {} of {} to {}", token, secret_id, AWSCURRENT);
        Ok(())
    }

    async fn describe(&self, secret_id: &str) -> Result<SecretDescription> {
        let response = self
            .client
            .describe_secret()
            .secret_id(secret_id)
            .send()
            .await
            .map_err(|e| classify(e, "secretsmanager:DescribeSecret", secret_id, None))?;

        Ok(SecretDescription {
            name: response.name().unwrap_or(secret_id).to_string(),
            arn: response.arn().unwrap_or(secret_id).to_string(),
            rotation_enabled: response.rotation_enabled().unwrap_or(false),
            versions: to_versions(response.version_ids_to_stages()),
            // the rotator is the execution role of the rotation function, which
            // DescribeSecret does not report
            rotation: None,
            has_policy: false,
        })
    }

    async fn attach_policy(&self, secret_id: &str, policy: &PolicyDocument) -> Result<()> {
        let document = policy
            .to_json_pretty()
            .map_err(|e| RotationError::Store(format!("Failed to serialize policy: {}", e)))?;

        self.client
            .put_resource_policy()
            .secret_id(secret_id)
            .resource_policy(document)
            .block_public_policy(true)
            .send()
            .await
            .map_err(|e| classify(e, "secretsmanager:PutResourcePolicy", secret_id, None))?;

        info!("Attached resource policy to {}", secret_id);
        Ok(())
    }

    async fn bind_rotation(&self, secret_id: &str, binding: RotationBinding) -> Result<()> {
        let function_arn = binding.function_arn.as_deref().ok_or_else(|| {
            RotationError::config(format!(
                "rotation of {} needs a function ARN for rotator {}",
                secret_id, binding.rotator
            ))
        })?;

        let rules = match binding.schedule.expression() {
            Some(expression) => Some(
                RotationRulesType::builder()
                    .schedule_expression(expression)
                    .build(),
            ),
            None => {
                warn!("{} is rotated on demand only", secret_id);
                None
            }
        };

        self.client
            .rotate_secret()
            .secret_id(secret_id)
            .rotation_lambda_arn(function_arn)
            .set_rotation_rules(rules)
            .rotate_immediately(false)
            .send()
            .await
            .map_err(|e| classify(e, "secretsmanager:RotateSecret", secret_id, None))?;

        info!(
            "Bound {} to rotation function {} ({})",
            secret_id,
            function_arn,
            match binding.schedule {
                Schedule::Rate(_) => "scheduled",
                Schedule::OnDemand => "on demand",
            }
        );
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "AWS Secrets Manager"
    }
}
