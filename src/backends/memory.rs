use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::secret_store::{
    RotationBinding, SecretDescription, SecretHandle, SecretStore, SecretValue, AWSCURRENT,
    AWSPENDING, AWSPREVIOUS,
};
use crate::error::{Result, RotationError};
use crate::identity::Identity;
use crate::policy::{evaluate_all, PolicyDocument, Request, Statement, GET_SECRET_VALUE};

#[derive(Debug, Clone)]
struct StoredVersion {
    value: Option<SecretValue>,
    stages: Vec<String>,
}

#[derive(Debug, Clone)]
struct StoredSecret {
    handle: SecretHandle,
    versions: BTreeMap<String, StoredVersion>,
    policy: Option<PolicyDocument>,
    rotation: Option<RotationBinding>,
    value_writes: u64,
}

impl StoredSecret {
    fn has_stage(&self, version_id: &str, stage: &str) -> bool {
        self.versions
            .get(version_id)
            .map(|v| v.stages.iter().any(|s| s == stage))
            .unwrap_or(false)
    }

    fn version_with_stage(&self, stage: &str) -> Option<String> {
        self.versions
            .iter()
            .find(|(_, v)| v.stages.iter().any(|s| s == stage))
            .map(|(id, _)| id.clone())
    }

    fn set_pending(&mut self, token: &str, value: Option<SecretValue>) -> Result<()> {
        if let Some(existing) = self.versions.get(token) {
            match (&existing.value, &value) {
                // re-running a step with the same token is a no-op
                (Some(old), Some(new)) if old == new => return Ok(()),
                (Some(_), Some(_)) => {
                    return Err(RotationError::InvalidState(format!(
                        "version {} of {} already holds a different value",
                        token, self.handle.name
                    )))
                }
                (Some(_), None) => return Ok(()),
                (None, _) => {}
            }
        }

        for (id, version) in self.versions.iter_mut() {
            if id != token {
                version.stages.retain(|s| s != AWSPENDING);
            }
        }
        self.versions.retain(|_, v| !v.stages.is_empty());

        let has_value = value.is_some();
        let version = self
            .versions
            .entry(token.to_string())
            .or_insert_with(|| StoredVersion {
                value: None,
                stages: Vec::new(),
            });
        if has_value {
            version.value = value;
            self.value_writes += 1;
        }
        if !version.stages.iter().any(|s| s == AWSPENDING || s == AWSCURRENT) {
            version.stages.push(AWSPENDING.to_string());
        }
        Ok(())
    }

    /// Single critical section: readers see either the old or the new current
    fn promote(&mut self, token: &str) -> Result<()> {
        let has_value = self
            .versions
            .get(token)
            .map(|v| v.value.is_some())
            .ok_or_else(|| {
                RotationError::InvalidState(format!(
                    "version {} does not exist for {}",
                    token, self.handle.name
                ))
            })?;
        if !has_value {
            return Err(RotationError::InvalidState(format!(
                "version {} of {} has no value to promote",
                token, self.handle.name
            )));
        }
        if self.has_stage(token, AWSCURRENT) {
            return Ok(());
        }

        for (id, version) in self.versions.iter_mut() {
            version.stages.retain(|s| s != AWSPREVIOUS);
            if id == token {
                version.stages.retain(|s| s != AWSPENDING);
                version.stages.push(AWSCURRENT.to_string());
            } else if version.stages.iter().any(|s| s == AWSCURRENT) {
                version.stages.retain(|s| s != AWSCURRENT);
                version.stages.push(AWSPREVIOUS.to_string());
            }
        }
        self.versions.retain(|_, v| !v.stages.is_empty());
        Ok(())
    }

    fn describe(&self) -> SecretDescription {
        SecretDescription {
            name: self.handle.name.clone(),
            arn: self.handle.arn.clone(),
            rotation_enabled: self.rotation.is_some(),
            versions: self
                .versions
                .iter()
                .map(|(id, v)| (id.clone(), v.stages.clone()))
                .collect(),
            rotation: self.rotation.clone(),
            has_policy: self.policy.is_some(),
        }
    }
}

/// In-process secret store that enforces resource policies on every read
///
/// Used for local runs and tests. Identity-based grants are registered with
/// [`MemoryStore::grant`] and combined with each secret's resource policy the
/// same way IAM combines them.
pub struct MemoryStore {
    account_id: String,
    region: String,
    secrets: RwLock<BTreeMap<String, StoredSecret>>,
    grants: RwLock<HashMap<Identity, PolicyDocument>>,
}

impl MemoryStore {
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            secrets: RwLock::new(BTreeMap::new()),
            grants: RwLock::new(HashMap::new()),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Attach an identity-based statement to `identity`
    pub async fn grant(&self, identity: &Identity, statement: Statement) {
        let mut grants = self.grants.write().await;
        grants
            .entry(identity.clone())
            .or_default()
            .push(statement);
    }

    /// Register an empty `AWSPENDING` version, as the store does before
    /// invoking a rotation function with a client request token
    pub async fn stage_pending(&self, secret_id: &str, token: &str) -> Result<()> {
        let mut secrets = self.secrets.write().await;
        let secret = lookup_mut(&mut secrets, secret_id)?;
        secret.set_pending(token, None)
    }

    /// How many values have been written to a secret since it was created
    pub async fn value_writes(&self, secret_id: &str) -> Result<u64> {
        let secrets = self.secrets.read().await;
        Ok(lookup(&secrets, secret_id)?.value_writes)
    }

    async fn authorize(&self, secret: &StoredSecret, caller: &Identity) -> Result<()> {
        let grants = self.grants.read().await;
        let request = Request::new(caller, GET_SECRET_VALUE, &secret.handle.arn);
        let documents = grants.get(caller).into_iter().chain(secret.policy.as_ref());

        if evaluate_all(documents, &request).is_allowed() {
            Ok(())
        } else {
            debug!("Denied {} on {} for {}", GET_SECRET_VALUE, secret.handle.name, caller);
            Err(RotationError::access_denied(
                caller,
                GET_SECRET_VALUE,
                secret.handle.name.clone(),
            ))
        }
    }

    fn new_arn(&self, name: &str) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        format!(
            "arn:aws:secretsmanager:{}:{}:secret:{}-{}",
            self.region, self.account_id, name, suffix
        )
    }
}

fn lookup<'a>(secrets: &'a BTreeMap<String, StoredSecret>, secret_id: &str) -> Result<&'a StoredSecret> {
    secrets
        .get(secret_id)
        .or_else(|| secrets.values().find(|s| s.handle.arn == secret_id))
        .ok_or_else(|| RotationError::NotFound(secret_id.to_string()))
}

fn lookup_mut<'a>(
    secrets: &'a mut BTreeMap<String, StoredSecret>,
    secret_id: &str,
) -> Result<&'a mut StoredSecret> {
    let name = lookup(secrets, secret_id)?.handle.name.clone();
    secrets
        .get_mut(&name)
        .ok_or_else(|| RotationError::NotFound(secret_id.to_string()))
}

#[async_trait::async_trait]
impl SecretStore for MemoryStore {
    async fn create(
        &self,
        name: &str,
        description: &str,
        initial_value: Option<SecretValue>,
    ) -> Result<SecretHandle> {
        let mut secrets = self.secrets.write().await;
        if secrets.contains_key(name) {
            return Err(RotationError::config(format!("secret {} already exists", name)));
        }

        let handle = SecretHandle {
            name: name.to_string(),
            arn: self.new_arn(name),
        };
        let mut secret = StoredSecret {
            handle: handle.clone(),
            versions: BTreeMap::new(),
            policy: None,
            rotation: None,
            value_writes: 0,
        };
        if let Some(value) = initial_value {
            let version = uuid::Uuid::new_v4().to_string();
            secret.set_pending(&version, Some(value))?;
            secret.promote(&version)?;
        }
        secrets.insert(name.to_string(), secret);

        info!("Created secret {} in memory store ({})", name, description);
        Ok(handle)
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
        let secrets = self.secrets.read().await;
        let secret = lookup(&secrets, secret_id)?;
        self.authorize(secret, caller).await?;

        let version_id = match (version_id, stage) {
            (Some(version), Some(stage)) if !secret.has_stage(version, stage) => return Ok(None),
            (Some(version), _) => version.to_string(),
            (None, Some(stage)) => match secret.version_with_stage(stage) {
                Some(version) => version,
                None => return Ok(None),
            },
            (None, None) => match secret.version_with_stage(AWSCURRENT) {
                Some(version) => version,
                None => return Ok(None),
            },
        };

        Ok(secret
            .versions
            .get(&version_id)
            .and_then(|v| v.value.clone()))
    }

    async fn write(&self, secret_id: &str, value: SecretValue) -> Result<()> {
        let mut secrets = self.secrets.write().await;
        let secret = lookup_mut(&mut secrets, secret_id)?;
        let version = uuid::Uuid::new_v4().to_string();
        secret.set_pending(&version, Some(value))?;
        secret.promote(&version)?;
        info!("Replaced current value of {}", secret.handle.name);
        Ok(())
    }

    async fn put_pending(&self, secret_id: &str, token: &str, value: SecretValue) -> Result<()> {
        let mut secrets = self.secrets.write().await;
        let secret = lookup_mut(&mut secrets, secret_id)?;
        secret.set_pending(token, Some(value))?;
        debug!("Stored pending version {} of {}", token, secret.handle.name);
        Ok(())
    }

    async fn promote(&self, secret_id: &str, token: &str) -> Result<()> {
        let mut secrets = self.secrets.write().await;
        let secret = lookup_mut(&mut secrets, secret_id)?;
        secret.promote(token)?;
        debug!("Promoted version {} of {} to {}", token, secret.handle.name, AWSCURRENT);
        Ok(())
    }

    async fn describe(&self, secret_id: &str) -> Result<SecretDescription> {
        let secrets = self.secrets.read().await;
        Ok(lookup(&secrets, secret_id)?.describe())
    }

    async fn attach_policy(&self, secret_id: &str, policy: &PolicyDocument) -> Result<()> {
        let mut secrets = self.secrets.write().await;
        let secret = lookup_mut(&mut secrets, secret_id)?;
        secret.policy = Some(policy.clone());
        info!("Attached resource policy to {}", secret.handle.name);
        Ok(())
    }

    async fn bind_rotation(&self, secret_id: &str, binding: RotationBinding) -> Result<()> {
        let mut secrets = self.secrets.write().await;
        let secret = lookup_mut(&mut secrets, secret_id)?;
        if let Some(existing) = &secret.rotation {
            if existing.rotator != binding.rotator {
                return Err(RotationError::config(format!(
                    "{} is already bound to rotator {}",
                    secret.handle.name, existing.rotator
                )));
            }
        }
        info!("Bound rotator {} to {}", binding.rotator, secret.handle.name);
        secret.rotation = Some(binding);
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "in-memory"
    }
}
