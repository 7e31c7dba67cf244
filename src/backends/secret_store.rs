use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::identity::Identity;
use crate::policy::PolicyDocument;
use crate::scheduler::Schedule;

/// Stage label of the version consumers read
pub const AWSCURRENT: &str = "AWSCURRENT";
/// Stage label of a version written by an in-progress rotation
pub const AWSPENDING: &str = "AWSPENDING";
/// Stage label kept on the superseded version for in-flight readers
pub const AWSPREVIOUS: &str = "AWSPREVIOUS";

/// Name and ARN of a provisioned secret
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretHandle {
    pub name: String,
    pub arn: String,
}

impl SecretHandle {
    /// A handle for a secret that has not been created yet.
    ///
    /// Secrets Manager appends a six character suffix to secret ARNs, so the
    /// ARN is a pattern usable in policy resources.
    pub fn planned(region: &str, account_id: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            arn: format!(
                "arn:aws:secretsmanager:{}:{}:secret:{}-??????",
                region, account_id, name
            ),
        }
    }

    /// Whether `secret_id` names this secret by name or ARN
    pub fn is(&self, secret_id: &str) -> bool {
        self.name == secret_id || self.arn == secret_id
    }
}

/// An opaque credential value that never shows up in logs
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Copy with surrounding whitespace removed (master keys are often pasted in)
    pub fn trimmed(&self) -> Self {
        Self(self.0.trim().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue([REDACTED])")
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which rotator owns a secret's lifecycle, and how often it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationBinding {
    pub rotator: Identity,
    /// Function the secret store invokes, where the store drives rotation itself
    pub function_arn: Option<String>,
    pub schedule: Schedule,
}

/// Metadata of a secret: versions, stage labels and rotation state
#[derive(Debug, Clone, PartialEq)]
pub struct SecretDescription {
    pub name: String,
    pub arn: String,
    pub rotation_enabled: bool,
    /// version id -> stage labels
    pub versions: BTreeMap<String, Vec<String>>,
    pub rotation: Option<RotationBinding>,
    pub has_policy: bool,
}

impl SecretDescription {
    pub fn handle(&self) -> SecretHandle {
        SecretHandle {
            name: self.name.clone(),
            arn: self.arn.clone(),
        }
    }

    pub fn stages_of(&self, version_id: &str) -> Option<&[String]> {
        self.versions.get(version_id).map(Vec::as_slice)
    }

    /// Version currently labelled `stage`
    pub fn version_with_stage(&self, stage: &str) -> Option<&str> {
        self.versions
            .iter()
            .find(|(_, stages)| stages.iter().any(|s| s == stage))
            .map(|(version, _)| version.as_str())
    }

    pub fn current_version(&self) -> Option<&str> {
        self.version_with_stage(AWSCURRENT)
    }
}

/// Trait for secret stores (AWS Secrets Manager, in-memory, ...)
///
/// Secrets are addressed by name or ARN. Reads are evaluated against the
/// secret's resource policy for `caller`; stores backed by a cloud provider
/// enforce that server-side for the process identity instead.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Create a secret, optionally with an initial current value
    async fn create(
        &self,
        name: &str,
        description: &str,
        initial_value: Option<SecretValue>,
    ) -> Result<SecretHandle>;

    /// Read the current value as `caller`
    async fn read(&self, secret_id: &str, caller: &Identity) -> Result<SecretValue>;

    /// Read a specific version and/or stage; `Ok(None)` when it has no value
    async fn read_version(
        &self,
        secret_id: &str,
        caller: &Identity,
        version_id: Option<&str>,
        stage: Option<&str>,
    ) -> Result<Option<SecretValue>>;

    /// Replace the current value out-of-band (manual master refresh)
    async fn write(&self, secret_id: &str, value: SecretValue) -> Result<()>;

    /// Store `value` as version `token` labelled `AWSPENDING`
    async fn put_pending(&self, secret_id: &str, token: &str, value: SecretValue) -> Result<()>;

    /// Atomically move `AWSCURRENT` to version `token`; the old current becomes `AWSPREVIOUS`
    async fn promote(&self, secret_id: &str, token: &str) -> Result<()>;

    async fn describe(&self, secret_id: &str) -> Result<SecretDescription>;

    /// Replace the resource policy of a secret
    async fn attach_policy(&self, secret_id: &str, policy: &PolicyDocument) -> Result<()>;

    /// Bind a rotator; a secret has at most one
    async fn bind_rotation(&self, secret_id: &str, binding: RotationBinding) -> Result<()>;

    /// Get the store type name for display purposes
    fn store_type(&self) -> &'static str;
}
