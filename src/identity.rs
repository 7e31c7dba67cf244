//! Execution principals used as the unit of access-control granularity.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, RotationError};

/// An unforgeable reference to a compute unit or a federated caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Identity {
    /// An IAM role, usually the execution role of a rotator or collector
    Role { arn: String },
    /// Every principal of an account
    AccountRoot { account_id: String },
    /// A caller presenting a token from an OIDC provider
    Federated { provider_arn: String, subject: String },
    /// A cloud service principal such as `lambda.amazonaws.com`
    Service { name: String },
}

impl Identity {
    pub fn role(arn: impl Into<String>) -> Self {
        Identity::Role { arn: arn.into() }
    }

    pub fn account_root(account_id: impl Into<String>) -> Self {
        Identity::AccountRoot {
            account_id: account_id.into(),
        }
    }

    /// The value a policy condition sees as `aws:PrincipalArn`
    pub fn principal_arn(&self) -> String {
        match self {
            Identity::Role { arn } => arn.clone(),
            Identity::AccountRoot { account_id } => root_arn(account_id),
            Identity::Federated { provider_arn, .. } => provider_arn.clone(),
            Identity::Service { name } => name.clone(),
        }
    }

    /// The account the principal belongs to, when it can be read off the ARN
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Identity::AccountRoot { account_id } => Some(account_id),
            Identity::Role { arn } | Identity::Federated { provider_arn: arn, .. } => {
                // arn:aws:iam::<account>:role/<name>
                arn.split(':').nth(4).filter(|account| !account.is_empty())
            }
            Identity::Service { .. } => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Federated { subject, .. } => {
                write!(f, "{} ({})", self.principal_arn(), subject)
            }
            _ => f.write_str(&self.principal_arn()),
        }
    }
}

/// The ARN IAM uses for "any principal in this account"
pub fn root_arn(account_id: &str) -> String {
    format!("arn:aws:iam::{}:root", account_id)
}

/// A named execution identity whose role may not be known yet
///
/// Resolving a reference without a role is a configuration error so that
/// policy computation can never fall back to something more permissive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRef {
    pub name: String,
    pub role_arn: Option<String>,
}

impl IdentityRef {
    pub fn new(name: impl Into<String>, role_arn: Option<String>) -> Self {
        Self {
            name: name.into(),
            role_arn,
        }
    }

    pub fn resolve(&self) -> Result<Identity> {
        match self.role_arn.as_deref().map(str::trim) {
            Some(arn) if !arn.is_empty() => Ok(Identity::role(arn)),
            _ => Err(RotationError::config(format!(
                "could not get role of function {}",
                self.name
            ))),
        }
    }
}

impl From<&Identity> for IdentityRef {
    fn from(identity: &Identity) -> Self {
        Self {
            name: identity.to_string(),
            role_arn: Some(identity.principal_arn()),
        }
    }
}
