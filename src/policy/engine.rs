use serde::Serialize;
use std::fmt;
use tracing::warn;

use super::document::{
    PolicyDocument, Principal, Statement, FOR_ALL_VALUES_STRING_NOT_EQUALS, GET_SECRET_VALUE,
    PRINCIPAL_ARN_KEY,
};
use crate::error::Result;
use crate::identity::{root_arn, Identity, IdentityRef};

/// A setup that is valid but almost certainly not what the operator meant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "hazard", rename_all = "snake_case")]
pub enum PolicyHazard {
    /// The allow-list was empty so the secret cannot be read by anyone
    NoReaders { secret: String },
}

impl fmt::Display for PolicyHazard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyHazard::NoReaders { secret } => write!(
                f,
                "secret {} has no permitted readers and is unreadable by every principal",
                secret
            ),
        }
    }
}

/// The resource policy computed for one secret
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestrictionPolicy {
    pub secret: String,
    pub document: PolicyDocument,
    pub readers: Vec<Identity>,
    pub hazards: Vec<PolicyHazard>,
}

impl RestrictionPolicy {
    pub fn is_hazardous(&self) -> bool {
        !self.hazards.is_empty()
    }
}

/// Deny `GetSecretValue` to every principal of `account_id` except `readers`.
///
/// Every reference must resolve to a role before anything is produced; an
/// empty allow-list yields a document that denies everyone plus a
/// [`PolicyHazard::NoReaders`].
pub fn deny_all_except(
    secret: &str,
    account_id: &str,
    readers: &[IdentityRef],
) -> Result<RestrictionPolicy> {
    let mut resolved: Vec<Identity> = Vec::with_capacity(readers.len());
    for reader in readers {
        let identity = reader.resolve()?;
        if !resolved.contains(&identity) {
            resolved.push(identity);
        }
    }

    let mut hazards = Vec::new();
    if resolved.is_empty() {
        warn!(
            "Secret {} has an empty reader allow-list; it will be unreadable by every principal",
            secret
        );
        hazards.push(PolicyHazard::NoReaders {
            secret: secret.to_string(),
        });
    }

    let document = PolicyDocument::new(vec![deny_read_statement(account_id, &resolved)]);

    Ok(RestrictionPolicy {
        secret: secret.to_string(),
        document,
        readers: resolved,
        hazards,
    })
}

fn deny_read_statement(account_id: &str, allowed: &[Identity]) -> Statement {
    Statement::deny(&[GET_SECRET_VALUE])
        .with_sid("DenyReadExceptAllowListed")
        .with_principal(Principal::Aws(vec![root_arn(account_id)]))
        .with_resources(["*"])
        .with_condition(
            FOR_ALL_VALUES_STRING_NOT_EQUALS,
            PRINCIPAL_ARN_KEY,
            allowed.iter().map(Identity::principal_arn),
        )
}

/// The grant side: an identity policy letting `reader` read `secret_arn`
pub fn allow_read(secret_arn: &str) -> Statement {
    Statement::allow(&[GET_SECRET_VALUE]).with_resources([secret_arn])
}

/// Identity policy for a principal allowed to call `actions` on one secret
pub fn allow_actions(actions: &[&str], secret_arn: &str) -> Statement {
    Statement::allow(actions).with_resources([secret_arn])
}
