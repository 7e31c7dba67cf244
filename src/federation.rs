//! Federated read access for GitHub Actions workflows.
//!
//! A workflow presenting a GitHub OIDC token whose `sub` matches one of the
//! configured patterns may assume a role that can read exactly one secret.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::backends::SecretHandle;
use crate::error::{Result, RotationError};
use crate::identity::Identity;
use crate::policy::{
    PolicyDocument, Principal, Request, Statement, ASSUME_ROLE_WITH_WEB_IDENTITY,
    GET_SECRET_VALUE, STRING_EQUALS, STRING_LIKE,
};

pub const GITHUB_OIDC_HOST: &str = "token.actions.githubusercontent.com";
pub const GITHUB_AUDIENCE: &str = "sts.amazonaws.com";

/// A role external callers can assume with a federated token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FederatedGrant {
    pub role_name: String,
    pub role_arn: String,
    pub provider_arn: String,
    pub subject_patterns: Vec<String>,
    pub secret_arn: String,
    pub trust_policy: PolicyDocument,
    pub permission_policy: PolicyDocument,
}

pub fn github_provider_arn(account_id: &str) -> String {
    format!("arn:aws:iam::{}:oidc-provider/{}", account_id, GITHUB_OIDC_HOST)
}

/// Grant GitHub workflows from `repos` (e.g. `repo:umccr/infrastructure:*`)
/// read access to `secret`.
///
/// No patterns means no grant. Patterns without a role name are a
/// configuration error.
pub fn github_actions_grant(
    account_id: &str,
    secret: &SecretHandle,
    repos: &[String],
    role_name: Option<&str>,
) -> Result<Option<FederatedGrant>> {
    let patterns: Vec<String> = repos
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    if patterns.is_empty() {
        return Ok(None);
    }

    let role_name = role_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            RotationError::config(format!(
                "github repos are set for {} but no role name was given",
                secret.name
            ))
        })?;

    let provider_arn = github_provider_arn(account_id);
    let trust_policy = PolicyDocument::new(vec![Statement::allow(&[ASSUME_ROLE_WITH_WEB_IDENTITY])
        .with_principal(Principal::Federated(provider_arn.clone()))
        .with_condition(STRING_EQUALS, &claim_key("aud"), [GITHUB_AUDIENCE])
        .with_condition(STRING_LIKE, &claim_key("sub"), patterns.iter().cloned())]);
    let permission_policy = PolicyDocument::new(vec![
        Statement::allow(&[GET_SECRET_VALUE]).with_resources([secret.arn.as_str()])
    ]);

    Ok(Some(FederatedGrant {
        role_name: role_name.to_string(),
        role_arn: format!("arn:aws:iam::{}:role/{}", account_id, role_name),
        provider_arn,
        subject_patterns: patterns,
        secret_arn: secret.arn.clone(),
        trust_policy,
        permission_policy,
    }))
}

fn claim_key(claim: &str) -> String {
    format!("{}:{}", GITHUB_OIDC_HOST, claim)
}

impl FederatedGrant {
    /// The principal a successful assume-role yields; it goes on the
    /// secret's reader allow-list
    pub fn identity(&self) -> Identity {
        Identity::role(&self.role_arn)
    }

    /// Whether a token with these claims may assume the role
    pub fn permits(&self, claims: &BTreeMap<String, String>) -> bool {
        let caller = Identity::Federated {
            provider_arn: self.provider_arn.clone(),
            subject: claims.get("sub").cloned().unwrap_or_default(),
        };
        let context = claims
            .iter()
            .map(|(claim, value)| (claim_key(claim), value.clone()))
            .collect();
        let request = Request::new(&caller, ASSUME_ROLE_WITH_WEB_IDENTITY, &self.role_arn)
            .with_context(context);
        self.trust_policy.evaluate(&request).is_allowed()
    }

    /// Whether the assumed role's permissions cover reading `secret_arn`
    pub fn can_read(&self, secret_arn: &str) -> bool {
        let identity = self.identity();
        let request = Request::new(&identity, GET_SECRET_VALUE, secret_arn);
        self.permission_policy.evaluate(&request).is_allowed()
    }
}
