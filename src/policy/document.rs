use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identity::{root_arn, Identity};

pub const POLICY_VERSION: &str = "2012-10-17";

pub const GET_SECRET_VALUE: &str = "secretsmanager:GetSecretValue";
pub const ROTATE_SECRET: &str = "secretsmanager:RotateSecret";
pub const ASSUME_ROLE_WITH_WEB_IDENTITY: &str = "sts:AssumeRoleWithWebIdentity";

/// Condition key carrying the caller's principal ARN
pub const PRINCIPAL_ARN_KEY: &str = "aws:PrincipalArn";

pub const STRING_EQUALS: &str = "StringEquals";
pub const STRING_NOT_EQUALS: &str = "StringNotEquals";
pub const STRING_LIKE: &str = "StringLike";
pub const FOR_ALL_VALUES_STRING_NOT_EQUALS: &str = "ForAllValues:StringNotEquals";

/// operator -> condition key -> accepted values
pub type Conditions = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    #[serde(rename = "AWS")]
    Aws(Vec<String>),
    Federated(String),
    Service(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    pub action: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: Conditions,
}

impl Statement {
    pub fn allow(actions: &[&str]) -> Self {
        Self::new(Effect::Allow, actions)
    }

    pub fn deny(actions: &[&str]) -> Self {
        Self::new(Effect::Deny, actions)
    }

    fn new(effect: Effect, actions: &[&str]) -> Self {
        Self {
            sid: None,
            effect,
            principal: None,
            action: actions.iter().map(|a| a.to_string()).collect(),
            resource: Vec::new(),
            condition: Conditions::new(),
        }
    }

    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition<I, S>(mut self, operator: &str, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.condition
            .entry(operator.to_string())
            .or_default()
            .insert(key.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Whether this statement applies to the request, ignoring its effect
    pub fn applies_to(&self, request: &Request<'_>) -> bool {
        self.matches_principal(request.principal)
            && self.matches_action(request.action)
            && self.matches_resource(request.resource)
            && self.conditions_hold(request)
    }

    fn matches_principal(&self, identity: &Identity) -> bool {
        match &self.principal {
            // identity-based statements are attached to the caller already
            None => true,
            Some(Principal::Aws(principals)) => principals.iter().any(|p| {
                if p == "*" || *p == identity.principal_arn() {
                    return true;
                }
                // an account root principal stands for every principal of that account
                identity
                    .account_id()
                    .map(|account| *p == root_arn(account) || p == account)
                    .unwrap_or(false)
            }),
            Some(Principal::Federated(provider)) => {
                matches!(identity, Identity::Federated { provider_arn, .. } if provider_arn == provider)
            }
            Some(Principal::Service(service)) => {
                matches!(identity, Identity::Service { name } if name == service)
            }
        }
    }

    fn matches_action(&self, action: &str) -> bool {
        // IAM action names are case-insensitive
        let action = action.to_ascii_lowercase();
        self.action
            .iter()
            .any(|pattern| wildcard_match(&pattern.to_ascii_lowercase(), &action))
    }

    fn matches_resource(&self, resource: &str) -> bool {
        self.resource.is_empty() || self.resource.iter().any(|p| wildcard_match(p, resource))
    }

    fn conditions_hold(&self, request: &Request<'_>) -> bool {
        self.condition.iter().all(|(operator, keys)| {
            keys.iter().all(|(key, expected)| {
                let actual = request.context_values(key);
                evaluate_condition(operator, &actual, expected)
            })
        })
    }
}

/// Unknown operators never hold, so a statement using one never applies
fn evaluate_condition(operator: &str, actual: &[String], expected: &[String]) -> bool {
    match operator {
        STRING_EQUALS => actual.iter().any(|a| expected.contains(a)),
        STRING_NOT_EQUALS => actual.iter().all(|a| !expected.contains(a)),
        STRING_LIKE => actual
            .iter()
            .any(|a| expected.iter().any(|pattern| wildcard_match(pattern, a))),
        FOR_ALL_VALUES_STRING_NOT_EQUALS => actual.iter().all(|a| !expected.contains(a)),
        _ => false,
    }
}

/// IAM-style wildcard matching: `*` is any run of characters, `?` is one.
/// `/` is an ordinary character and runs of `*` behave like a single `*`.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    // last `*` seen and the value position it is currently absorbing up to
    let mut star: Option<(usize, usize)> = None;

    while v < value.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, v));
                p += 1;
            }
            Some(&c) if c == '?' || c == value[v] => {
                p += 1;
                v += 1;
            }
            _ => match star {
                Some((star_p, star_v)) => {
                    p = star_p + 1;
                    v = star_v + 1;
                    star = Some((star_p, star_v + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// An authorization question put to one or more policy documents
#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub principal: &'a Identity,
    pub action: &'a str,
    pub resource: &'a str,
    /// Extra condition keys, e.g. federated token claims
    pub context: BTreeMap<String, String>,
}

impl<'a> Request<'a> {
    pub fn new(principal: &'a Identity, action: &'a str, resource: &'a str) -> Self {
        Self {
            principal,
            action,
            resource,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }

    fn context_values(&self, key: &str) -> Vec<String> {
        if key == PRINCIPAL_ARN_KEY {
            return vec![self.principal.principal_arn()];
        }
        self.context.get(key).cloned().into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    ExplicitDeny,
    ImplicitDeny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statement: Vec<Statement>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement: Vec::new(),
        }
    }
}

impl PolicyDocument {
    pub fn new(statement: Vec<Statement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statement,
        }
    }

    pub fn push(&mut self, statement: Statement) {
        self.statement.push(statement);
    }

    pub fn evaluate(&self, request: &Request<'_>) -> Decision {
        evaluate_all([self], request)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Combine resource and identity policies: an explicit deny anywhere wins,
/// then any allow, otherwise the request is implicitly denied.
pub fn evaluate_all<'d, I>(documents: I, request: &Request<'_>) -> Decision
where
    I: IntoIterator<Item = &'d PolicyDocument>,
{
    let mut allowed = false;
    for statement in documents.into_iter().flat_map(|d| d.statement.iter()) {
        if !statement.applies_to(request) {
            continue;
        }
        match statement.effect {
            Effect::Deny => return Decision::ExplicitDeny,
            Effect::Allow => allowed = true,
        }
    }
    if allowed {
        Decision::Allow
    } else {
        Decision::ImplicitDeny
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_ARN: &str = "arn:aws:secretsmanager:ap-southeast-2:111122223333:secret:Master-AbCdEf";

    #[test]
    fn test_statement_serialization() {
        let statement = Statement::deny(&[GET_SECRET_VALUE])
            .with_principal(Principal::Aws(vec![root_arn("111122223333")]))
            .with_resources(["*"])
            .with_condition(
                FOR_ALL_VALUES_STRING_NOT_EQUALS,
                PRINCIPAL_ARN_KEY,
                ["arn:aws:iam::111122223333:role/producer"],
            );
        let json = serde_json::to_value(PolicyDocument::new(vec![statement])).unwrap();

        assert_eq!(json["Version"], "2012-10-17");
        let st = &json["Statement"][0];
        assert_eq!(st["Effect"], "Deny");
        assert_eq!(st["Action"][0], "secretsmanager:GetSecretValue");
        assert_eq!(st["Principal"]["AWS"][0], "arn:aws:iam::111122223333:root");
        assert_eq!(
            st["Condition"]["ForAllValues:StringNotEquals"]["aws:PrincipalArn"][0],
            "arn:aws:iam::111122223333:role/producer"
        );
        assert!(st.get("Sid").is_none());
    }

    #[test]
    fn test_document_parses_iam_json() {
        let raw = r#"{
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "ReadJwt",
                "Effect": "Allow",
                "Principal": {"Federated": "arn:aws:iam::1:oidc-provider/token.actions.githubusercontent.com"},
                "Action": ["sts:AssumeRoleWithWebIdentity"]
            }]
        }"#;
        let doc: PolicyDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.statement[0].sid.as_deref(), Some("ReadJwt"));
        assert_eq!(
            doc.statement[0].principal,
            Some(Principal::Federated(
                "arn:aws:iam::1:oidc-provider/token.actions.githubusercontent.com".to_string()
            ))
        );
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("repo:umccr/*:*", "repo:umccr/infrastructure:ref:refs/heads/main"));
        assert!(wildcard_match("secret:Master-??????", "secret:Master-AbCdEf"));
        assert!(!wildcard_match("secret:Master-??????", "secret:Master-AbC"));
        assert!(!wildcard_match("repo:umccr/x:*", "repo:other/x:main"));
        // brackets are literal in IAM patterns
        assert!(wildcard_match("repo:[org]/*", "repo:[org]/x"));
    }

    #[test]
    fn test_wildcard_runs_and_separators() {
        assert!(wildcard_match("**", "anything/at/all"));
        assert!(wildcard_match("secret:Master**", "secret:Master-AbCdEf"));
        assert!(wildcard_match("arn:aws:secretsmanager:*:*:secret:*", "arn:aws:secretsmanager:ap-southeast-2:1:secret:a/b/c-AbCdEf"));
        assert!(wildcard_match("repo:umccr/*", "repo:umccr/infra/sub:ref:refs/heads/main"));
        assert!(wildcard_match("a*b*c", "aXXbYYbZc"));
        assert!(!wildcard_match("a*b*c", "aXXbYY"));
        assert!(!wildcard_match("**x", "abc"));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "a"));
        assert!(wildcard_match("*", ""));
    }

    #[test]
    fn test_action_matching_is_case_insensitive() {
        let doc = PolicyDocument::new(vec![
            Statement::allow(&["secretsManager:GetSecretValue"]).with_resources([SECRET_ARN])
        ]);
        let caller = Identity::role("arn:aws:iam::111122223333:role/reader");
        let request = Request::new(&caller, GET_SECRET_VALUE, SECRET_ARN);
        assert_eq!(doc.evaluate(&request), Decision::Allow);
    }

    #[test]
    fn test_account_root_principal_covers_account_roles() {
        let doc = PolicyDocument::new(vec![Statement::allow(&[GET_SECRET_VALUE])
            .with_principal(Principal::Aws(vec![root_arn("111122223333")]))
            .with_resources(["*"])]);

        let same_account = Identity::role("arn:aws:iam::111122223333:role/reader");
        let other_account = Identity::role("arn:aws:iam::999988887777:role/reader");

        assert!(doc
            .evaluate(&Request::new(&same_account, GET_SECRET_VALUE, SECRET_ARN))
            .is_allowed());
        assert_eq!(
            doc.evaluate(&Request::new(&other_account, GET_SECRET_VALUE, SECRET_ARN)),
            Decision::ImplicitDeny
        );
    }

    #[test]
    fn test_explicit_deny_wins_across_documents() {
        let identity_policy = PolicyDocument::new(vec![
            Statement::allow(&["secretsmanager:*"]).with_resources(["*"])
        ]);
        let resource_policy = PolicyDocument::new(vec![Statement::deny(&[GET_SECRET_VALUE])
            .with_principal(Principal::Aws(vec!["*".to_string()]))
            .with_resources(["*"])]);
        let caller = Identity::role("arn:aws:iam::111122223333:role/admin");
        let request = Request::new(&caller, GET_SECRET_VALUE, SECRET_ARN);

        assert_eq!(identity_policy.evaluate(&request), Decision::Allow);
        assert_eq!(
            evaluate_all([&identity_policy, &resource_policy], &request),
            Decision::ExplicitDeny
        );
    }

    #[test]
    fn test_deny_with_double_star_resource_still_denies() {
        let allow_everything = PolicyDocument::new(vec![
            Statement::allow(&["secretsmanager:*"]).with_resources(["*"])
        ]);
        let deny = PolicyDocument::new(vec![Statement::deny(&[GET_SECRET_VALUE])
            .with_principal(Principal::Aws(vec!["*".to_string()]))
            .with_resources(["arn:aws:secretsmanager:*:*:secret:**"])]);
        let caller = Identity::role("arn:aws:iam::111122223333:role/admin");
        let request = Request::new(&caller, GET_SECRET_VALUE, SECRET_ARN);

        assert_eq!(deny.evaluate(&request), Decision::ExplicitDeny);
        assert_eq!(
            evaluate_all([&allow_everything, &deny], &request),
            Decision::ExplicitDeny
        );
    }

    #[test]
    fn test_conditions() {
        let statement = Statement::allow(&[ASSUME_ROLE_WITH_WEB_IDENTITY])
            .with_condition(STRING_EQUALS, "idp:aud", ["sts.amazonaws.com"])
            .with_condition(STRING_LIKE, "idp:sub", ["repo:umccr/*"]);
        let doc = PolicyDocument::new(vec![statement]);
        let caller = Identity::Federated {
            provider_arn: "arn:aws:iam::1:oidc-provider/idp".to_string(),
            subject: "repo:umccr/x".to_string(),
        };

        let mut claims = BTreeMap::new();
        claims.insert("idp:aud".to_string(), "sts.amazonaws.com".to_string());
        claims.insert("idp:sub".to_string(), "repo:umccr/x".to_string());
        let request = Request::new(&caller, ASSUME_ROLE_WITH_WEB_IDENTITY, "*").with_context(claims.clone());
        assert!(doc.evaluate(&request).is_allowed());

        // a missing claim fails StringEquals
        claims.remove("idp:aud");
        let request = Request::new(&caller, ASSUME_ROLE_WITH_WEB_IDENTITY, "*").with_context(claims);
        assert_eq!(doc.evaluate(&request), Decision::ImplicitDeny);
    }

    #[test]
    fn test_unknown_operator_never_applies() {
        let doc = PolicyDocument::new(vec![Statement::allow(&[GET_SECRET_VALUE])
            .with_condition("NumericLessThan", "aws:MultiFactorAuthAge", ["3600"])]);
        let caller = Identity::role("arn:aws:iam::1:role/r");
        assert_eq!(
            doc.evaluate(&Request::new(&caller, GET_SECRET_VALUE, SECRET_ARN)),
            Decision::ImplicitDeny
        );
    }
}
