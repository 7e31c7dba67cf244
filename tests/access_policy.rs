//! Deny-all-except resource policies enforced by the in-memory store.

use std::collections::BTreeMap;

use credential_rotator::backends::{MemoryStore, SecretHandle, SecretStore, SecretValue};
use credential_rotator::federation::github_actions_grant;
use credential_rotator::identity::{Identity, IdentityRef};
use credential_rotator::policy::{
    allow_read, deny_all_except, PolicyDocument, PolicyHazard, Principal, Statement, GET_SECRET_VALUE,
};
use credential_rotator::RotationError;

const ACCOUNT: &str = "111122223333";

fn role(name: &str) -> Identity {
    Identity::role(format!("arn:aws:iam::{}:role/{}", ACCOUNT, name))
}

async fn secret_with_value(store: &MemoryStore) -> SecretHandle {
    store
        .create("Jwt", "derived token", Some(SecretValue::from("token")))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_account_wide_grant_does_not_bypass_allow_list() {
    let store = MemoryStore::new(ACCOUNT, "ap-southeast-2");
    let secret = secret_with_value(&store).await;
    let reader = role("reader");
    let admin = role("admin");

    let policy = deny_all_except(&secret.name, ACCOUNT, &[IdentityRef::from(&reader)]).unwrap();
    assert!(!policy.is_hazardous());
    store.attach_policy(&secret.arn, &policy.document).await.unwrap();

    store.grant(&reader, allow_read(&secret.arn)).await;
    store
        .grant(&admin, Statement::allow(&[GET_SECRET_VALUE, "secretsmanager:*"]).with_resources(["*"]))
        .await;

    assert_eq!(store.read("Jwt", &reader).await.unwrap().expose(), "token");
    assert!(matches!(
        store.read("Jwt", &admin).await.unwrap_err(),
        RotationError::AccessDenied { .. }
    ));
}

#[tokio::test]
async fn test_allow_list_alone_grants_nothing() {
    let store = MemoryStore::new(ACCOUNT, "ap-southeast-2");
    let secret = secret_with_value(&store).await;
    let reader = role("reader");

    let policy = deny_all_except(&secret.name, ACCOUNT, &[IdentityRef::from(&reader)]).unwrap();
    store.attach_policy(&secret.arn, &policy.document).await.unwrap();

    // not denied, but nothing allows it either
    assert!(store.read("Jwt", &reader).await.is_err());
}

#[tokio::test]
async fn test_empty_allow_list_locks_everyone_out() {
    let store = MemoryStore::new(ACCOUNT, "ap-southeast-2");
    let secret = secret_with_value(&store).await;
    let reader = role("reader");

    let policy = deny_all_except(&secret.name, ACCOUNT, &[]).unwrap();
    assert_eq!(
        policy.hazards,
        vec![PolicyHazard::NoReaders {
            secret: "Jwt".to_string()
        }]
    );
    store.attach_policy(&secret.arn, &policy.document).await.unwrap();
    store.grant(&reader, allow_read(&secret.arn)).await;

    assert!(store.read("Jwt", &reader).await.is_err());
}

#[test]
fn test_unresolved_reader_fails_fast() {
    let readers = [IdentityRef::new("jwt-collector", None)];
    let err = deny_all_except("Jwt", ACCOUNT, &readers).unwrap_err();
    assert!(matches!(err, RotationError::Config(_)));
}

#[tokio::test]
async fn test_federated_role_reads_only_its_secret() {
    let store = MemoryStore::new(ACCOUNT, "ap-southeast-2");
    let secret = secret_with_value(&store).await;
    let other = store
        .create("Other", "unrelated", Some(SecretValue::from("other")))
        .await
        .unwrap();

    assert!(github_actions_grant(ACCOUNT, &secret, &[], Some("gh-jwt")).unwrap().is_none());

    let grant = github_actions_grant(
        ACCOUNT,
        &secret,
        &["repo:umccr/infrastructure:*".to_string()],
        Some("gh-jwt"),
    )
    .unwrap()
    .unwrap();
    let federated = grant.identity();

    let policy = deny_all_except(&secret.name, ACCOUNT, &[IdentityRef::from(&federated)]).unwrap();
    store.attach_policy(&secret.arn, &policy.document).await.unwrap();
    for statement in &grant.permission_policy.statement {
        store.grant(&federated, statement.clone()).await;
    }

    assert_eq!(store.read("Jwt", &federated).await.unwrap().expose(), "token");
    assert!(store.read(&other.arn, &federated).await.is_err());

    let mut claims = BTreeMap::new();
    claims.insert("aud".to_string(), "sts.amazonaws.com".to_string());
    claims.insert(
        "sub".to_string(),
        "repo:umccr/infrastructure:ref:refs/heads/main".to_string(),
    );
    assert!(grant.permits(&claims));
    claims.insert("sub".to_string(), "repo:someone/else:ref:refs/heads/main".to_string());
    assert!(!grant.permits(&claims));
}

fn deny_reads_of(pattern: &str) -> PolicyDocument {
    PolicyDocument::new(vec![Statement::deny(&[GET_SECRET_VALUE])
        .with_principal(Principal::Aws(vec!["*".to_string()]))
        .with_resources([pattern])])
}

#[tokio::test]
async fn test_wildcard_deny_resources_hold() {
    let store = MemoryStore::new(ACCOUNT, "ap-southeast-2");
    let secret = secret_with_value(&store).await;
    let nested = store
        .create("team/ica/Jwt", "nested", Some(SecretValue::from("nested")))
        .await
        .unwrap();
    let other = store
        .create("Other", "unrelated", Some(SecretValue::from("other")))
        .await
        .unwrap();
    let reader = role("reader");
    store.grant(&reader, allow_read("*")).await;

    // runs of `*` and names containing `/` must not make a deny fall through
    store
        .attach_policy(&secret.arn, &deny_reads_of("arn:aws:secretsmanager:*:*:secret:Jw**"))
        .await
        .unwrap();
    store
        .attach_policy(&nested.arn, &deny_reads_of("arn:aws:secretsmanager:*:*:secret:team/**"))
        .await
        .unwrap();
    store
        .attach_policy(&other.arn, &deny_reads_of("arn:aws:secretsmanager:*:*:secret:team/**"))
        .await
        .unwrap();

    assert!(matches!(
        store.read("Jwt", &reader).await.unwrap_err(),
        RotationError::AccessDenied { .. }
    ));
    assert!(matches!(
        store.read("team/ica/Jwt", &reader).await.unwrap_err(),
        RotationError::AccessDenied { .. }
    ));
    assert_eq!(store.read("Other", &reader).await.unwrap().expose(), "other");
}
