//! End-to-end rotation against the in-memory store and a mocked authority.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use credential_rotator::backends::{MemoryStore, SecretStore, SecretValue};
use credential_rotator::config::{AccountConfig, AuthorityConfig, IntegrationConfig};
use credential_rotator::events::{EventBus, EventKind};
use credential_rotator::identity::Identity;
use credential_rotator::integration::{Integration, ProvisionedIntegration};
use credential_rotator::notify::RecordingNotifier;
use credential_rotator::rotation::{RotationStep, SECRET_ID_KEY, STEP_KEY, TOKEN_KEY};
use credential_rotator::scheduler::{Invocable, Payload, Schedule, Scheduler, SchedulerConfig};
use credential_rotator::{ErrorClass, RotationError};

const ACCOUNT: &str = "843407916570";
const ROTATOR: &str = "arn:aws:iam::843407916570:role/icav2-jwt-producer";
const CONSUMER: &str = "arn:aws:iam::843407916570:role/workflow-runner";

fn account() -> AccountConfig {
    AccountConfig {
        id: ACCOUNT.to_string(),
        region: "ap-southeast-2".to_string(),
        aliases: BTreeMap::new(),
    }
}

fn integration_config(base_url: &str) -> IntegrationConfig {
    IntegrationConfig {
        name: "icav2".to_string(),
        master_secret: "ICAv2ApiKey".to_string(),
        derived_secret: "ICAv2Jwt".to_string(),
        rotation_interval_hours: 0,
        rotator_role_arn: Some(ROTATOR.to_string()),
        rotator_function_arn: None,
        collector_role_arn: None,
        consumer_role_arns: vec![CONSUMER.to_string()],
        notify_on: EventKind::all(),
        settle_delay_seconds: Some(0),
        ssm_root: None,
        authority: AuthorityConfig::IcaV2 {
            base_url: base_url.to_string(),
        },
        github: None,
    }
}

async fn provision(base_url: &str) -> (Arc<MemoryStore>, Integration, ProvisionedIntegration) {
    let store = Arc::new(MemoryStore::new(ACCOUNT, "ap-southeast-2"));
    let integration =
        Integration::build(store.clone(), None, &account(), &integration_config(base_url)).unwrap();
    let provisioned = integration.provision().await.unwrap();
    for (identity, statement) in &provisioned.plan.grants {
        store.grant(identity, statement.clone()).await;
    }
    store
        .write(&provisioned.master.arn, SecretValue::from("M"))
        .await
        .unwrap();
    (store, integration, provisioned)
}

async fn token_mock(server: &mut mockito::Server, token: &str) -> mockito::Mock {
    server
        .mock("POST", "/api/tokens")
        .match_header("x-api-key", "M")
        .with_status(200)
        .with_body(format!(r#"{{"token":"{}"}}"#, token))
        .create_async()
        .await
}

async fn wait_for_events(notifier: &RecordingNotifier, count: usize) {
    for _ in 0..100 {
        if notifier.attempts().await >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_rotation_writes_derived_for_consumers_only() {
    let mut server = mockito::Server::new_async().await;
    let mock = token_mock(&mut server, "T1").await;
    let (store, integration, _) = provision(&server.url()).await;

    let event = integration.rotator().rotate().await;
    assert!(event.is_success(), "{:?}", event.error);
    mock.assert_async().await;

    let rotator = Identity::role(ROTATOR);
    let consumer = Identity::role(CONSUMER);
    assert_eq!(store.read("ICAv2Jwt", &rotator).await.unwrap().expose(), "T1");
    assert_eq!(store.read("ICAv2Jwt", &consumer).await.unwrap().expose(), "T1");

    // the consumer may not see the master, nobody else sees either secret
    assert!(matches!(
        store.read("ICAv2ApiKey", &consumer).await.unwrap_err(),
        RotationError::AccessDenied { .. }
    ));
    let stranger = Identity::role("arn:aws:iam::843407916570:role/stranger");
    store
        .grant(&stranger, credential_rotator::policy::allow_read("*"))
        .await;
    assert!(store.read("ICAv2Jwt", &stranger).await.is_err());
    assert!(store.read("ICAv2ApiKey", &stranger).await.is_err());
}

#[tokio::test]
async fn test_rotating_twice_keeps_secret_readable() {
    let mut server = mockito::Server::new_async().await;
    let first = token_mock(&mut server, "T1").await;
    let (store, integration, _) = provision(&server.url()).await;
    let rotator = integration.rotator();
    let reader = Identity::role(CONSUMER);

    assert!(rotator.rotate().await.is_success());
    assert_eq!(store.read("ICAv2Jwt", &reader).await.unwrap().expose(), "T1");
    assert_eq!(store.value_writes("ICAv2Jwt").await.unwrap(), 1);
    first.remove_async().await;

    let _second = token_mock(&mut server, "T2").await;
    assert!(rotator.rotate().await.is_success());
    assert_eq!(store.read("ICAv2Jwt", &reader).await.unwrap().expose(), "T2");
    assert_eq!(store.value_writes("ICAv2Jwt").await.unwrap(), 2);

    let description = store.describe("ICAv2Jwt").await.unwrap();
    let previous = description
        .version_with_stage(credential_rotator::backends::AWSPREVIOUS)
        .unwrap()
        .to_string();
    let old = store
        .read_version("ICAv2Jwt", &reader, Some(&previous), None)
        .await
        .unwrap();
    assert_eq!(old.unwrap().expose(), "T1");
}

#[tokio::test]
async fn test_authority_rejection_is_notified_and_leaves_derived_unchanged() {
    let mut server = mockito::Server::new_async().await;
    let ok = token_mock(&mut server, "T1").await;
    let (store, integration, _) = provision(&server.url()).await;
    assert!(integration.rotator().rotate().await.is_success());
    ok.remove_async().await;

    let _rejected = server
        .mock("POST", "/api/tokens")
        .with_status(401)
        .with_body(r#"{"message":"invalid api key"}"#)
        .create_async()
        .await;

    let bus = EventBus::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let _subscription = bus.subscribe(integration.filter(), notifier.clone());
    let scheduler = Scheduler::new(SchedulerConfig::default(), bus.clone());
    let target: Arc<dyn Invocable> = Arc::new(integration.rotator());
    let binding = scheduler
        .schedule(Schedule::OnDemand, target, Payload::new(), None)
        .await
        .unwrap();

    let event = scheduler.trigger(binding, None).await.unwrap().unwrap();
    assert!(!event.is_success());
    assert_eq!(event.error_class, Some(ErrorClass::ExternalAuthority));

    wait_for_events(&notifier, 1).await;
    let seen = notifier.events().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind(), EventKind::RotationFailed);
    assert_eq!(seen[0].secret_id, "ICAv2Jwt");

    let reader = Identity::role(CONSUMER);
    assert_eq!(store.read("ICAv2Jwt", &reader).await.unwrap().expose(), "T1");
    assert_eq!(store.value_writes("ICAv2Jwt").await.unwrap(), 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_authority_is_transient() {
    let (store, integration, _) = provision("http://127.0.0.1:1").await;
    let event = integration.rotator().rotate().await;
    assert_eq!(event.error_class, Some(ErrorClass::Transient));
    assert_eq!(store.value_writes("ICAv2Jwt").await.unwrap(), 0);
}

#[tokio::test]
async fn test_notifier_sees_only_watched_kinds() {
    let mut server = mockito::Server::new_async().await;
    let _mock = token_mock(&mut server, "T1").await;
    let store = Arc::new(MemoryStore::new(ACCOUNT, "ap-southeast-2"));
    let mut config = integration_config(&server.url());
    config.notify_on = vec![EventKind::RotationFailed];
    let integration = Integration::build(store, None, &account(), &config).unwrap();

    let bus = EventBus::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let _subscription = bus.subscribe(integration.filter(), notifier.clone());

    bus.publish(credential_rotator::events::RotationEvent::succeeded("ICAv2Jwt"));
    bus.publish(credential_rotator::events::RotationEvent::failed(
        "ICAv2Jwt",
        &RotationError::Transient("timeout".to_string()),
    ));

    wait_for_events(&notifier, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let seen = notifier.events().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind(), EventKind::RotationFailed);
}

fn step_payload(token: &str, step: RotationStep) -> Payload {
    let mut payload = Payload::new();
    payload.insert(SECRET_ID_KEY.to_string(), "ICAv2Jwt".to_string());
    payload.insert(TOKEN_KEY.to_string(), token.to_string());
    payload.insert(STEP_KEY.to_string(), step.to_string());
    payload
}

#[tokio::test]
async fn test_store_driven_steps_publish_one_success() {
    let mut server = mockito::Server::new_async().await;
    let _mock = token_mock(&mut server, "T1").await;
    let (store, integration, _) = provision(&server.url()).await;
    store.stage_pending("ICAv2Jwt", "v-1").await.unwrap();

    let bus = EventBus::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let _subscription = bus.subscribe(integration.filter(), notifier.clone());
    let scheduler = Scheduler::new(SchedulerConfig::default(), bus.clone());
    let target: Arc<dyn Invocable> = Arc::new(integration.rotator());
    let binding = scheduler
        .schedule(Schedule::OnDemand, target, Payload::new(), None)
        .await
        .unwrap();

    for step in [
        RotationStep::CreateSecret,
        RotationStep::SetSecret,
        RotationStep::TestSecret,
    ] {
        let event = scheduler
            .trigger(binding, Some(step_payload("v-1", step)))
            .await
            .unwrap();
        assert!(event.is_none(), "{} reported {:?}", step, event);
    }
    let finished = scheduler
        .trigger(binding, Some(step_payload("v-1", RotationStep::FinishSecret)))
        .await
        .unwrap()
        .unwrap();
    assert!(finished.is_success(), "{:?}", finished.error);

    wait_for_events(&notifier, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let seen = notifier.events().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind(), EventKind::RotationSucceeded);

    let reader = Identity::role(CONSUMER);
    assert_eq!(store.read("ICAv2Jwt", &reader).await.unwrap().expose(), "T1");
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_timeout_shorter_than_settle_delay_is_rejected() {
    let store = Arc::new(MemoryStore::new(ACCOUNT, "ap-southeast-2"));
    let mut config = integration_config("http://127.0.0.1:1");
    config.settle_delay_seconds = Some(30);
    let integration = Integration::build(store, None, &account(), &config).unwrap();

    let short = SchedulerConfig {
        invocation_timeout: Duration::from_secs(30),
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(short, EventBus::new());
    let target: Arc<dyn Invocable> = Arc::new(integration.rotator());
    let err = scheduler
        .schedule(Schedule::OnDemand, target.clone(), Payload::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Config);

    let scheduler = Scheduler::new(SchedulerConfig::default(), EventBus::new());
    assert!(scheduler
        .schedule(Schedule::OnDemand, target, Payload::new(), None)
        .await
        .is_ok());
    scheduler.shutdown().await;
}
