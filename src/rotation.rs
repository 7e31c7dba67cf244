use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authority::Authority;
use crate::backends::{SecretDescription, SecretValue, Store, AWSCURRENT, AWSPENDING};
use crate::error::{Result, RotationError};
use crate::events::RotationEvent;
use crate::identity::Identity;
use crate::scheduler::{Invocable, Payload};

pub const SECRET_ID_KEY: &str = "SecretId";
pub const TOKEN_KEY: &str = "ClientRequestToken";
pub const STEP_KEY: &str = "Step";

/// One step of the four-step rotation protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RotationStep {
    CreateSecret,
    SetSecret,
    TestSecret,
    FinishSecret,
}

impl fmt::Display for RotationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationStep::CreateSecret => "createSecret",
            RotationStep::SetSecret => "setSecret",
            RotationStep::TestSecret => "testSecret",
            RotationStep::FinishSecret => "finishSecret",
        };
        f.write_str(name)
    }
}

impl FromStr for RotationStep {
    type Err = RotationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "createSecret" => Ok(RotationStep::CreateSecret),
            "setSecret" => Ok(RotationStep::SetSecret),
            "testSecret" => Ok(RotationStep::TestSecret),
            "finishSecret" => Ok(RotationStep::FinishSecret),
            other => Err(RotationError::InvalidState(format!(
                "invalid step parameter: {}",
                other
            ))),
        }
    }
}

/// A rotation step event as the secret store sends it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepRequest {
    pub secret_id: String,
    pub client_request_token: String,
    pub step: RotationStep,
}

impl StepRequest {
    /// `Ok(None)` when the payload is not a step event
    pub fn from_payload(payload: &Payload) -> Result<Option<Self>> {
        let Some(step) = payload.get(STEP_KEY) else {
            return Ok(None);
        };
        let field = |key: &str| {
            payload
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| RotationError::config(format!("step event is missing {}", key)))
        };

        Ok(Some(Self {
            secret_id: field(SECRET_ID_KEY)?,
            client_request_token: field(TOKEN_KEY)?,
            step: step.parse()?,
        }))
    }
}

/// What one step of a store-driven rotation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step ran and the rotation is still in progress
    Completed,
    /// The version was already current; nothing was done
    AlreadyCurrent,
    /// `finishSecret` made the pending version current
    Promoted,
}

/// Validate that `token` is a rotation in progress for the described secret.
///
/// Returns `true` when the token is already current and there is nothing
/// left to do.
pub fn check_rotation_state(description: &SecretDescription, token: &str) -> Result<bool> {
    if !description.rotation_enabled {
        return Err(RotationError::InvalidState(format!(
            "secret {} is not enabled for rotation",
            description.name
        )));
    }

    let stages = description.stages_of(token).ok_or_else(|| {
        RotationError::InvalidState(format!(
            "secret version {} has no stage for rotation of secret {}",
            token, description.name
        ))
    })?;

    if stages.iter().any(|s| s == AWSCURRENT) {
        return Ok(true);
    }
    if !stages.iter().any(|s| s == AWSPENDING) {
        return Err(RotationError::InvalidState(format!(
            "secret version {} not set as {} for rotation of secret {}",
            token, AWSPENDING, description.name
        )));
    }
    Ok(false)
}

/// Exchanges a master secret for a derived credential and rotates it into
/// the derived secret
pub struct Rotator {
    name: String,
    identity: Identity,
    store: Store,
    master_secret: String,
    derived_secret: String,
    authority: Authority,
    settle_delay: Duration,
    account: Option<String>,
}

impl Rotator {
    pub fn new(
        name: impl Into<String>,
        identity: Identity,
        store: Store,
        master_secret: impl Into<String>,
        derived_secret: impl Into<String>,
        authority: Authority,
    ) -> Self {
        Self {
            name: name.into(),
            identity,
            store,
            master_secret: master_secret.into(),
            derived_secret: derived_secret.into(),
            authority,
            settle_delay: Duration::ZERO,
            account: None,
        }
    }

    /// Wait after storing a new value so the authority's `nbf` is in the past
    /// before the value can become current
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn master_secret(&self) -> &str {
        &self.master_secret
    }

    pub fn derived_secret(&self) -> &str {
        &self.derived_secret
    }

    /// Current master value, trimmed
    pub async fn master_value(&self) -> Result<SecretValue> {
        let value = self
            .store
            .read(&self.master_secret, &self.identity)
            .await?
            .trimmed();
        if value.is_empty() {
            return Err(RotationError::config(format!(
                "master secret {} is empty",
                self.master_secret
            )));
        }
        Ok(value)
    }

    /// Run one step of a rotation driven by the secret store
    pub async fn handle_step(&self, request: &StepRequest) -> Result<StepOutcome> {
        let secret_id = request.secret_id.as_str();
        let token = request.client_request_token.as_str();
        info!(
            "Starting step '{}' of secret '{}' and version '{}'",
            request.step, secret_id, token
        );

        let description = self.store.describe(secret_id).await?;
        if !description.handle().is(&self.derived_secret) {
            return Err(RotationError::config(format!(
                "rotator {} only rotates {}, not {}",
                self.name, self.derived_secret, description.name
            )));
        }

        if check_rotation_state(&description, token)? {
            info!(
                "Skipped step '{}' of secret '{}' and version '{}' because it is already current",
                request.step, secret_id, token
            );
            return Ok(StepOutcome::AlreadyCurrent);
        }

        let outcome = match request.step {
            RotationStep::CreateSecret => {
                self.create_step(secret_id, token).await?;
                StepOutcome::Completed
            }
            RotationStep::SetSecret => StepOutcome::Completed,
            RotationStep::TestSecret => {
                self.test_step(secret_id, token).await?;
                StepOutcome::Completed
            }
            RotationStep::FinishSecret => {
                self.store.promote(secret_id, token).await?;
                StepOutcome::Promoted
            }
        };

        info!(
            "Successfully finished step '{}' of secret '{}' and version '{}'",
            request.step, secret_id, token
        );
        Ok(outcome)
    }

    /// Rotate now without the store driving the steps
    pub async fn rotate(&self) -> RotationEvent {
        let token = Uuid::new_v4().to_string();
        debug!("Rotating {} with version {}", self.derived_secret, token);
        let result = self.rotate_with_token(&token).await;
        self.event(result)
    }

    async fn rotate_with_token(&self, token: &str) -> Result<()> {
        self.create_step(&self.derived_secret, token).await?;
        self.test_step(&self.derived_secret, token).await?;
        self.store.promote(&self.derived_secret, token).await
    }

    async fn create_step(&self, secret_id: &str, token: &str) -> Result<()> {
        let pending = self
            .store
            .read_version(secret_id, &self.identity, Some(token), Some(AWSPENDING))
            .await?;
        if pending.is_some() {
            debug!("Version {} of {} already has a value", token, secret_id);
            return Ok(());
        }

        let master = self.master_value().await?;
        let derived = self.authority.exchange(&master).await?;
        self.store.put_pending(secret_id, token, derived).await?;
        info!(
            "Stored new {} credential as {} version {}",
            self.authority.authority_type(),
            AWSPENDING,
            token
        );

        if !self.settle_delay.is_zero() {
            debug!("Waiting {}s before the new value may be promoted", self.settle_delay.as_secs());
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(())
    }

    async fn test_step(&self, secret_id: &str, token: &str) -> Result<()> {
        let pending = self
            .store
            .read_version(secret_id, &self.identity, Some(token), Some(AWSPENDING))
            .await?;
        match pending {
            Some(value) if !value.is_empty() => Ok(()),
            _ => Err(RotationError::InvalidState(format!(
                "version {} of {} has no pending value",
                token, secret_id
            ))),
        }
    }

    fn event(&self, result: Result<()>) -> RotationEvent {
        let event = match result {
            Ok(()) => RotationEvent::succeeded(&self.derived_secret),
            Err(e) => {
                warn!("Rotation of {} by {} failed: {}", self.derived_secret, self.name, e);
                RotationEvent::failed(&self.derived_secret, &e)
            }
        };
        match &self.account {
            Some(account) => event.with_account(account),
            None => event,
        }
    }
}

#[async_trait::async_trait]
impl Invocable for Rotator {
    /// Only a promoting `finishSecret` or a full rotation reports success;
    /// a failure at any step is reported
    async fn invoke(&self, payload: &Payload) -> Option<RotationEvent> {
        match StepRequest::from_payload(payload) {
            Ok(Some(request)) => match self.handle_step(&request).await {
                Ok(StepOutcome::Promoted) => Some(self.event(Ok(()))),
                Ok(outcome) => {
                    debug!("Step {} of {} ended as {:?}", request.step, request.secret_id, outcome);
                    None
                }
                Err(e) => Some(self.event(Err(e))),
            },
            Ok(None) => Some(self.rotate().await),
            Err(e) => Some(self.event(Err(e))),
        }
    }

    fn target_secret(&self) -> &str {
        &self.derived_secret
    }

    fn minimum_runtime(&self) -> Duration {
        self.settle_delay
    }
}
