//! Token collector: hands out the derived token while it is still valid,
//! rotates it otherwise.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backends::{SecretValue, Store};
use crate::error::{Result, RotationError};
use crate::events::{EventBus, RotationEvent};
use crate::identity::Identity;
use crate::jwt;
use crate::policy::{PolicyDocument, Request, Statement, ROTATE_SECRET};
use crate::rotation::Rotator;

#[derive(Debug, Clone, PartialEq)]
pub enum Collected {
    /// The current token, valid for longer than the expiry buffer
    Token(SecretValue),
    /// The token was missing or about to expire and a rotation was run;
    /// callers should collect again
    RotationTriggered(RotationEvent),
}

impl Collected {
    pub fn token(&self) -> Option<&SecretValue> {
        match self {
            Collected::Token(token) => Some(token),
            Collected::RotationTriggered(_) => None,
        }
    }
}

pub struct Collector {
    identity: Identity,
    store: Store,
    rotator: Arc<Rotator>,
    /// Identity-side policy; must allow `RotateSecret` on the derived secret
    grants: PolicyDocument,
    bus: Option<EventBus>,
}

impl Collector {
    pub fn new(identity: Identity, store: Store, rotator: Arc<Rotator>) -> Self {
        Self {
            identity,
            store,
            rotator,
            grants: PolicyDocument::new(Vec::new()),
            bus: None,
        }
    }

    pub fn with_grants(mut self, statements: Vec<Statement>) -> Self {
        self.grants = PolicyDocument::new(statements);
        self
    }

    /// Publish the outcome of triggered rotations
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn collect(&self) -> Result<Collected> {
        let secret = self.rotator.derived_secret();
        let current = match self.store.read(secret, &self.identity).await {
            Ok(value) => Some(value),
            Err(RotationError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if let Some(token) = current {
            if jwt::is_valid(token.expose(), Utc::now()) {
                return Ok(Collected::Token(token));
            }
            warn!("Token in {} is expired or about to expire", secret);
        } else {
            warn!("{} has no current token", secret);
        }

        let arn = self.store.describe(secret).await?.arn;
        if !self
            .grants
            .evaluate(&Request::new(&self.identity, ROTATE_SECRET, &arn))
            .is_allowed()
        {
            return Err(RotationError::access_denied(&self.identity, ROTATE_SECRET, secret));
        }

        info!("Triggering rotation of {}", secret);
        let event = self.rotator.rotate().await;
        if let Some(bus) = &self.bus {
            bus.publish(event.clone());
        }
        Ok(Collected::RotationTriggered(event))
    }
}
