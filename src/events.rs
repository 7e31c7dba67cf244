//! Rotation outcome events and their fan-out to notifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ErrorClass, Result, RotationError};
use crate::notify::Notifier;

/// Event source of Secrets Manager service events
pub const SECRETS_MANAGER_SOURCE: &str = "aws.secretsmanager";

/// Placeholder used when a service event carries no secret id
pub const UNKNOWN_SECRET: &str = "unknown:secret:arn";

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// The service event names a notifier can filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    RotationSucceeded,
    RotationFailed,
}

impl EventKind {
    pub fn all() -> Vec<EventKind> {
        vec![EventKind::RotationFailed, EventKind::RotationSucceeded]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RotationSucceeded => "RotationSucceeded",
            EventKind::RotationFailed => "RotationFailed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = RotationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RotationSucceeded" => Ok(EventKind::RotationSucceeded),
            "RotationFailed" => Ok(EventKind::RotationFailed),
            other => Err(RotationError::config(format!("unknown event kind: {}", other))),
        }
    }
}

/// Immutable outcome record of one rotation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub source: String,
    pub secret_id: String,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

impl RotationEvent {
    pub fn succeeded(secret_id: impl Into<String>) -> Self {
        Self {
            source: SECRETS_MANAGER_SOURCE.to_string(),
            secret_id: secret_id.into(),
            outcome: Outcome::Succeeded,
            timestamp: Utc::now(),
            account: None,
            error: None,
            error_class: None,
        }
    }

    pub fn failed(secret_id: impl Into<String>, error: &RotationError) -> Self {
        Self {
            source: SECRETS_MANAGER_SOURCE.to_string(),
            secret_id: secret_id.into(),
            outcome: Outcome::Failed,
            timestamp: Utc::now(),
            account: None,
            error: Some(error.to_string()),
            error_class: Some(error.class()),
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn kind(&self) -> EventKind {
        match self.outcome {
            Outcome::Succeeded => EventKind::RotationSucceeded,
            Outcome::Failed => EventKind::RotationFailed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    /// Parse an EventBridge "AWS Service Event via CloudTrail" payload
    ///
    /// Returns `Ok(None)` for Secrets Manager events that are not rotation
    /// outcomes. Events from any other source are rejected.
    pub fn from_cloudtrail(event: &Value) -> Result<Option<Self>> {
        let source = event.get("source").and_then(Value::as_str).unwrap_or_default();
        if source != SECRETS_MANAGER_SOURCE {
            return Err(RotationError::config(format!(
                "unexpected event source '{}', expected {}",
                source, SECRETS_MANAGER_SOURCE
            )));
        }

        let detail = event.get("detail").cloned().unwrap_or(Value::Null);
        let kind = match detail
            .get("eventName")
            .and_then(Value::as_str)
            .map(EventKind::from_str)
        {
            Some(Ok(kind)) => kind,
            _ => {
                debug!("Ignoring non-rotation event from {}", source);
                return Ok(None);
            }
        };

        let secret_id = detail
            .pointer("/additionalEventData/SecretId")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_SECRET)
            .to_string();
        let timestamp = event
            .get("time")
            .and_then(Value::as_str)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let error = detail
            .get("errorMessage")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Some(Self {
            source: source.to_string(),
            secret_id,
            outcome: match kind {
                EventKind::RotationSucceeded => Outcome::Succeeded,
                EventKind::RotationFailed => Outcome::Failed,
            },
            timestamp,
            account: event.get("account").and_then(Value::as_str).map(str::to_string),
            error,
            error_class: None,
        }))
    }
}

/// Which events a subscription wants to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub source: String,
    pub kinds: BTreeSet<EventKind>,
    /// Secret names or ARNs; ARNs also match events carrying the name and vice versa
    pub secret_ids: BTreeSet<String>,
}

impl EventFilter {
    pub fn new<I, S>(kinds: &[EventKind], secret_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: SECRETS_MANAGER_SOURCE.to_string(),
            kinds: kinds.iter().copied().collect(),
            secret_ids: secret_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, event: &RotationEvent) -> bool {
        event.source == self.source
            && self.kinds.contains(&event.kind())
            && self
                .secret_ids
                .iter()
                .any(|watched| same_secret(watched, &event.secret_id))
    }
}

/// Secrets Manager ARNs end in `secret:<name>-<6 chars>`
fn same_secret(watched: &str, secret_id: &str) -> bool {
    if watched == secret_id {
        return true;
    }
    let name_of = |id: &str| -> Option<String> {
        let name = id.split(":secret:").nth(1)?;
        let (base, suffix) = name.rsplit_once('-')?;
        (suffix.len() == 6).then(|| base.to_string())
    };
    match (name_of(watched), name_of(secret_id)) {
        (Some(a), Some(b)) => a == b,
        (Some(a), None) => a == secret_id,
        (None, Some(b)) => b == watched,
        (None, None) => false,
    }
}

/// Broadcast channel of rotation events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RotationEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: RotationEvent) {
        if self.sender.send(event).is_err() {
            debug!("No subscribers for rotation event");
        }
    }

    pub fn receiver(&self) -> broadcast::Receiver<RotationEvent> {
        self.sender.subscribe()
    }

    /// Forward matching events to `notifier` until the bus is dropped.
    ///
    /// Delivery is best-effort: notifier failures are logged and swallowed.
    pub fn subscribe(&self, filter: EventFilter, notifier: Arc<dyn Notifier>) -> JoinHandle<()> {
        let mut receiver = self.sender.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if !filter.matches(&event) {
                            continue;
                        }
                        if let Err(e) = notifier.notify(&event).await {
                            warn!(
                                "Failed to deliver {} for {} via {}: {}",
                                event.kind(),
                                event.secret_id,
                                notifier.channel_name(),
                                e
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("{} lagged behind, {} events dropped", notifier.channel_name(), skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
