//! Rotation event notifiers
//!
//! A notifier receives events that passed a subscription's
//! [`EventFilter`](crate::events::EventFilter). Delivery is best-effort.

#[cfg(any(test, feature = "test-util"))]
mod recording;
mod slack;

#[cfg(any(test, feature = "test-util"))]
pub use recording::RecordingNotifier;
pub use slack::{SlackMessage, SlackNotifier, SLACK_ICON, SLACK_USERNAME};

use tracing::{info, warn};

use crate::error::Result;
use crate::events::RotationEvent;

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &RotationEvent) -> Result<()>;

    /// Human readable channel name for logs
    fn channel_name(&self) -> &str;
}

/// Writes events to the log; used when no chat channel is configured
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &RotationEvent) -> Result<()> {
        if event.is_success() {
            info!("{} for secret {}", event.kind(), event.secret_id);
        } else {
            warn!(
                "{} for secret {}: {}",
                event.kind(),
                event.secret_id,
                event.error.as_deref().unwrap_or("no error message")
            );
        }
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}
