use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::Notifier;
use crate::error::{Result, RotationError};
use crate::events::RotationEvent;

/// Keeps every delivered event in memory
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<RotationEvent>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingNotifier {
    /// A notifier whose every delivery fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn events(&self) -> Vec<RotationEvent> {
        self.events.lock().await.clone()
    }

    pub async fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &RotationEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RotationError::Notification("recording channel is closed".to_string()));
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "recording"
    }
}
