//! Rotation Scheduler
//!
//! Fires bound rotators at a fixed cadence and on demand. Every invocation
//! runs under a timeout and its outcome is published on the [`EventBus`].

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{Result, RotationError};
use crate::events::{EventBus, RotationEvent};

/// Flat string map passed verbatim to the invoked rotator
pub type Payload = BTreeMap<String, String>;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// How often a binding fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Rate(Duration),
    OnDemand,
}

impl Schedule {
    pub fn hours(hours: u64) -> Result<Self> {
        hours
            .checked_mul(HOUR)
            .map(|secs| Schedule::Rate(Duration::from_secs(secs)))
            .ok_or_else(|| RotationError::config(format!("rotation interval of {} hours is too large", hours)))
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            Schedule::Rate(interval) => Some(*interval),
            Schedule::OnDemand => None,
        }
    }

    /// Schedule expression in the form Secrets Manager rotation rules accept
    pub fn expression(&self) -> Option<String> {
        let secs = self.interval()?.as_secs();
        let expression = if secs % DAY == 0 {
            match secs / DAY {
                1 => "rate(1 day)".to_string(),
                days => format!("rate({} days)", days),
            }
        } else {
            // rotation rules only go down to hours
            match (secs / HOUR).max(1) {
                1 => "rate(1 hour)".to_string(),
                hours => format!("rate({} hours)", hours),
            }
        };
        Some(expression)
    }
}

/// Headroom an invocation needs on top of its target's minimum runtime
pub const TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Something the scheduler can invoke
#[async_trait::async_trait]
pub trait Invocable: Send + Sync {
    /// Run once; every failure must come back as a failed event.
    ///
    /// `None` means the run was an intermediate step with no outcome to report.
    async fn invoke(&self, payload: &Payload) -> Option<RotationEvent>;

    /// Secret this target maintains, one active binding each
    fn target_secret(&self) -> &str;

    /// Time a successful run spends waiting regardless of the work it does
    fn minimum_runtime(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(Uuid);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub invocation_timeout: Duration,
    /// Spread each interval by ±10 %
    pub jitter: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// Shared by the binding's loop and on-demand triggers
struct Invocation {
    target: Arc<dyn Invocable>,
    payload: Payload,
    timeout: Duration,
    bus: EventBus,
    last_attempt: Mutex<Option<DateTime<Utc>>>,
}

impl Invocation {
    async fn run(&self, payload: Option<Payload>) -> Option<RotationEvent> {
        *self.last_attempt.lock().await = Some(Utc::now());
        let payload = payload.unwrap_or_else(|| self.payload.clone());
        let secret = self.target.target_secret();

        let event = match tokio::time::timeout(self.timeout, self.target.invoke(&payload)).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("Invocation for {} finished without an outcome", secret);
                return None;
            }
            Err(_) => {
                let err = RotationError::Transient(format!(
                    "invocation for {} timed out after {}s",
                    secret,
                    self.timeout.as_secs()
                ));
                error!("{}", err);
                RotationEvent::failed(secret, &err)
            }
        };

        if event.is_success() {
            info!("Rotation of {} succeeded", secret);
        } else {
            error!(
                "Rotation of {} failed: {}",
                secret,
                event.error.as_deref().unwrap_or("unknown error")
            );
        }
        self.bus.publish(event.clone());
        Some(event)
    }
}

struct ActiveBinding {
    invocation: Arc<Invocation>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    bus: EventBus,
    bindings: Mutex<HashMap<BindingId, ActiveBinding>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            bindings: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register `target` to fire on `schedule`.
    ///
    /// `last_attempt` seeds the self-heal check: a binding that was never
    /// attempted, or not within one interval, fires right away.
    pub async fn schedule(
        &self,
        schedule: Schedule,
        target: Arc<dyn Invocable>,
        payload: Payload,
        last_attempt: Option<DateTime<Utc>>,
    ) -> Result<BindingId> {
        let secret = target.target_secret().to_string();
        let required = target.minimum_runtime().saturating_add(TIMEOUT_MARGIN);
        if self.config.invocation_timeout < required {
            return Err(RotationError::config(format!(
                "invocation timeout of {}s for {} must be at least {}s to cover its settle delay",
                self.config.invocation_timeout.as_secs(),
                secret,
                required.as_secs()
            )));
        }

        let mut bindings = self.bindings.lock().await;
        if bindings
            .values()
            .any(|b| b.invocation.target.target_secret() == secret && !b.cancel.is_cancelled())
        {
            return Err(RotationError::config(format!(
                "{} already has an active rotation binding",
                secret
            )));
        }

        let id = BindingId(Uuid::new_v4());
        let invocation = Arc::new(Invocation {
            target,
            payload,
            timeout: self.config.invocation_timeout,
            bus: self.bus.clone(),
            last_attempt: Mutex::new(last_attempt),
        });
        let cancel = self.shutdown.child_token();

        let task = match schedule {
            Schedule::Rate(interval) => {
                let delay = initial_delay(interval, last_attempt, Utc::now());
                info!(
                    "Scheduled {} every {}s, first run in {}s",
                    secret,
                    interval.as_secs(),
                    delay.as_secs()
                );
                Some(tokio::spawn(run_binding(
                    invocation.clone(),
                    interval,
                    delay,
                    self.config.jitter,
                    cancel.clone(),
                )))
            }
            Schedule::OnDemand => {
                info!("Registered {} for on-demand rotation", secret);
                None
            }
        };

        bindings.insert(
            id,
            ActiveBinding {
                invocation,
                cancel,
                task,
            },
        );
        Ok(id)
    }

    /// Invoke a binding now, optionally with a different payload
    pub async fn trigger(
        &self,
        id: BindingId,
        payload: Option<Payload>,
    ) -> Result<Option<RotationEvent>> {
        let invocation = {
            let bindings = self.bindings.lock().await;
            let binding = bindings
                .get(&id)
                .ok_or_else(|| RotationError::config(format!("unknown binding {}", id)))?;
            binding.invocation.clone()
        };
        debug!("On-demand trigger of {}", invocation.target.target_secret());
        Ok(invocation.run(payload).await)
    }

    /// Stop future firings; an invocation already running completes
    pub async fn disable(&self, id: BindingId) -> Result<()> {
        let mut bindings = self.bindings.lock().await;
        let binding = bindings
            .remove(&id)
            .ok_or_else(|| RotationError::config(format!("unknown binding {}", id)))?;
        binding.cancel.cancel();
        info!("Disabled rotation of {}", binding.invocation.target.target_secret());
        Ok(())
    }

    pub async fn last_attempt(&self, id: BindingId) -> Option<DateTime<Utc>> {
        let invocation = {
            let bindings = self.bindings.lock().await;
            bindings.get(&id)?.invocation.clone()
        };
        let last = *invocation.last_attempt.lock().await;
        last
    }

    /// Cancel every binding and wait for in-flight invocations
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut bindings = self.bindings.lock().await;
            bindings.drain().filter_map(|(_, b)| b.task).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!("Rotation task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn run_binding(
    invocation: Arc<Invocation>,
    interval: Duration,
    initial_delay: Duration,
    jitter: bool,
    cancel: CancellationToken,
) {
    let secret = invocation.target.target_secret().to_string();
    let mut next = Instant::now() + initial_delay;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Rotation loop for {} shutting down", secret);
                return;
            }
            _ = sleep_until(next) => {}
        }

        invocation.run(None).await;

        // measured from completion so a slow run delays the next tick instead of bursting
        let wait = if jitter { apply_jitter(interval) } else { interval };
        next = Instant::now() + wait;
    }
}

/// Delay before the first firing of a binding last attempted at `last_attempt`
pub fn initial_delay(
    interval: Duration,
    last_attempt: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let Some(last) = last_attempt else {
        return Duration::ZERO;
    };
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}

/// ±10 % around `base`
pub fn apply_jitter(base: Duration) -> Duration {
    let base_secs = base.as_secs_f64();
    if base_secs <= 0.0 {
        return base;
    }
    let jittered = rand::thread_rng().gen_range(base_secs * 0.9..=base_secs * 1.1);
    Duration::try_from_secs_f64(jittered).unwrap_or(base)
}
