//! Subscription lifecycle.
//!
//! The supervisor owns the order of operations: subscribe, reconcile at
//! startup, then hand the stream to a fresh engine. When the stream is lost
//! it either gives up (leaving restarts to the process supervisor) or, with
//! resync enabled, backs off, re-subscribes and reconciles again, since
//! events may have been missed while disconnected.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::{Engine, EngineError};
use crate::orchestrator::Orchestrator;
use crate::registry::Registry;

/// Delay between resubscription attempts.
///
/// Doubles from `base` up to `max`, then spreads each delay by up to
/// `jitter` of its length in either direction.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,

    /// Fraction of the delay, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry following `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        let nominal = self.base.saturating_mul(factor).min(self.max);

        let spread = nominal.as_secs_f64() * self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return nominal;
        }
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((nominal.as_secs_f64() + offset).max(0.0))
    }
}

/// Consecutive failure count for one supervisor run.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
}

impl Backoff {
    fn next_delay(&mut self, policy: &BackoffPolicy) -> Duration {
        let delay = policy.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// Re-subscribe and reconcile again when the event stream is lost.
    pub resync_on_disconnect: bool,

    /// Delay between resync attempts.
    pub backoff: BackoffPolicy,
}

/// Drives startup reconciliation and the engine across subscriptions.
pub struct Supervisor {
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<dyn Registry>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        registry: Arc<dyn Registry>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            config,
        }
    }

    /// Run until shutdown, or until the stream is lost with resync disabled.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let mut backoff = Backoff::default();

        loop {
            let error = match self.run_subscription(&shutdown, &mut backoff).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !self.config.resync_on_disconnect {
                return Err(error);
            }

            let delay = backoff.next_delay(&self.config.backoff);
            warn!(
                error = %error,
                failures = backoff.failures,
                delay_ms = delay.as_millis() as u64,
                "Lost orchestrator events, resynchronising after backoff"
            );

            if !sleep_unless_shutdown(delay, shutdown.clone()).await {
                info!("Shutdown requested during backoff");
                return Ok(());
            }
        }
    }

    /// One subscription: subscribe, reconcile, consume.
    ///
    /// The subscription is opened before listing so that nothing happening
    /// during the startup sweep is lost; those events are applied after it.
    async fn run_subscription(
        &self,
        shutdown: &watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<(), EngineError> {
        let events = self
            .orchestrator
            .stream_events()
            .await
            .map_err(EngineError::Subscribe)?;

        let mut engine = Engine::new(Arc::clone(&self.orchestrator), Arc::clone(&self.registry));
        engine.reconcile_startup().await?;
        backoff.reset();

        engine.run(events, shutdown.clone()).await
    }
}

/// Sleep for `delay`. Returns false if shutdown was requested first.
async fn sleep_unless_shutdown(delay: Duration, mut shutdown: watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
