//! Reconciliation engine.
//!
//! Consumes the orchestrator event stream one event at a time. Each event
//! that names a service triggers a fresh read of that service, the derived
//! registration is diffed against what the engine last applied, and at most
//! one registry call is made.
//!
//! Events are handled strictly in arrival order, so updates for a single
//! service can never be reordered.

use std::collections::BTreeSet;
use std::sync::Arc;

use notifier_reconcile::{
    classify, extract, EngineState, EventClass, OrchestratorEvent, Registration, ServiceId,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::orchestrator::{EventStream, Orchestrator, OrchestratorError};
use crate::registry::{Registry, RegistryError};
use crate::startup::{self, StartupReport};

/// Errors that end an engine run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to list orchestrator services: {0}")]
    ListServices(#[source] OrchestratorError),

    #[error("failed to list registry entries: {0}")]
    ListRegistry(#[source] RegistryError),

    #[error("failed to subscribe to orchestrator events: {0}")]
    Subscribe(#[source] OrchestratorError),

    #[error("orchestrator event stream failed: {0}")]
    Stream(#[source] OrchestratorError),

    #[error("orchestrator event stream ended")]
    StreamEnded,
}

/// What handling one event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The event was not about a service lifecycle.
    Ignored,

    /// A registry entry was created or replaced.
    Registered,

    /// A registry entry was removed.
    Deregistered,

    /// Nothing to do; the registry already matches.
    Unchanged,

    /// A call failed; state was left as it was.
    Failed,
}

/// Reconciliation engine.
pub struct Engine {
    orchestrator: Arc<dyn Orchestrator>,
    registry: Arc<dyn Registry>,

    /// Registrations believed present in the registry, by service.
    state: EngineState,

    /// Registry entries known to be stale that startup failed to clear.
    /// Removal still deregisters these even though they are not in `state`.
    pending_deregister: BTreeSet<ServiceId>,
}

impl Engine {
    /// Create an engine with no known registrations.
    pub fn new(orchestrator: Arc<dyn Orchestrator>, registry: Arc<dyn Registry>) -> Self {
        Self {
            orchestrator,
            registry,
            state: EngineState::new(),
            pending_deregister: BTreeSet::new(),
        }
    }

    /// Registrations the engine currently tracks.
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Stale registry entries still waiting to be removed.
    pub fn pending_deregister(&self) -> &BTreeSet<ServiceId> {
        &self.pending_deregister
    }

    /// List both sides and run startup reconciliation, replacing the
    /// engine's state with the result.
    pub async fn reconcile_startup(&mut self) -> Result<StartupReport, EngineError> {
        let services = self
            .orchestrator
            .list_services()
            .await
            .map_err(EngineError::ListServices)?;
        let registered = self
            .registry
            .list_registered_services()
            .await
            .map_err(EngineError::ListRegistry)?;

        let report = startup::reconcile(&services, &registered, self.registry.as_ref()).await;
        self.state = report.state.clone();
        self.pending_deregister = report.pending_deregister.clone();
        Ok(report)
    }

    /// Consume events until shutdown, stream failure or stream end.
    ///
    /// Shutdown is only observed between events: an event being handled
    /// always runs its registry call to completion.
    pub async fn run(
        &mut self,
        mut events: EventStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        info!(tracked = self.state.len(), "Processing orchestrator events");

        loop {
            if *shutdown.borrow() {
                info!("Engine shutting down");
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Engine shutting down");
                        return Ok(());
                    }
                    continue;
                }
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    let outcome = self.handle(&event).await;
                    debug!(
                        event_type = %event.event_type,
                        action = %event.action,
                        service_id = %event.service_id,
                        outcome = ?outcome,
                        "Event handled"
                    );
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Orchestrator event stream failed");
                    return Err(EngineError::Stream(e));
                }
                None => {
                    warn!("Orchestrator event stream ended");
                    return Err(EngineError::StreamEnded);
                }
            }
        }
    }

    /// Handle a single event.
    pub async fn handle(&mut self, event: &OrchestratorEvent) -> Outcome {
        debug!(event = ?event, "Received orchestrator event");

        let class = classify(event);
        if let Some(service_id) = class.service_id() {
            info!(
                service_id = %service_id,
                event_type = %event.event_type,
                action = %event.action,
                "Service event"
            );
        }

        match class {
            EventClass::Ignored => Outcome::Ignored,
            EventClass::Removed(service_id) => self.remove(&service_id).await,
            EventClass::Changed(service_id) => self.refresh(&service_id).await,
        }
    }

    /// Re-read a service and converge its registration.
    async fn refresh(&mut self, service_id: &ServiceId) -> Outcome {
        let descriptor = match self.orchestrator.get_service(service_id).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "Failed to read service, skipping event");
                return Outcome::Failed;
            }
        };

        match descriptor.as_ref().and_then(extract) {
            Some(registration) => self.apply(registration).await,
            None => {
                if descriptor.is_none() {
                    debug!(service_id = %service_id, "Service no longer exists");
                } else {
                    debug!(service_id = %service_id, "Service is not eligible for registration");
                }
                self.remove(service_id).await
            }
        }
    }

    async fn apply(&mut self, registration: Registration) -> Outcome {
        let service_id = registration.service_id.clone();

        if self.state.get(&service_id) == Some(&registration) {
            debug!(service_id = %service_id, "Registration unchanged");
            return Outcome::Unchanged;
        }

        debug!(registration = ?registration, "Derived registration");

        match self.registry.register_service(&registration).await {
            Ok(()) => {
                info!(
                    service_id = %service_id,
                    service_name = %registration.service_name,
                    port = registration.port,
                    "Registered service"
                );
                self.pending_deregister.remove(&service_id);
                self.state.insert(service_id, registration);
                Outcome::Registered
            }
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "Failed to register service");
                Outcome::Failed
            }
        }
    }

    async fn remove(&mut self, service_id: &ServiceId) -> Outcome {
        if !self.state.contains_key(service_id) && !self.pending_deregister.contains(service_id) {
            debug!(service_id = %service_id, "Service not registered, nothing to remove");
            return Outcome::Unchanged;
        }

        match self.registry.deregister_service(service_id).await {
            Ok(()) => {
                info!(service_id = %service_id, "Deregistered service");
                self.state.remove(service_id);
                self.pending_deregister.remove(service_id);
                Outcome::Deregistered
            }
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "Failed to deregister service");
                Outcome::Failed
            }
        }
    }
}
