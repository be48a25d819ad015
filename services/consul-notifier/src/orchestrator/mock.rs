//! In-memory orchestrator for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use notifier_reconcile::{OrchestratorEvent, ServiceDescriptor, ServiceId};

use super::{EventStream, Orchestrator, OrchestratorError};

type EventBatch = Vec<Result<OrchestratorEvent, OrchestratorError>>;

/// Mock orchestrator.
///
/// Each call to `stream_events` hands out the next scripted batch as a
/// finite stream. `get_service` serves queued snapshots first (one per call,
/// the last one sticks), then the current service table.
#[derive(Default)]
pub struct MockOrchestrator {
    services: Mutex<BTreeMap<ServiceId, ServiceDescriptor>>,
    snapshots: Mutex<BTreeMap<ServiceId, VecDeque<ServiceDescriptor>>>,
    subscriptions: Mutex<VecDeque<EventBatch>>,
    failing_reads: Mutex<BTreeSet<ServiceId>>,
    get_calls: Mutex<Vec<ServiceId>>,
}

impl MockOrchestrator {
    /// Create an empty mock orchestrator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock orchestrator with the given services defined.
    pub fn with_services(services: impl IntoIterator<Item = ServiceDescriptor>) -> Self {
        let mock = Self::new();
        for service in services {
            mock.upsert_service(service);
        }
        mock
    }

    /// Define or redefine a service.
    pub fn upsert_service(&self, service: ServiceDescriptor) {
        self.lock_services().insert(service.id.clone(), service);
    }

    /// Delete a service.
    pub fn remove_service(&self, service_id: &ServiceId) {
        self.lock_services().remove(service_id);
    }

    /// Queue snapshots returned by successive `get_service` calls.
    pub fn script_snapshots(
        &self,
        service_id: impl Into<ServiceId>,
        snapshots: impl IntoIterator<Item = ServiceDescriptor>,
    ) {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(service_id.into())
            .or_default()
            .extend(snapshots);
    }

    /// Queue the events the next subscription will deliver.
    pub fn push_subscription(&self, events: impl IntoIterator<Item = OrchestratorEvent>) {
        self.push_subscription_results(events.into_iter().map(Ok));
    }

    /// Queue a subscription that may also deliver stream errors.
    pub fn push_subscription_results(
        &self,
        events: impl IntoIterator<Item = Result<OrchestratorEvent, OrchestratorError>>,
    ) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(events.into_iter().collect());
    }

    /// Make `get_service` fail for a service.
    pub fn fail_reads_for(&self, service_id: impl Into<ServiceId>) {
        self.failing_reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service_id.into());
    }

    /// Service IDs passed to `get_service`, in call order.
    pub fn get_calls(&self) -> Vec<ServiceId> {
        self.get_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_services(&self) -> std::sync::MutexGuard<'_, BTreeMap<ServiceId, ServiceDescriptor>> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>, OrchestratorError> {
        Ok(self.lock_services().values().cloned().collect())
    }

    async fn get_service(
        &self,
        service_id: &ServiceId,
    ) -> Result<Option<ServiceDescriptor>, OrchestratorError> {
        self.get_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(service_id.clone());

        if self
            .failing_reads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(service_id)
        {
            return Err(OrchestratorError::Unavailable(format!(
                "[MOCK] read of {service_id} failed"
            )));
        }

        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queue) = snapshots.get_mut(service_id) {
            if queue.len() > 1 {
                return Ok(queue.pop_front());
            }
            if let Some(last) = queue.front() {
                return Ok(Some(last.clone()));
            }
        }
        drop(snapshots);

        Ok(self.lock_services().get(service_id).cloned())
    }

    async fn stream_events(&self) -> Result<EventStream, OrchestratorError> {
        let batch = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| OrchestratorError::Unavailable("[MOCK] no subscription queued".into()))?;

        Ok(Box::pin(tokio_stream::iter(batch)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_snapshots_then_table() {
        let mock = MockOrchestrator::with_services([ServiceDescriptor::new("svc_a", "table")]);
        mock.script_snapshots(
            "svc_a",
            [
                ServiceDescriptor::new("svc_a", "first"),
                ServiceDescriptor::new("svc_a", "second"),
            ],
        );

        let id = ServiceId::new("svc_a");
        assert_eq!(mock.get_service(&id).await.unwrap().unwrap().name, "first");
        assert_eq!(mock.get_service(&id).await.unwrap().unwrap().name, "second");
        assert_eq!(mock.get_service(&id).await.unwrap().unwrap().name, "second");
        assert_eq!(mock.get_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_subscriptions_are_consumed_in_order() {
        let mock = MockOrchestrator::new();
        mock.push_subscription([OrchestratorEvent::new("service", "create", "svc_a")]);

        let mut stream = mock.stream_events().await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.is_none());

        assert!(mock.stream_events().await.is_err());
    }

    #[tokio::test]
    async fn test_failing_reads() {
        let mock = MockOrchestrator::new();
        mock.fail_reads_for("svc_a");
        assert!(mock.get_service(&ServiceId::new("svc_a")).await.is_err());
        assert!(mock
            .get_service(&ServiceId::new("svc_b"))
            .await
            .unwrap()
            .is_none());
    }
}
