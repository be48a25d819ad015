//! In-memory registry for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use notifier_reconcile::{RegisteredEntry, Registration, ServiceId, SpecHash};
use tracing::info;

use super::{Registry, RegistryError};

/// A call made against the mock registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Register { service_id: ServiceId, port: u16 },
    Deregister(ServiceId),
    List,
}

#[derive(Default)]
struct MockState {
    /// Entries by ID. `None` marks an entry registered without a fingerprint.
    entries: BTreeMap<ServiceId, Option<Registration>>,
    calls: Vec<RegistryCall>,
    failing: BTreeSet<ServiceId>,
    fail_listing: bool,
}

/// Mock registry that records every call.
#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<MockState>,
}

impl MockRegistry {
    /// Create an empty mock registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry as if registered by an earlier run.
    pub fn seed(&self, registration: Registration) {
        self.lock()
            .entries
            .insert(registration.service_id.clone(), Some(registration));
    }

    /// Seed an entry that carries no fingerprint.
    pub fn seed_bare(&self, service_id: impl Into<ServiceId>) {
        self.lock().entries.insert(service_id.into(), None);
    }

    /// Make register/deregister fail for a service.
    pub fn fail_for(&self, service_id: impl Into<ServiceId>) {
        self.lock().failing.insert(service_id.into());
    }

    /// Let calls for a service succeed again.
    pub fn recover(&self, service_id: &ServiceId) {
        self.lock().failing.remove(service_id);
    }

    /// Make listing fail.
    pub fn fail_listing(&self) {
        self.lock().fail_listing = true;
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.lock().calls.clone()
    }

    /// Register and deregister calls only.
    pub fn mutations(&self) -> Vec<RegistryCall> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, RegistryCall::List))
            .collect()
    }

    /// Current entry for a service, if registered with a fingerprint.
    pub fn entry(&self, service_id: &ServiceId) -> Option<Registration> {
        self.lock().entries.get(service_id).cloned().flatten()
    }

    /// IDs currently registered.
    pub fn registered_ids(&self) -> Vec<ServiceId> {
        self.lock().entries.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn register_service(&self, registration: &Registration) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let service_id = registration.service_id.clone();
        state.calls.push(RegistryCall::Register {
            service_id: service_id.clone(),
            port: registration.port,
        });

        if state.failing.contains(&service_id) {
            return Err(RegistryError::Unavailable(format!(
                "[MOCK] register of {service_id} failed"
            )));
        }

        info!(service_id = %service_id, port = registration.port, "[MOCK] Registered service");
        state.entries.insert(service_id, Some(registration.clone()));
        Ok(())
    }

    async fn deregister_service(&self, service_id: &ServiceId) -> Result<(), RegistryError> {
        let mut state = self.lock();
        state.calls.push(RegistryCall::Deregister(service_id.clone()));

        if state.failing.contains(service_id) {
            return Err(RegistryError::Unavailable(format!(
                "[MOCK] deregister of {service_id} failed"
            )));
        }

        info!(service_id = %service_id, "[MOCK] Deregistered service");
        state.entries.remove(service_id);
        Ok(())
    }

    async fn list_registered_services(&self) -> Result<Vec<RegisteredEntry>, RegistryError> {
        let mut state = self.lock();
        state.calls.push(RegistryCall::List);

        if state.fail_listing {
            return Err(RegistryError::Unavailable("[MOCK] listing failed".into()));
        }

        Ok(state
            .entries
            .iter()
            .map(|(id, registration)| RegisteredEntry {
                service_id: id.clone(),
                spec_hash: registration.as_ref().map(SpecHash::of),
            })
            .collect())
    }
}
