//! Startup reconciliation.
//!
//! Runs once per subscription, before any live event is applied. Brings the
//! registry in line with the eligible orchestrator services and returns the
//! registrations known to be in place.

use std::collections::BTreeSet;

use notifier_reconcile::{
    desired_registrations, EngineState, RegisteredEntry, ServiceDescriptor, ServiceId,
    StartupPlan,
};
use tracing::{debug, info, warn};

use crate::registry::Registry;

/// Result of a startup sweep.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    /// Registrations confirmed present in the registry.
    pub state: EngineState,

    /// Entries still in the registry that should not be: failed removals,
    /// and stale copies whose re-registration failed.
    pub pending_deregister: BTreeSet<ServiceId>,

    pub registered: usize,
    pub deregistered: usize,
    pub failed: usize,
}

/// Apply the startup diff between orchestrator services and registry entries.
///
/// Deregistrations go first so a reused ID never has a stale and a fresh
/// entry at once. A failed call is logged and skipped; the affected service
/// converges on its next event or the next startup.
pub async fn reconcile(
    services: &[ServiceDescriptor],
    registered: &[RegisteredEntry],
    registry: &dyn Registry,
) -> StartupReport {
    let desired = desired_registrations(services);
    let plan = StartupPlan::compute(&desired, registered, |r| registry.fingerprint(r));
    let present: BTreeSet<&ServiceId> = registered.iter().map(|e| &e.service_id).collect();

    info!(
        services = services.len(),
        eligible = desired.len(),
        registry_entries = registered.len(),
        to_register = plan.to_register.len(),
        to_deregister = plan.to_deregister.len(),
        in_place = plan.in_place.len(),
        "Reconciling registry with orchestrator"
    );

    let mut report = StartupReport::default();

    if plan.is_empty() {
        info!(tracked = plan.in_place.len(), "Registry already in sync");
    }

    for service_id in &plan.to_deregister {
        match registry.deregister_service(service_id).await {
            Ok(()) => {
                info!(service_id = %service_id, "Deregistered stale service");
                report.deregistered += 1;
            }
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "Failed to deregister stale service");
                report.failed += 1;
                report.pending_deregister.insert(service_id.clone());
            }
        }
    }

    for registration in plan.to_register {
        match registry.register_service(&registration).await {
            Ok(()) => {
                info!(
                    service_id = %registration.service_id,
                    service_name = %registration.service_name,
                    port = registration.port,
                    "Registered service"
                );
                report.registered += 1;
                report
                    .state
                    .insert(registration.service_id.clone(), registration);
            }
            Err(e) => {
                warn!(
                    service_id = %registration.service_id,
                    error = %e,
                    "Failed to register service"
                );
                report.failed += 1;
                if present.contains(&registration.service_id) {
                    report
                        .pending_deregister
                        .insert(registration.service_id.clone());
                }
            }
        }
    }

    for registration in plan.in_place {
        debug!(service_id = %registration.service_id, "Registration already in place");
        report
            .state
            .insert(registration.service_id.clone(), registration);
    }

    info!(
        registered = report.registered,
        deregistered = report.deregistered,
        failed = report.failed,
        tracked = report.state.len(),
        pending_deregister = report.pending_deregister.len(),
        "Startup reconciliation complete"
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MockRegistry, RegistryCall};
    use notifier_reconcile::ServiceId;

    fn eligible(id: &str, port: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(id, id).with_env("CONSUL_SERVICE_PORT", port)
    }

    #[tokio::test]
    async fn test_deregisters_before_registering() {
        let registry = MockRegistry::new();
        registry.seed_bare("B");
        registry.seed_bare("C");
        let services = vec![eligible("A", "8080"), ServiceDescriptor::new("B", "b")];
        let registered = registry.list_registered_services().await.unwrap();

        let report = reconcile(&services, &registered, &registry).await;

        assert_eq!(
            registry.mutations(),
            vec![
                RegistryCall::Deregister(ServiceId::new("B")),
                RegistryCall::Deregister(ServiceId::new("C")),
                RegistryCall::Register {
                    service_id: ServiceId::new("A"),
                    port: 8080
                },
            ]
        );
        assert_eq!(report.registered, 1);
        assert_eq!(report.deregistered, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(
            report.state.keys().cloned().collect::<Vec<_>>(),
            vec![ServiceId::new("A")]
        );
    }

    #[tokio::test]
    async fn test_partial_failure_continues() {
        let registry = MockRegistry::new();
        registry.fail_for("A");
        registry.fail_for("Z");
        registry.seed_bare("Z");
        let services = vec![eligible("A", "8080"), eligible("B", "9090")];
        let registered = registry.list_registered_services().await.unwrap();

        let report = reconcile(&services, &registered, &registry).await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.registered, 1);
        assert!(!report.state.contains_key(&ServiceId::new("A")));
        assert!(report.state.contains_key(&ServiceId::new("B")));
        // Z is still in the registry; A never was.
        assert_eq!(
            report.pending_deregister.into_iter().collect::<Vec<_>>(),
            vec![ServiceId::new("Z")]
        );
    }

    #[tokio::test]
    async fn test_in_place_entries_tracked_without_calls() {
        let registry = MockRegistry::new();
        let services = vec![eligible("A", "8080")];
        let desired = desired_registrations(&services);
        registry.seed(desired[&ServiceId::new("A")].clone());
        let registered = registry.list_registered_services().await.unwrap();

        let report = reconcile(&services, &registered, &registry).await;

        assert!(registry.mutations().is_empty());
        assert_eq!(report.state, desired);
    }

    #[tokio::test]
    async fn test_failed_reregister_of_drifted_entry_is_pending() {
        let registry = MockRegistry::new();
        registry.seed_bare("A");
        registry.fail_for("A");
        let services = vec![eligible("A", "8080")];
        let registered = registry.list_registered_services().await.unwrap();

        let report = reconcile(&services, &registered, &registry).await;

        assert_eq!(report.failed, 1);
        assert!(report.state.is_empty());
        assert!(report.pending_deregister.contains(&ServiceId::new("A")));
    }
}
