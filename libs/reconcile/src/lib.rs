//! Reconciliation primitives for keeping Consul in step with Docker Swarm.
//!
//! This library holds the pure, I/O-free half of the notifier:
//!
//! - **Extraction**: deriving a [`Registration`] from a service snapshot.
//! - **Classification**: mapping raw orchestrator events to [`EventClass`].
//! - **Planning**: diffing desired registrations against registry entries.
//!
//! # Invariants
//!
//! - A registration exists for a service iff its environment declares a
//!   parseable `CONSUL_SERVICE_PORT`.
//! - Decisions are deterministic given the same inputs.
//! - Every registry operation derived here is idempotent.

pub mod classify;
pub mod descriptor;
pub mod plan;

pub use classify::{classify, EventClass, OrchestratorEvent};
pub use descriptor::{
    extract, parse_env_entries, Registration, ServiceDescriptor, ServiceId,
    DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_HEALTH_CHECK_PATH,
};
pub use plan::{desired_registrations, EngineState, RegisteredEntry, SpecHash, StartupPlan};
