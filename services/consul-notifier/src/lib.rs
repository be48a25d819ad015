//! consul-notifier Library
//!
//! Keeps Consul's service catalog in step with the services running on a
//! Docker Swarm. Services opt in by declaring `CONSUL_SERVICE_PORT` in their
//! environment; the notifier watches the Docker event stream and registers,
//! updates or deregisters them against the local Consul agent.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//! ├── Orchestrator::stream_events   (subscribe first)
//! ├── startup::reconcile            (list both sides, apply the diff)
//! └── Engine::run                   (event -> re-read -> diff -> registry call)
//! ```
//!
//! ## Modules
//!
//! - `config`: Flag and environment configuration
//! - `orchestrator`: Docker Engine API adapter and mock
//! - `registry`: Consul agent API adapter and mock
//! - `startup`: One-shot startup reconciliation
//! - `engine`: Event-driven reconciliation loop
//! - `supervisor`: Subscription lifecycle and resync

pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod registry;
pub mod startup;
pub mod supervisor;

// Re-export commonly used types
pub use engine::{Engine, EngineError, Outcome};
pub use orchestrator::{DockerClient, MockOrchestrator, Orchestrator};
pub use registry::{ConsulClient, MockRegistry, Registry};
pub use supervisor::{Supervisor, SupervisorConfig};
