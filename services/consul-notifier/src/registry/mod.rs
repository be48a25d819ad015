//! Registry capability.
//!
//! Register is an idempotent upsert keyed by service ID; deregister of an
//! unknown ID is harmless. No call depends on another, so there is nothing
//! transactional here.

mod consul;
mod mock;

use async_trait::async_trait;
use notifier_reconcile::{RegisteredEntry, Registration, ServiceId, SpecHash};
use thiserror::Error;

pub use consul::{ConsulClient, MANAGED_BY, MANAGED_BY_META_KEY, SPEC_HASH_META_KEY};
pub use mock::{MockRegistry, RegistryCall};

/// Errors from the registry API.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Registry interface.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create or replace the entry for a registration.
    async fn register_service(&self, registration: &Registration) -> Result<(), RegistryError>;

    /// Remove the entry for a service.
    async fn deregister_service(&self, service_id: &ServiceId) -> Result<(), RegistryError>;

    /// List the entries this notifier manages.
    async fn list_registered_services(&self) -> Result<Vec<RegisteredEntry>, RegistryError>;

    /// Fingerprint recorded with an entry for `registration`. Must match what
    /// `list_registered_services` reports for an entry written by this registry.
    fn fingerprint(&self, registration: &Registration) -> SpecHash {
        SpecHash::of(registration)
    }
}
