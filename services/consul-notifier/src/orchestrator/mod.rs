//! Orchestrator capability.
//!
//! The engine only needs three things from the orchestrator: a one-off
//! listing at startup, a fresh look at a single service when an event names
//! it, and the live event stream.

mod docker;
mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use notifier_reconcile::{OrchestratorEvent, ServiceDescriptor, ServiceId};
use thiserror::Error;

pub use docker::{decode_event, DockerClient, LineSplitter};
pub use mock::MockOrchestrator;

/// Errors from the orchestrator API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
}

impl From<hyper::http::Error> for OrchestratorError {
    fn from(err: hyper::http::Error) -> Self {
        OrchestratorError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Live orchestrator events.
///
/// Unbounded and not restartable: once it yields `None` (or an error) a new
/// subscription is needed, and events may have been missed in between.
pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<OrchestratorEvent, OrchestratorError>> + Send>>;

/// Orchestrator interface.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// List every service currently defined.
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>, OrchestratorError>;

    /// Read one service. `Ok(None)` means it no longer exists.
    async fn get_service(
        &self,
        service_id: &ServiceId,
    ) -> Result<Option<ServiceDescriptor>, OrchestratorError>;

    /// Subscribe to the event stream.
    async fn stream_events(&self) -> Result<EventStream, OrchestratorError>;
}
