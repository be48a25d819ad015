//! Docker Engine API client.
//!
//! Talks to the daemon over its Unix socket. Only the Swarm endpoints the
//! notifier needs are covered: services, events and node info.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::body::{Buf, HttpBody};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use notifier_reconcile::classify::SERVICE_EVENT;
use notifier_reconcile::{parse_env_entries, OrchestratorEvent, ServiceDescriptor, ServiceId};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use super::{EventStream, Orchestrator, OrchestratorError};

/// `filters={"type":["service","container"]}`, URL-encoded.
const EVENT_FILTERS: &str = "%7B%22type%22%3A%5B%22service%22%2C%22container%22%5D%7D";

/// Container attribute naming the Swarm service a task belongs to.
const SWARM_SERVICE_ID_ATTRIBUTE: &str = "com.docker.swarm.service.id";

/// Events buffered between the socket reader and the engine.
const EVENT_BUFFER: usize = 256;

/// Docker API client for Unix socket communication.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    /// Create a new Docker client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    /// Address this node advertises to the Swarm, if it is part of one.
    pub async fn node_address(&self) -> Result<Option<String>, OrchestratorError> {
        let info: Option<SystemInfo> = self.get("/info").await?;
        Ok(info
            .and_then(|info| info.swarm)
            .map(|swarm| swarm.node_addr)
            .filter(|addr| !addr.is_empty()))
    }

    /// Perform a GET request. A 404 yields `Ok(None)`.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, OrchestratorError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "GET request to Docker API");

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if status.is_success() {
            let result = serde_json::from_reader(body.reader())?;
            Ok(Some(result))
        } else {
            let message = body_text(body);
            error!(status = %status, message = %message, "Docker API error");
            Err(OrchestratorError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl Orchestrator for DockerClient {
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>, OrchestratorError> {
        let services: Vec<SwarmService> = self.get("/services").await?.unwrap_or_default();
        Ok(services.into_iter().map(ServiceDescriptor::from).collect())
    }

    async fn get_service(
        &self,
        service_id: &ServiceId,
    ) -> Result<Option<ServiceDescriptor>, OrchestratorError> {
        let path = format!("/services/{}", service_id);
        let service: Option<SwarmService> = self.get(&path).await?;
        Ok(service.map(ServiceDescriptor::from))
    }

    async fn stream_events(&self) -> Result<EventStream, OrchestratorError> {
        let path = format!("/events?filters={}", EVENT_FILTERS);
        let uri = Uri::new(&self.socket_path, &path);

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = hyper::body::aggregate(response.into_body()).await?;
            let message = body_text(body);
            return Err(OrchestratorError::Api {
                status: status.as_u16(),
                message,
            });
        }

        debug!("Subscribed to Docker event stream");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(pump_events(response.into_body(), tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Full text of an aggregated response body, across all of its chunks.
fn body_text(mut body: impl Buf) -> String {
    let bytes = body.copy_to_bytes(body.remaining());
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Forward decoded events until the daemon hangs up or the reader goes away.
async fn pump_events(
    mut body: Body,
    tx: mpsc::Sender<Result<OrchestratorEvent, OrchestratorError>>,
) {
    let mut lines = LineSplitter::default();

    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        for line in lines.push(&chunk) {
            match decode_event(&line) {
                Ok(Some(event)) => {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, line = %line, "Skipping undecodable Docker event"),
            }
        }
    }

    debug!("Docker event stream closed by daemon");
}

/// Splits a chunked byte stream into newline-delimited records.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Feed a chunk, returning every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

/// Decode one line of the event stream. Blank lines decode to `None`.
pub fn decode_event(line: &str) -> Result<Option<OrchestratorEvent>, serde_json::Error> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let raw: RawEvent = serde_json::from_str(line)?;

    let service_id = if raw.event_type == SERVICE_EVENT {
        raw.actor.id
    } else {
        raw.actor
            .attributes
            .get(SWARM_SERVICE_ID_ATTRIBUTE)
            .cloned()
            .unwrap_or_default()
    };

    let timestamp = match (raw.time_nano, raw.time) {
        (Some(nanos), _) => DateTime::from_timestamp(
            nanos.div_euclid(1_000_000_000),
            nanos.rem_euclid(1_000_000_000) as u32,
        ),
        (None, Some(secs)) => DateTime::from_timestamp(secs, 0),
        (None, None) => None,
    }
    .unwrap_or_else(Utc::now);

    Ok(Some(OrchestratorEvent {
        event_type: raw.event_type,
        action: raw.action,
        service_id: ServiceId::new(service_id),
        timestamp,
    }))
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Type")]
    event_type: String,
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: RawActor,
    #[serde(default)]
    time: Option<i64>,
    #[serde(rename = "timeNano", default)]
    time_nano: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmService {
    #[serde(rename = "ID")]
    id: String,
    spec: SwarmServiceSpec,
    #[serde(default)]
    endpoint: Option<SwarmEndpoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmServiceSpec {
    name: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    task_template: Option<TaskTemplate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskTemplate {
    #[serde(default)]
    container_spec: Option<ContainerSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSpec {
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmEndpoint {
    #[serde(default)]
    ports: Option<Vec<SwarmPort>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmPort {
    #[serde(default)]
    published_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SystemInfo {
    #[serde(default)]
    swarm: Option<SwarmInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmInfo {
    #[serde(default)]
    node_addr: String,
}

impl From<SwarmService> for ServiceDescriptor {
    fn from(service: SwarmService) -> Self {
        let env = service
            .spec
            .task_template
            .and_then(|t| t.container_spec)
            .and_then(|c| c.env)
            .map(parse_env_entries)
            .unwrap_or_default();

        let published_port = service
            .endpoint
            .and_then(|e| e.ports)
            .and_then(|ports| ports.into_iter().find_map(|p| p.published_port));

        ServiceDescriptor {
            id: ServiceId::new(service.id),
            name: service.spec.name,
            published_port,
            env,
            labels: service.spec.labels.unwrap_or_default(),
        }
    }
}
