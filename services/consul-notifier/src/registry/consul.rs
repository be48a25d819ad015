//! Consul agent API client.
//!
//! Entries are registered against the local agent with the Swarm node's
//! address. Every entry is tagged and carries metadata marking it as ours,
//! so listing never returns (and startup never removes) foreign services.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use notifier_reconcile::{RegisteredEntry, Registration, ServiceId, SpecHash};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{Registry, RegistryError};

/// Value of the ownership marker and the tag added to every entry.
pub const MANAGED_BY: &str = "consul-notifier";

/// Metadata key holding the ownership marker.
pub const MANAGED_BY_META_KEY: &str = "managed-by";

/// Metadata key holding the registration fingerprint.
pub const SPEC_HASH_META_KEY: &str = "spec-hash";

/// Per-request timeout for agent calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Consul agent API client.
pub struct ConsulClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    advertise_address: String,
    tls_skip_verify: bool,
}

impl ConsulClient {
    /// Create a new client for the agent at `base_url`.
    ///
    /// `advertise_address` is the address registered for every service and
    /// used in health check URLs.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        advertise_address: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            advertise_address: advertise_address.into(),
            tls_skip_verify: false,
        })
    }

    /// Skip certificate verification on `https` health checks.
    pub fn with_tls_skip_verify(mut self, skip: bool) -> Self {
        self.tls_skip_verify = skip;
        self
    }

    /// Build the agent payload for a registration.
    pub fn payload(&self, registration: &Registration) -> AgentServiceRegistration {
        let mut payload = self.unmarked_payload(registration);
        let spec_hash = Self::hash_payload(&payload);
        payload.meta = BTreeMap::from([
            (MANAGED_BY_META_KEY.to_string(), MANAGED_BY.to_string()),
            (SPEC_HASH_META_KEY.to_string(), spec_hash.to_string()),
        ]);
        payload
    }

    /// Payload without ownership metadata; this is what the fingerprint covers.
    fn unmarked_payload(&self, registration: &Registration) -> AgentServiceRegistration {
        AgentServiceRegistration {
            id: registration.service_id.to_string(),
            name: registration.service_name.clone(),
            address: self.advertise_address.clone(),
            port: registration.port,
            tags: vec![MANAGED_BY.to_string()],
            meta: BTreeMap::new(),
            check: AgentServiceCheck {
                http: registration.health_check_url(&self.advertise_address),
                interval: registration.interval_string(),
                tls_skip_verify: registration.use_tls && self.tls_skip_verify,
            },
        }
    }

    fn hash_payload(payload: &AgentServiceRegistration) -> SpecHash {
        let json = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        SpecHash::from_json(&json)
    }

    fn put(&self, url: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.put(url))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("X-Consul-Token", token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, RegistryError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Consul {} failed", what);
        Err(RegistryError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Registry for ConsulClient {
    async fn register_service(&self, registration: &Registration) -> Result<(), RegistryError> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let payload = self.payload(registration);
        debug!(
            service_id = %registration.service_id,
            service_name = %registration.service_name,
            port = registration.port,
            check_url = %payload.check.http,
            "Registering service with Consul"
        );

        let response = self.put(&url).json(&payload).send().await?;
        Self::check(response, "register").await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &ServiceId) -> Result<(), RegistryError> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, service_id);
        debug!(service_id = %service_id, "Deregistering service from Consul");

        let response = self.put(&url).send().await?;
        Self::check(response, "deregister").await?;
        Ok(())
    }

    async fn list_registered_services(&self) -> Result<Vec<RegisteredEntry>, RegistryError> {
        let url = format!("{}/v1/agent/services", self.base_url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = Self::check(response, "service listing").await?;
        let services: HashMap<String, AgentService> = response.json().await?;

        let mut entries: Vec<RegisteredEntry> = services
            .into_values()
            .filter(|service| service.is_managed())
            .map(|service| {
                let spec_hash = service
                    .meta
                    .as_ref()
                    .and_then(|meta| meta.get(SPEC_HASH_META_KEY))
                    .map(|raw| SpecHash::from_raw(raw.as_str()));
                RegisteredEntry {
                    service_id: ServiceId::new(service.id),
                    spec_hash,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.service_id.cmp(&b.service_id));

        debug!(count = entries.len(), "Listed notifier-managed Consul services");
        Ok(entries)
    }

    fn fingerprint(&self, registration: &Registration) -> SpecHash {
        Self::hash_payload(&self.unmarked_payload(registration))
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Body of `PUT /v1/agent/service/register`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
    pub check: AgentServiceCheck,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceCheck {
    #[serde(rename = "HTTP")]
    pub http: String,
    pub interval: String,
    #[serde(rename = "TLSSkipVerify")]
    pub tls_skip_verify: bool,
}

/// One value of `GET /v1/agent/services`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

impl AgentService {
    fn is_managed(&self) -> bool {
        self.meta
            .as_ref()
            .and_then(|meta| meta.get(MANAGED_BY_META_KEY))
            .is_some_and(|owner| owner == MANAGED_BY)
    }
}
