//! Service descriptors and the registrations derived from them.
//!
//! A service is *eligible* for registration when its environment (or, failing
//! that, its labels) declares `CONSUL_SERVICE_PORT`. Everything else about the
//! registration has a default.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Key declaring the port to register. Required for eligibility.
pub const SERVICE_PORT_KEY: &str = "CONSUL_SERVICE_PORT";

/// Key declaring the HTTP health check path.
pub const HEALTH_CHECK_KEY: &str = "CONSUL_HEALTH_CHECK";

/// Key declaring the health check interval.
pub const HEALTH_INTERVAL_KEY: &str = "CONSUL_HEALTH_INTERVAL";

/// Key declaring whether the health check uses TLS.
pub const HEALTH_SSL_KEY: &str = "CONSUL_HEALTH_SSL";

/// Health check path used when none is declared.
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/";

/// Health check interval used when none (or garbage) is declared.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Orchestrator-assigned service identifier.
///
/// Used verbatim as the registry service ID, so one orchestrator service maps
/// to exactly one registry entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Wrap a raw service ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Read-only snapshot of one orchestrator service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub name: String,

    /// First port published through the routing mesh, if any.
    pub published_port: Option<u16>,

    /// Container environment of the service's task template.
    pub env: BTreeMap<String, String>,

    /// Service-level labels. Consulted after `env`.
    pub labels: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    /// Create a descriptor with an empty environment.
    pub fn new(id: impl Into<ServiceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set an environment variable (builder style).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set a label (builder style).
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Look up a notifier setting. Environment wins over labels.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .or_else(|| self.labels.get(key))
            .map(String::as_str)
    }
}

/// How a service should appear in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub service_id: ServiceId,
    pub service_name: String,
    pub port: u16,
    pub health_check_path: String,
    pub health_check_interval: Duration,
    pub use_tls: bool,
}

impl Registration {
    /// Build the HTTP health check URL for a service reachable at `address`.
    pub fn health_check_url(&self, address: &str) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!(
            "{}://{}:{}{}",
            scheme, address, self.port, self.health_check_path
        )
    }

    /// Render the interval the way the registry expects it (`10s`, `500ms`).
    pub fn interval_string(&self) -> String {
        let interval = self.health_check_interval;
        if interval.subsec_millis() == 0 {
            format!("{}s", interval.as_secs())
        } else {
            format!("{}ms", interval.as_millis())
        }
    }
}

/// Derive the registration for a service, or `None` if it is ineligible.
///
/// Ineligibility is not an error: services without a usable
/// `CONSUL_SERVICE_PORT` are simply never registered.
pub fn extract(descriptor: &ServiceDescriptor) -> Option<Registration> {
    let port = descriptor.setting(SERVICE_PORT_KEY).and_then(parse_port)?;

    let health_check_path = descriptor
        .setting(HEALTH_CHECK_KEY)
        .map(normalize_path)
        .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_PATH.to_string());

    let health_check_interval = descriptor
        .setting(HEALTH_INTERVAL_KEY)
        .and_then(parse_interval)
        .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL);

    let use_tls = descriptor
        .setting(HEALTH_SSL_KEY)
        .map(parse_flag)
        .unwrap_or(false);

    Some(Registration {
        service_id: descriptor.id.clone(),
        service_name: descriptor.name.clone(),
        port,
        health_check_path,
        health_check_interval,
        use_tls,
    })
}

/// Parse `KEY=VALUE` environment entries.
///
/// Entries must contain exactly one `=`; anything else is skipped. Later
/// duplicates override earlier ones.
pub fn parse_env_entries<I, S>(entries: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|entry| {
            let entry = entry.as_ref();
            if entry.matches('=').count() != 1 {
                return None;
            }
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_port(raw: &str) -> Option<u16> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_HEALTH_CHECK_PATH.to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// A bare integer means seconds.
fn parse_interval(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    let interval = if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        Duration::from_secs(trimmed.parse().ok()?)
    } else {
        humantime::parse_duration(trimmed).ok()?
    };

    (!interval.is_zero()).then_some(interval)
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
