//! Startup diffing between desired registrations and registry entries.
//!
//! The registry is ground truth at startup. Whatever it holds that no
//! eligible service wants is removed, and whatever an eligible service wants
//! that the registry lacks (or holds in a stale shape) is registered.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::descriptor::{extract, Registration, ServiceDescriptor, ServiceId};

/// Registrations the engine believes are currently in the registry.
pub type EngineState = BTreeMap<ServiceId, Registration>;

/// Fingerprint of a registration, stored alongside the registry entry.
///
/// Used to detect entries whose shape drifted while the notifier was down.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Fingerprint a registration on its own.
    ///
    /// Registries that store more than the registration (an advertised
    /// address, a derived check URL) should fingerprint what they store.
    pub fn of(registration: &Registration) -> Self {
        let json = serde_json::to_value(registration).unwrap_or(serde_json::Value::Null);
        Self::from_json(&json)
    }

    /// Wrap a hash previously rendered with [`SpecHash::as_str`].
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String((*k).clone()),
                        canonical_json(v)
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// A notifier-managed entry as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredEntry {
    pub service_id: ServiceId,

    /// Fingerprint recorded at registration time, if the entry carries one.
    pub spec_hash: Option<SpecHash>,
}

impl RegisteredEntry {
    pub fn new(service_id: impl Into<ServiceId>) -> Self {
        Self {
            service_id: service_id.into(),
            spec_hash: None,
        }
    }

    pub fn with_hash(mut self, hash: SpecHash) -> Self {
        self.spec_hash = Some(hash);
        self
    }

    fn matches(&self, expected: &SpecHash) -> bool {
        self.spec_hash.as_ref() == Some(expected)
    }
}

/// Run the extractor over every service, keeping the eligible ones.
pub fn desired_registrations<'a, I>(services: I) -> EngineState
where
    I: IntoIterator<Item = &'a ServiceDescriptor>,
{
    services
        .into_iter()
        .filter_map(extract)
        .map(|reg| (reg.service_id.clone(), reg))
        .collect()
}

/// Registry operations needed to converge at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupPlan {
    /// Registry entries no eligible service wants. Applied first.
    pub to_deregister: Vec<ServiceId>,

    /// Desired registrations missing from the registry or stale there.
    pub to_register: Vec<Registration>,

    /// Desired registrations already present in the right shape.
    pub in_place: Vec<Registration>,
}

impl StartupPlan {
    /// Diff desired registrations against what the registry holds.
    ///
    /// `fingerprint` must hash a registration the same way the registry did
    /// when it recorded `RegisteredEntry::spec_hash`.
    pub fn compute<F>(
        desired: &EngineState,
        registered: &[RegisteredEntry],
        fingerprint: F,
    ) -> Self
    where
        F: Fn(&Registration) -> SpecHash,
    {
        let present: BTreeMap<&ServiceId, &RegisteredEntry> = registered
            .iter()
            .map(|entry| (&entry.service_id, entry))
            .collect();

        let to_deregister = present
            .keys()
            .filter(|id| !desired.contains_key(**id))
            .map(|id| (*id).clone())
            .collect();

        let mut to_register = Vec::new();
        let mut in_place = Vec::new();
        for (id, registration) in desired {
            match present.get(&id) {
                Some(entry) if entry.matches(&fingerprint(registration)) => {
                    in_place.push(registration.clone())
                }
                _ => to_register.push(registration.clone()),
            }
        }

        Self {
            to_deregister,
            to_register,
            in_place,
        }
    }

    /// Returns true if the registry already matches.
    pub fn is_empty(&self) -> bool {
        self.to_deregister.is_empty() && self.to_register.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SERVICE_PORT_KEY;

    fn eligible(id: &str, port: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(id, format!("{id}-name")).with_env(SERVICE_PORT_KEY, port)
    }

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        assert_eq!(SpecHash::from_json(&json1), SpecHash::from_json(&json2));
        assert!(SpecHash::from_json(&json1).as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_tracks_registration_shape() {
        let a = extract(&eligible("A", "8080")).unwrap();
        let mut b = a.clone();
        assert_eq!(SpecHash::of(&a), SpecHash::of(&b));

        b.port = 9090;
        assert_ne!(SpecHash::of(&a), SpecHash::of(&b));
    }

    #[test]
    fn test_desired_skips_ineligible() {
        let services = vec![eligible("A", "8080"), ServiceDescriptor::new("B", "b")];
        let desired = desired_registrations(&services);

        assert_eq!(desired.len(), 1);
        assert!(desired.contains_key(&ServiceId::new("A")));
    }

    #[test]
    fn test_startup_convergence() {
        // A eligible, B not eligible; registry holds B and C.
        let services = vec![eligible("A", "8080"), ServiceDescriptor::new("B", "b")];
        let desired = desired_registrations(&services);
        let registered = vec![RegisteredEntry::new("B"), RegisteredEntry::new("C")];

        let plan = StartupPlan::compute(&desired, &registered, SpecHash::of);

        assert_eq!(
            plan.to_deregister,
            vec![ServiceId::new("B"), ServiceId::new("C")]
        );
        assert_eq!(plan.to_register.len(), 1);
        assert_eq!(plan.to_register[0].service_id, ServiceId::new("A"));
        assert!(plan.in_place.is_empty());
    }

    #[test]
    fn test_matching_entry_left_in_place() {
        let desired = desired_registrations(&[eligible("A", "8080")]);
        let hash = SpecHash::of(&desired[&ServiceId::new("A")]);
        let registered = vec![RegisteredEntry::new("A").with_hash(hash)];

        let plan = StartupPlan::compute(&desired, &registered, SpecHash::of);

        assert!(plan.is_empty());
        assert_eq!(plan.in_place.len(), 1);
    }

    #[test]
    fn test_drifted_entry_reregistered() {
        let old = desired_registrations(&[eligible("A", "8080")]);
        let stale = SpecHash::of(&old[&ServiceId::new("A")]);

        let desired = desired_registrations(&[eligible("A", "9090")]);
        let registered = vec![RegisteredEntry::new("A").with_hash(stale)];

        let plan = StartupPlan::compute(&desired, &registered, SpecHash::of);

        assert!(plan.to_deregister.is_empty());
        assert_eq!(plan.to_register.len(), 1);
        assert_eq!(plan.to_register[0].port, 9090);
    }

    #[test]
    fn test_entry_without_hash_reregistered() {
        let desired = desired_registrations(&[eligible("A", "8080")]);
        let registered = vec![RegisteredEntry::new("A")];

        let plan = StartupPlan::compute(&desired, &registered, SpecHash::of);
        assert_eq!(plan.to_register.len(), 1);
        assert!(plan.to_deregister.is_empty());
    }

    #[test]
    fn test_empty_inputs() {
        let plan = StartupPlan::compute(&EngineState::new(), &[], SpecHash::of);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_fingerprint_beyond_registration() {
        let desired = desired_registrations(&[eligible("A", "8080")]);
        let registration = &desired[&ServiceId::new("A")];
        let at = |address: &str| {
            SpecHash::from_json(&serde_json::json!({
                "registration": registration,
                "address": address,
            }))
        };
        let registered = vec![RegisteredEntry::new("A").with_hash(at("10.0.0.1"))];

        let same = StartupPlan::compute(&desired, &registered, |_| at("10.0.0.1"));
        assert!(same.is_empty());

        let moved = StartupPlan::compute(&desired, &registered, |_| at("10.0.0.2"));
        assert_eq!(moved.to_register.len(), 1);
        assert!(moved.in_place.is_empty());
    }
}
