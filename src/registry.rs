//! Device Registry: admission control and the table of connected devices.
//!
//! Admission is two independent checks: the origin must match an allowed
//! network prefix, and the origin must be below its device cap. The origin
//! counter table and the device table are separate locks held only for the
//! duration of a map operation; they are never nested.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::AdmissionError;
use crate::{lock, now_ms, DeviceId};

/// Maximum metadata entries accepted from a device.
pub const MAX_METADATA_ENTRIES: usize = 32;
/// Maximum length of a single metadata string value or key.
pub const MAX_METADATA_TEXT: usize = 256;

/// Scalar metadata value supplied by a device. Passed through opaquely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

pub type DeviceMetadata = BTreeMap<String, MetadataValue>;

/// Keep scalar entries of a client-supplied JSON object; drop everything else.
pub fn metadata_from_json(map: serde_json::Map<String, serde_json::Value>) -> DeviceMetadata {
    let mut out = DeviceMetadata::new();
    for (key, value) in map {
        if out.len() >= MAX_METADATA_ENTRIES {
            log::debug!("device metadata truncated at {} entries", MAX_METADATA_ENTRIES);
            break;
        }
        if key.len() > MAX_METADATA_TEXT {
            continue;
        }
        let scalar = match value {
            serde_json::Value::Bool(b) => MetadataValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => MetadataValue::Integer(i),
                None => match n.as_f64() {
                    Some(f) => MetadataValue::Float(f),
                    None => continue,
                },
            },
            serde_json::Value::String(s) => {
                let mut s = s;
                if s.len() > MAX_METADATA_TEXT {
                    let mut end = MAX_METADATA_TEXT;
                    while !s.is_char_boundary(end) {
                        end -= 1;
                    }
                    s.truncate(end);
                }
                MetadataValue::Text(s)
            }
            _ => continue,
        };
        out.insert(key, scalar);
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub origin: String,
    pub connected_at_ms: u64,
    pub metadata: DeviceMetadata,
}

/// Network-origin allow-list. Entries are address prefixes (`"192.168."`)
/// or exact hosts (`"127.0.0.1"`, `"localhost"`).
#[derive(Clone, Debug)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    pub fn allows(&self, origin: &str) -> bool {
        let origin = origin.trim().to_lowercase();
        if origin.is_empty() {
            return false;
        }
        origin == "127.0.0.1" || self.allowed.iter().any(|net| origin.starts_with(net.as_str()))
    }
}

pub struct DeviceRegistry {
    policy: OriginPolicy,
    max_per_origin: usize,
    devices: Mutex<HashMap<DeviceId, Device>>,
    origins: Mutex<HashMap<String, usize>>,
    lifetime_registrations: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(policy: OriginPolicy, max_per_origin: usize) -> Self {
        Self {
            policy,
            max_per_origin,
            devices: Mutex::new(HashMap::new()),
            origins: Mutex::new(HashMap::new()),
            lifetime_registrations: AtomicU64::new(0),
        }
    }

    /// Admit a device. A device id that is already registered is rejected
    /// until it has been unregistered.
    pub fn register(
        &self,
        device_id: &str,
        metadata: DeviceMetadata,
        origin: &str,
    ) -> Result<Device, AdmissionError> {
        if !self.policy.allows(origin) {
            log::warn!("registration of {} rejected: unauthorized origin {}", device_id, origin);
            return Err(AdmissionError::UnauthorizedOrigin);
        }

        // Reserve a slot on the origin counter first; roll it back if the id is taken.
        {
            let mut origins = lock(&self.origins);
            let count = origins.entry(origin.to_string()).or_insert(0);
            if *count >= self.max_per_origin {
                log::warn!(
                    "registration of {} rejected: {} already has {} devices",
                    device_id,
                    origin,
                    count
                );
                return Err(AdmissionError::TooManyConnections);
            }
            *count += 1;
        }

        let device = Device {
            id: device_id.to_string(),
            origin: origin.to_string(),
            connected_at_ms: now_ms(),
            metadata,
        };
        {
            let mut devices = lock(&self.devices);
            if devices.contains_key(device_id) {
                drop(devices);
                self.release_origin(origin);
                log::warn!("registration of {} rejected: id already registered", device_id);
                return Err(AdmissionError::AlreadyRegistered);
            }
            devices.insert(device.id.clone(), device.clone());
        }
        self.lifetime_registrations.fetch_add(1, Ordering::Relaxed);
        log::info!("device registered: {} from {}", device_id, origin);
        Ok(device)
    }

    /// Remove a device. Unknown ids are a no-op. Returns the removed record.
    pub fn unregister(&self, device_id: &str) -> Option<Device> {
        let removed = lock(&self.devices).remove(device_id);
        if let Some(device) = &removed {
            self.release_origin(&device.origin);
            log::info!("device unregistered: {}", device_id);
        }
        removed
    }

    /// Whether `origin` passes the network allow-list.
    pub fn admits_origin(&self, origin: &str) -> bool {
        self.policy.allows(origin)
    }

    pub fn is_registered(&self, device_id: &str) -> bool {
        lock(&self.devices).contains_key(device_id)
    }

    pub fn devices(&self) -> Vec<Device> {
        let mut list: Vec<Device> = lock(&self.devices).values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn connections_from(&self, origin: &str) -> usize {
        lock(&self.origins).get(origin).copied().unwrap_or(0)
    }

    pub fn lifetime_registrations(&self) -> u64 {
        self.lifetime_registrations.load(Ordering::Relaxed)
    }

    fn release_origin(&self, origin: &str) {
        let mut origins = lock(&self.origins);
        if let Some(count) = origins.get_mut(origin) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                origins.remove(origin);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max: usize) -> DeviceRegistry {
        DeviceRegistry::new(
            OriginPolicy::new(vec!["192.168.".to_string(), "localhost".to_string()]),
            max,
        )
    }

    #[test]
    fn rejects_unauthorized_origin() {
        let reg = registry(3);
        let err = reg
            .register("cam-1", DeviceMetadata::new(), "8.8.8.8")
            .unwrap_err();
        assert_eq!(err, AdmissionError::UnauthorizedOrigin);
        assert!(!reg.is_registered("cam-1"));
        assert_eq!(reg.connections_from("8.8.8.8"), 0);
    }

    #[test]
    fn loopback_is_always_allowed() {
        let reg = registry(3);
        assert!(reg.register("cam-1", DeviceMetadata::new(), "127.0.0.1").is_ok());
    }

    #[test]
    fn enforces_per_origin_cap() {
        let reg = registry(3);
        let results: Vec<_> = (0..4)
            .map(|i| reg.register(&format!("cam-{i}"), DeviceMetadata::new(), "192.168.1.50"))
            .collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert_eq!(
            results[3].as_ref().unwrap_err(),
            &AdmissionError::TooManyConnections
        );
        assert_eq!(reg.connections_from("192.168.1.50"), 3);

        // Another origin is not affected.
        assert!(reg
            .register("cam-x", DeviceMetadata::new(), "192.168.1.51")
            .is_ok());
    }

    #[test]
    fn duplicate_id_is_rejected_and_does_not_leak_origin_slot() {
        let reg = registry(3);
        reg.register("cam-1", DeviceMetadata::new(), "192.168.1.50")
            .unwrap();
        let err = reg
            .register("cam-1", DeviceMetadata::new(), "192.168.1.50")
            .unwrap_err();
        assert_eq!(err, AdmissionError::AlreadyRegistered);
        assert_eq!(reg.connections_from("192.168.1.50"), 1);

        reg.unregister("cam-1");
        assert!(reg
            .register("cam-1", DeviceMetadata::new(), "192.168.1.50")
            .is_ok());
    }

    #[test]
    fn unregister_is_idempotent_and_frees_slot() {
        let reg = registry(1);
        reg.register("cam-1", DeviceMetadata::new(), "192.168.1.50")
            .unwrap();
        assert!(reg.unregister("cam-1").is_some());
        assert!(reg.unregister("cam-1").is_none());
        assert!(reg.unregister("never-seen").is_none());
        assert_eq!(reg.connections_from("192.168.1.50"), 0);
        assert!(reg
            .register("cam-2", DeviceMetadata::new(), "192.168.1.50")
            .is_ok());
    }

    #[test]
    fn metadata_keeps_only_scalars() {
        let json = serde_json::json!({
            "name": "kitchen phone",
            "fps": 10,
            "ratio": 1.5,
            "front": true,
            "nested": {"a": 1},
            "list": [1, 2],
            "nothing": null
        });
        let serde_json::Value::Object(map) = json else {
            panic!("object expected");
        };
        let meta = metadata_from_json(map);
        assert_eq!(meta.len(), 4);
        assert_eq!(meta["name"], MetadataValue::Text("kitchen phone".into()));
        assert_eq!(meta["fps"], MetadataValue::Integer(10));
        assert_eq!(meta["front"], MetadataValue::Bool(true));
        assert!(!meta.contains_key("nested"));
    }
}
