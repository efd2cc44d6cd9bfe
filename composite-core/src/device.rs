//! Device identity and ordering within a session.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broker-issued device identifier. Opaque; compared by exact match only.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_owned())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(s)
    }
}

/// One participant as listed in a broker session snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub uuid: DeviceId,
    /// Set on the local device when a peer list is refreshed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub me: bool,
    /// Application-defined fields carried along untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Device {
    pub fn new(uuid: impl Into<DeviceId>) -> Self {
        Self {
            uuid: uuid.into(),
            me: false,
            extra: Map::new(),
        }
    }
}

/// Ordinal slot of `me` in `devices`. Scans from the back, so the last match wins.
pub fn find_me_index(devices: &[Device], me: &DeviceId) -> Option<usize> {
    devices.iter().rposition(|d| d.uuid == *me)
}

/// Tag every device whose identifier equals `me`; clear the tag on all others.
pub fn mark_me(devices: &mut [Device], me: Option<&DeviceId>) {
    for device in devices.iter_mut() {
        device.me = me.is_some_and(|id| device.uuid == *id);
    }
}

/// Host is whoever occupies slot 0.
pub fn is_host(devices: &[Device]) -> bool {
    devices.first().is_some_and(|d| d.me)
}
