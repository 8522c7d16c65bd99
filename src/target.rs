//! Device and module addressing.

use std::fmt;

/// Endpoint the sender link itself is attached to.
pub const ENDPOINT: &str = "/messages/devicebound";

/// Where a cloud-to-device message is headed: a device, or a module on a
/// device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    device_id: String,
    module_id: Option<String>,
}

impl Target {
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: None,
        }
    }

    pub fn module(device_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: Some(module_id.into()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    /// Resolve the `to` address written into the message properties.
    ///
    /// - device: `/devices/{deviceId}/messages/devicebound`
    /// - module: `/devices/{deviceId}/modules/{moduleId}/messages/devicebound`
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module_id {
            None => write!(f, "/devices/{}{ENDPOINT}", self.device_id),
            Some(module_id) => write!(
                f,
                "/devices/{}/modules/{module_id}{ENDPOINT}",
                self.device_id
            ),
        }
    }
}
