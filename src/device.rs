//! Playback device model

use serde::{Deserialize, Serialize};

/// Default Cast control channel port
pub const CAST_CONTROL_PORT: u16 = 8009;

/// Type of playback target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// A Google Cast receiver on the local network
    Googlecast,
    /// This machine's audio output
    LocalPlayer,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Googlecast => write!(f, "googlecast"),
            Self::LocalPlayer => write!(f, "local_player"),
        }
    }
}

/// A playback target, immutable once discovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier (cast receiver id, or "local")
    pub id: String,

    /// Display name
    pub name: String,

    /// IPv4 address of the receiver; `None` for the local player
    pub address: Option<String>,

    /// Cast control channel port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Kind of device
    pub device_type: DeviceType,
}

fn default_port() -> u16 {
    CAST_CONTROL_PORT
}

impl Device {
    /// The built-in local player pseudo-device
    #[must_use]
    pub fn local() -> Self {
        Self {
            id: "local".to_string(),
            name: "Local speakers".to_string(),
            address: None,
            port: 0,
            device_type: DeviceType::LocalPlayer,
        }
    }

    /// Whether this device plays directly on the local machine
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.device_type == DeviceType::LocalPlayer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_serde_round_trip() {
        let device = Device {
            id: "ab12".to_string(),
            name: "Living Room".to_string(),
            address: Some("192.168.1.40".to_string()),
            port: 8009,
            device_type: DeviceType::Googlecast,
        };

        let encoded = toml::to_string(&device).unwrap();
        let decoded: Device = toml::from_str(&encoded).unwrap();
        assert_eq!(device, decoded);
    }

    #[test]
    fn device_type_uses_snake_case_tags() {
        let json = serde_json::to_string(&DeviceType::Googlecast).unwrap();
        assert_eq!(json, "\"googlecast\"");
        let json = serde_json::to_string(&DeviceType::LocalPlayer).unwrap();
        assert_eq!(json, "\"local_player\"");
    }

    #[test]
    fn local_device_is_local() {
        let device = Device::local();
        assert!(device.is_local());
        assert_eq!(device.id, "local");
    }

    #[test]
    fn missing_port_defaults_to_control_port() {
        let decoded: Device = toml::from_str(
            "id = \"x\"\nname = \"y\"\ndevice_type = \"googlecast\"\n",
        )
        .unwrap();
        assert_eq!(decoded.port, CAST_CONTROL_PORT);
    }
}
