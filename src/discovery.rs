//! Cast receiver discovery over mDNS

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::device::{Device, DeviceType};
use crate::{Error, Result};

const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// Browse the local network for Google Cast receivers.
///
/// Blocks (on a worker thread) for the full `timeout` so slow receivers get a
/// chance to answer, then returns the discovered devices with the built-in
/// local player appended. Discovery failure degrades to the local player
/// alone rather than erroring the caller.
pub async fn discover(timeout: Duration) -> Vec<Device> {
    let found = tokio::task::spawn_blocking(move || browse_cast_receivers(timeout)).await;

    let mut devices = match found {
        Ok(Ok(devices)) => devices,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "cast discovery failed, offering local player only");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "discovery task panicked, offering local player only");
            Vec::new()
        }
    };

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    devices.push(Device::local());
    devices
}

fn browse_cast_receivers(timeout: Duration) -> Result<Vec<Device>> {
    let daemon = ServiceDaemon::new().map_err(|e| Error::Discovery(e.to_string()))?;
    let receiver = daemon
        .browse(CAST_SERVICE_TYPE)
        .map_err(|e| Error::Discovery(e.to_string()))?;

    let deadline = Instant::now() + timeout;
    let mut by_id: HashMap<String, Device> = HashMap::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                if let Some(device) = device_from_service(&info) {
                    tracing::debug!(
                        name = %device.name,
                        address = ?device.address,
                        "resolved cast receiver"
                    );
                    by_id.insert(device.id.clone(), device);
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    if let Err(e) = daemon.shutdown() {
        tracing::debug!(error = %e, "mdns daemon shutdown");
    }

    Ok(by_id.into_values().collect())
}

/// Map a resolved mDNS service to a [`Device`], if it carries enough TXT
/// metadata and an IPv4 address.
fn device_from_service(info: &ServiceInfo) -> Option<Device> {
    let address = info
        .get_addresses()
        .iter()
        .find(|addr| matches!(addr, IpAddr::V4(_)))
        .map(ToString::to_string)?;

    let properties = info.get_properties();
    let name = properties
        .get_property_val_str("fn")
        .map(ToString::to_string)
        .unwrap_or_else(|| friendly_instance_name(info.get_fullname()));
    let id = properties
        .get_property_val_str("id")
        .map(ToString::to_string)
        .unwrap_or_else(|| friendly_instance_name(info.get_fullname()));

    Some(Device {
        id,
        name,
        address: Some(address),
        port: info.get_port(),
        device_type: DeviceType::Googlecast,
    })
}

/// Strip the service-type suffix from an mDNS full name, leaving the
/// instance label.
fn friendly_instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(&format!(".{CAST_SERVICE_TYPE}"))
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_service_suffix_from_fullname() {
        let name = friendly_instance_name("Kitchen-abc123._googlecast._tcp.local.");
        assert_eq!(name, "Kitchen-abc123");
    }

    #[test]
    fn leaves_plain_names_alone() {
        assert_eq!(friendly_instance_name("Kitchen"), "Kitchen");
    }

    #[tokio::test]
    async fn discover_always_offers_the_local_player() {
        // Zero timeout: no receivers can answer, the local player remains.
        let devices = discover(Duration::from_millis(0)).await;
        assert!(devices.iter().any(Device::is_local));
    }
}
