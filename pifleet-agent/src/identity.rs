//! Device identity resolution.
//!
//! A device is addressed on the bus by its primary MAC address
//! (colon-separated, lowercase). Interface selection prefers wired over
//! wireless over anything else, so the id stays stable when a WiFi
//! dongle comes and goes.

use if_addrs::get_if_addrs;
use mac_address::MacAddress;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("cannot resolve device identity: {0}")]
    IdentityUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterfaceKind {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    pub mac: String,
    pub kind: InterfaceKind,
}

/// Resolved identity of this device.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Colon-form lowercase MAC; the key for every topic and record.
    pub device_id: String,
    pub hostname: String,
    pub interface: String,
}

/// Resolve this device's identity from its network interfaces.
pub fn resolve_identity() -> Result<DeviceIdentity, AgentError> {
    let interfaces = enumerate_interfaces()?;
    let primary = select_primary(&interfaces)?;

    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    info!(
        "resolved identity {} via {} ({})",
        primary.mac, primary.name, hostname
    );

    Ok(DeviceIdentity {
        device_id: primary.mac.clone(),
        hostname,
        interface: primary.name.clone(),
    })
}

fn enumerate_interfaces() -> Result<Vec<NetInterface>, AgentError> {
    let if_addrs = get_if_addrs()
        .map_err(|e| AgentError::IdentityUnavailable(format!("interface enumeration: {e}")))?;

    let mut interfaces = Vec::new();
    for if_addr in if_addrs {
        if if_addr.is_loopback() {
            continue;
        }

        match interface_mac(&if_addr.name) {
            Some(mac) => {
                let interface = NetInterface {
                    kind: classify_interface(&if_addr.name),
                    name: if_addr.name,
                    mac: format_mac(&mac),
                };
                debug!("found interface {} ({})", interface.name, interface.mac);
                interfaces.push(interface);
            }
            None => debug!("no MAC for interface {}", if_addr.name),
        }
    }
    Ok(interfaces)
}

fn interface_mac(name: &str) -> Option<MacAddress> {
    match mac_address::mac_address_by_name(name) {
        Ok(mac) => mac,
        Err(e) => {
            debug!("error reading MAC for {}: {}", name, e);
            None
        }
    }
}

fn format_mac(mac: &MacAddress) -> String {
    let b = mac.bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

fn classify_interface(name: &str) -> InterfaceKind {
    let name = name.to_lowercase();
    if name == "lo" || name.starts_with("lo") && name.len() <= 3 {
        return InterfaceKind::Loopback;
    }
    if name.starts_with("wlan")
        || name.starts_with("wlp")
        || name.starts_with("wlo")
        || name.contains("wifi")
    {
        return InterfaceKind::Wireless;
    }
    if name.starts_with("eth") || name.starts_with("en") {
        return InterfaceKind::Ethernet;
    }
    InterfaceKind::Other
}

/// Wired > wireless > whatever is left.
fn select_primary(interfaces: &[NetInterface]) -> Result<&NetInterface, AgentError> {
    if let Some(eth) = interfaces.iter().find(|i| i.kind == InterfaceKind::Ethernet) {
        return Ok(eth);
    }
    if let Some(wifi) = interfaces.iter().find(|i| i.kind == InterfaceKind::Wireless) {
        warn!("no ethernet interface, using wireless {}", wifi.name);
        return Ok(wifi);
    }
    interfaces
        .iter()
        .find(|i| i.kind != InterfaceKind::Loopback)
        .ok_or_else(|| AgentError::IdentityUnavailable("no usable network interface".into()))
}
