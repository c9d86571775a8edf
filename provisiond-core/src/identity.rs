//! Device identity derived from the primary MAC address.
//!
//! The identity is generated once, persisted next to the state file and
//! re-derived on every boot; a stored identity that no longer matches the
//! hardware is replaced so that cloned SD card images pick up their own id.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Physical interfaces probed first, ethernet before wireless.
const PRIORITY_INTERFACES: &[&str] = &["eth0", "end0", "enp0s3", "eno1", "wlan0", "wlp1s0"];

/// Interface name prefixes that never carry a board MAC.
const VIRTUAL_PREFIXES: &[&str] = &["docker", "veth", "br-", "virbr"];

const NULL_MAC: &str = "00:00:00:00:00:00";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// 4 lowercase hex chars, the last 4 nibbles of the primary MAC.
    pub device_id: String,
    /// `{prefix}-{device_id}`, prefix lowercased.
    pub hostname: String,
    /// `{Prefix}-{DEVICE_ID}`, prefix capitalised, id uppercased.
    pub ap_ssid: String,
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    pub fn from_mac(mac: &str, prefix: &str) -> Result<Self> {
        let device_id = device_id_from_mac(mac)?;
        let host_prefix = prefix.to_ascii_lowercase();
        Ok(DeviceIdentity {
            hostname: format!("{host_prefix}-{device_id}"),
            ap_ssid: format!("{}-{}", capitalize(prefix), device_id.to_ascii_uppercase()),
            device_id,
            created_at: Utc::now(),
        })
    }
}

/// Extract the device id (last 4 hex nibbles, lowercased) from a MAC string.
pub fn device_id_from_mac(mac: &str) -> Result<String> {
    let clean: String = mac
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();
    if clean.len() != 12 || !clean.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::BadInput(format!("invalid MAC address: {mac}")));
    }
    Ok(clean[8..].to_string())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn read_interface_mac(sys_net: &Path, iface: &str) -> Option<String> {
    let mac = std::fs::read_to_string(sys_net.join(iface).join("address")).ok()?;
    let mac = mac.trim().to_ascii_lowercase();
    if mac.is_empty() || mac == NULL_MAC {
        return None;
    }
    Some(mac)
}

/// MAC address of the primary network interface.
pub fn primary_mac() -> Result<String> {
    primary_mac_in(Path::new("/sys/class/net"))
}

fn primary_mac_in(sys_net: &Path) -> Result<String> {
    for iface in PRIORITY_INTERFACES {
        if let Some(mac) = read_interface_mac(sys_net, iface) {
            tracing::debug!(interface = *iface, mac = %mac, "using priority interface MAC");
            return Ok(mac);
        }
    }

    // Fallback: first non-virtual interface, in stable name order.
    let mut names: Vec<String> = std::fs::read_dir(sys_net)
        .map_err(|_| Error::NoMac)?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    for name in names {
        if name == "lo" || VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        if let Some(mac) = read_interface_mac(sys_net, &name) {
            tracing::debug!(interface = %name, mac = %mac, "using fallback interface MAC");
            return Ok(mac);
        }
    }

    Err(Error::NoMac)
}

/// Loads or creates the persisted device identity.
pub struct IdentityStore {
    file: PathBuf,
}

impl IdentityStore {
    pub fn new(file: PathBuf) -> Self {
        IdentityStore { file }
    }

    /// Load the stored identity, replacing it when it no longer matches the
    /// identity derived from the current hardware.
    pub fn load_or_create(&self, prefix: &str) -> Result<DeviceIdentity> {
        let derived = DeviceIdentity::from_mac(&primary_mac()?, prefix)?;

        if self.file.exists() {
            match self.load() {
                Ok(stored) if stored.hostname == derived.hostname => {
                    tracing::info!(hostname = %stored.hostname, "loaded existing device identity");
                    return Ok(stored);
                }
                Ok(stored) => {
                    tracing::info!(
                        old = %stored.hostname,
                        new = %derived.hostname,
                        "stored identity does not match hardware, regenerating"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load device identity, regenerating");
                }
            }
        } else {
            tracing::info!(hostname = %derived.hostname, "generated new device identity");
        }

        self.save(&derived)?;
        Ok(derived)
    }

    fn load(&self) -> Result<DeviceIdentity> {
        let data = std::fs::read_to_string(&self.file)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn save(&self, identity: &DeviceIdentity) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(identity)?)?;
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_last_four_nibbles() {
        assert_eq!(device_id_from_mac("b8:27:eb:12:34:ab").unwrap(), "34ab");
        assert_eq!(device_id_from_mac("B8-27-EB-12-34-AB").unwrap(), "34ab");
        assert_eq!(device_id_from_mac("b827eb1234ab").unwrap(), "34ab");
    }

    #[test]
    fn malformed_macs_are_rejected() {
        assert!(device_id_from_mac("").is_err());
        assert!(device_id_from_mac("b8:27:eb:12:34").is_err());
        assert!(device_id_from_mac("zz:27:eb:12:34:ab").is_err());
    }

    #[test]
    fn identity_fields_follow_the_naming_scheme() {
        let id = DeviceIdentity::from_mac("b8:27:eb:12:34:ab", "Distiller").unwrap();
        assert_eq!(id.device_id, "34ab");
        assert_eq!(id.hostname, "distiller-34ab");
        assert_eq!(id.ap_ssid, "Distiller-34AB");
    }

    #[test]
    fn lowercase_prefix_is_capitalised_for_the_ssid() {
        let id = DeviceIdentity::from_mac("b8:27:eb:12:34:ab", "widget").unwrap();
        assert_eq!(id.hostname, "widget-34ab");
        assert_eq!(id.ap_ssid, "Widget-34AB");
    }

    fn fake_iface(root: &Path, name: &str, mac: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("address"), format!("{mac}\n")).unwrap();
    }

    #[test]
    fn ethernet_wins_over_wireless() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "wlan0", "aa:bb:cc:dd:ee:01");
        fake_iface(dir.path(), "eth0", "aa:bb:cc:dd:ee:02");
        assert_eq!(primary_mac_in(dir.path()).unwrap(), "aa:bb:cc:dd:ee:02");
    }

    #[test]
    fn all_zero_macs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "eth0", "00:00:00:00:00:00");
        fake_iface(dir.path(), "wlan0", "aa:bb:cc:dd:ee:03");
        assert_eq!(primary_mac_in(dir.path()).unwrap(), "aa:bb:cc:dd:ee:03");
    }

    #[test]
    fn virtual_interfaces_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "lo", "aa:bb:cc:dd:ee:04");
        fake_iface(dir.path(), "docker0", "aa:bb:cc:dd:ee:05");
        fake_iface(dir.path(), "veth12ab", "aa:bb:cc:dd:ee:06");
        fake_iface(dir.path(), "enx001122334455", "aa:bb:cc:dd:ee:07");
        assert_eq!(primary_mac_in(dir.path()).unwrap(), "aa:bb:cc:dd:ee:07");
    }

    #[test]
    fn no_usable_interface_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "lo", "aa:bb:cc:dd:ee:08");
        assert!(matches!(primary_mac_in(dir.path()), Err(Error::NoMac)));
    }

    #[test]
    fn identity_round_trips_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("device.json"));
        let identity = DeviceIdentity::from_mac("b8:27:eb:12:34:ab", "Distiller").unwrap();
        store.save(&identity).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.device_id, identity.device_id);
        assert_eq!(loaded.hostname, identity.hostname);
        assert_eq!(loaded.ap_ssid, identity.ap_ssid);
    }
}
