//! The network backend trait and the data types it traffics in.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tokio::sync::broadcast;

/// Security family of a scanned network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Security {
    Open,
    Wep,
    Wpa,
    Wpa2,
    Wpa3,
}

impl Security {
    /// Map an nmcli SECURITY flags string ("WPA2", "WPA1 WPA2", "--", ...)
    /// to the strongest family it mentions.
    pub fn parse(flags: &str) -> Self {
        let flags = flags.to_ascii_uppercase();
        if flags.contains("WPA3") {
            Security::Wpa3
        } else if flags.contains("WPA2") {
            Security::Wpa2
        } else if flags.contains("WPA") {
            Security::Wpa
        } else if flags.contains("WEP") {
            Security::Wep
        } else {
            Security::Open
        }
    }
}

/// A single Wi-Fi network found during a scan.
#[derive(Debug, Clone, Serialize)]
pub struct WifiNetwork {
    pub ssid: String,
    /// Signal strength, 0 to 100.
    pub signal: u8,
    pub security: Security,
    pub in_use: bool,
}

/// Events surfaced by the OS network daemon, already deduplicated by the
/// backend within a 500 ms window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    ConnectivityLost,
    ConnectivityRestored,
    DeviceDisconnected,
    ConnectionDeactivated { connection: String },
    ActiveConnectionChanged { ssid: String },
}

/// Capability set of the OS network daemon adapter.
///
/// Implementations serialise their own mutating calls; callers additionally
/// guarantee (through the connection lock) that at most one profile
/// activation is in flight process-wide.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Scan for networks, deduplicated by SSID keeping the strongest signal.
    /// Hidden networks are excluded. May serve a cached list while the
    /// radio is busy running the access point.
    async fn scan(&self) -> Result<Vec<WifiNetwork>>;

    /// Names of the stored connection profiles.
    async fn list_profiles(&self) -> Result<Vec<String>>;

    /// Create or replace the profile for `ssid`. An existing profile that
    /// fails the ownership/permission check is deleted first, never reused.
    async fn create_or_update_profile(
        &self,
        ssid: &str,
        psk: Option<&str>,
        hidden: bool,
    ) -> Result<()>;

    async fn delete_profile(&self, name: &str) -> Result<()>;

    /// Activate a stored profile. Bounded by a 30 s wall-clock timeout;
    /// association rejections are retried once internally.
    async fn activate_profile(&self, name: &str) -> Result<()>;

    /// Take down any active station connection.
    async fn deactivate_all_wifi(&self) -> Result<()>;

    /// Bring up the WPA2-PSK access point. Returns once the daemon reports
    /// it active, or fails after 15 s.
    async fn start_ap(&self, ssid: &str, psk: &str, channel: u8, ipv4: Ipv4Addr) -> Result<()>;

    /// Tear the access point down and delete its profile.
    async fn stop_ap(&self) -> Result<()>;

    /// Current IPv4 on the primary WiFi interface.
    async fn primary_ipv4(&self) -> Result<Option<String>>;

    /// SSID of the active station connection, if any. The access point
    /// profile does not count.
    async fn current_ssid(&self) -> Result<Option<String>>;

    /// Signal strength of the in-use network, in dBm.
    async fn signal_dbm(&self) -> Result<Option<i32>>;

    /// Active reachability probe, bounded at 5 s.
    async fn check_connectivity(&self) -> Result<bool>;

    /// Name of the WiFi interface, if one was detected.
    async fn wifi_interface(&self) -> Option<String>;

    /// Subscribe to the backend's network event stream.
    fn watch_events(&self) -> broadcast::Receiver<NetworkEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_parse_picks_the_strongest_family() {
        assert_eq!(Security::parse("WPA2"), Security::Wpa2);
        assert_eq!(Security::parse("WPA1 WPA2"), Security::Wpa2);
        assert_eq!(Security::parse("WPA2 WPA3"), Security::Wpa3);
        assert_eq!(Security::parse("WEP"), Security::Wep);
        assert_eq!(Security::parse(""), Security::Open);
        assert_eq!(Security::parse("--"), Security::Open);
    }

    #[test]
    fn security_serialises_upper_case() {
        assert_eq!(serde_json::to_string(&Security::Wpa2).unwrap(), "\"WPA2\"");
        assert_eq!(serde_json::to_string(&Security::Open).unwrap(), "\"OPEN\"");
    }
}
