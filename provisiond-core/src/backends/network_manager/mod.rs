// NetworkManager backend.
// Drives the OS daemon through `nmcli` argv arrays (no shell) and feeds
// daemon signals back through a broadcast event stream. All mutating calls
// go through this one adapter so the radio only ever does one thing.

use crate::backends::run_command;
use crate::traits::{NetworkBackend, NetworkEvent, Security, WifiNetwork};
use crate::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, timeout};

/// Name of the NetworkManager profile used for the provisioning hotspot.
pub const AP_CONNECTION_NAME: &str = "provisiond-ap";

const PROFILE_DIR: &str = "/etc/NetworkManager/system-connections";
const DEVICE_CACHE_TTL: Duration = Duration::from_secs(300);
const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_SETTLE: Duration = Duration::from_secs(2);
const SCAN_RETRY_DELAY: Duration = Duration::from_secs(2);
const ACTIVATE_TIMEOUT: Duration = Duration::from_secs(30);
const AP_START_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_COALESCE_WINDOW: Duration = Duration::from_millis(500);
const MONITOR_RESTART_DELAY: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Default)]
struct DeviceCache {
    name: Option<String>,
    refreshed_at: Option<Instant>,
}

pub struct NetworkManagerBackend {
    device: Mutex<DeviceCache>,
    ap_active: AtomicBool,
    scan_cache: Mutex<Vec<WifiNetwork>>,
    events_tx: broadcast::Sender<NetworkEvent>,
}

impl NetworkManagerBackend {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        NetworkManagerBackend {
            device: Mutex::new(DeviceCache::default()),
            ap_active: AtomicBool::new(false),
            scan_cache: Mutex::new(Vec::new()),
            events_tx,
        }
    }

    /// Detect the WiFi interface once at startup. Fatal when none exists.
    pub async fn initialize(&self) -> Result<String> {
        match self.wifi_device().await {
            Some(device) => {
                tracing::info!(device = %device, "WiFi device detected");
                Ok(device)
            }
            None => Err(Error::NoDevice),
        }
    }

    async fn wifi_device(&self) -> Option<String> {
        let mut cache = self.device.lock().await;
        if let (Some(name), Some(at)) = (&cache.name, cache.refreshed_at) {
            if at.elapsed() < DEVICE_CACHE_TTL {
                return Some(name.clone());
            }
        }

        let detected = detect_wifi_device().await;
        if detected.is_some() {
            cache.name = detected.clone();
            cache.refreshed_at = Some(Instant::now());
        }
        // Keep a stale name rather than none if re-detection hiccupped.
        detected.or_else(|| cache.name.clone())
    }

    async fn require_device(&self) -> Result<String> {
        self.wifi_device().await.ok_or(Error::NoDevice)
    }

    async fn rescan(&self) -> Result<()> {
        let out = run_command("nmcli", &["device", "wifi", "rescan"]).await?;
        if out.success {
            return Ok(());
        }
        if is_scan_busy(&out.stderr) {
            sleep(SCAN_RETRY_DELAY).await;
            let retry = run_command("nmcli", &["device", "wifi", "rescan"]).await?;
            if retry.success {
                return Ok(());
            }
            if is_scan_busy(&retry.stderr) {
                return Err(Error::ScanBusy);
            }
            return Err(Error::CommandFailed(format!(
                "nmcli rescan failed: {}",
                retry.stderr
            )));
        }
        Err(Error::CommandFailed(format!(
            "nmcli rescan failed: {}",
            out.stderr
        )))
    }

    async fn active_connection_name(&self, device: &str) -> Result<Option<String>> {
        let out = run_command(
            "nmcli",
            &["-t", "-f", "GENERAL.CONNECTION", "device", "show", device],
        )
        .await?;
        if !out.success {
            return Ok(None);
        }
        for line in out.stdout.lines() {
            if let Some(value) = line.strip_prefix("GENERAL.CONNECTION:") {
                let value = value.trim();
                if !value.is_empty() && value != "--" {
                    return Ok(Some(value.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn validate_profile(&self, name: &str) -> bool {
        let candidates = [
            PathBuf::from(format!("{PROFILE_DIR}/{name}.nmconnection")),
            PathBuf::from(format!("{PROFILE_DIR}/{name}")),
        ];
        let Some(path) = candidates.iter().find(|p| p.exists()) else {
            // Managed purely by the daemon, nothing on disk to distrust.
            return true;
        };

        match std::fs::metadata(path) {
            Ok(meta) => {
                if meta.uid() != 0 {
                    tracing::warn!(profile = name, uid = meta.uid(), "profile not owned by root");
                    return false;
                }
                let mode = meta.mode() & 0o777;
                if mode != 0o600 {
                    tracing::warn!(profile = name, mode = %format!("{mode:o}"), "profile has insecure permissions");
                    return false;
                }
                true
            }
            Err(e) => {
                tracing::warn!(profile = name, error = %e, "cannot stat profile file");
                false
            }
        }
    }

    async fn activate_once(&self, name: &str) -> Result<()> {
        let out = run_command("nmcli", &["-w", "28", "connection", "up", name]).await?;
        if out.success {
            Ok(())
        } else {
            Err(classify_activation_error(&out.stderr))
        }
    }

    async fn scan_once(&self) -> Result<Vec<WifiNetwork>> {
        self.rescan().await?;
        sleep(SCAN_SETTLE).await;

        let out = run_command(
            "nmcli",
            &[
                "-t",
                "-f",
                "SSID,SIGNAL,SECURITY,IN-USE",
                "device",
                "wifi",
                "list",
            ],
        )
        .await?;
        if !out.success {
            return Err(Error::CommandFailed(format!(
                "nmcli wifi list failed: {}",
                out.stderr
            )));
        }

        Ok(parse_wifi_list(&out.stdout))
    }
}

impl Default for NetworkManagerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkBackend for NetworkManagerBackend {
    async fn scan(&self) -> Result<Vec<WifiNetwork>> {
        // The radio cannot scan while it broadcasts the hotspot; serve the
        // list captured before AP entry.
        if self.ap_active.load(Ordering::SeqCst) {
            return Ok(self.scan_cache.lock().await.clone());
        }

        self.require_device().await?;
        let networks = match timeout(SCAN_TIMEOUT, self.scan_once()).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::CommandFailed("scan timed out".into())),
        };

        *self.scan_cache.lock().await = networks.clone();
        Ok(networks)
    }

    async fn list_profiles(&self) -> Result<Vec<String>> {
        let out = run_command("nmcli", &["-t", "-f", "NAME,TYPE", "connection", "show"]).await?;
        if !out.success {
            return Err(Error::CommandFailed(format!(
                "nmcli connection show failed: {}",
                out.stderr
            )));
        }
        Ok(parse_profile_list(&out.stdout))
    }

    async fn create_or_update_profile(
        &self,
        ssid: &str,
        psk: Option<&str>,
        hidden: bool,
    ) -> Result<()> {
        let device = self.require_device().await?;

        if self.list_profiles().await?.iter().any(|n| n == ssid) {
            if !self.validate_profile(ssid).await {
                tracing::warn!(profile = ssid, "existing profile failed validation, recreating");
            }
            self.delete_profile(ssid).await?;
        }

        let mut args: Vec<String> = vec![
            "connection".into(),
            "add".into(),
            "type".into(),
            "wifi".into(),
            "con-name".into(),
            ssid.into(),
            "ifname".into(),
            device,
            "ssid".into(),
            ssid.into(),
        ];
        if hidden {
            args.push("802-11-wireless.hidden".into());
            args.push("yes".into());
        }
        if let Some(psk) = psk {
            args.push("802-11-wireless-security.key-mgmt".into());
            args.push("wpa-psk".into());
            args.push("802-11-wireless-security.psk".into());
            args.push(psk.into());
        }

        let out = run_command("nmcli", &args).await?;
        if !out.success {
            return Err(Error::CommandFailed(format!(
                "failed to create profile for '{ssid}': {}",
                out.stderr
            )));
        }
        Ok(())
    }

    async fn delete_profile(&self, name: &str) -> Result<()> {
        let out = run_command("nmcli", &["connection", "delete", name]).await?;
        if out.success || out.stderr.to_lowercase().contains("unknown connection") {
            Ok(())
        } else {
            Err(Error::CommandFailed(format!(
                "failed to delete profile '{name}': {}",
                out.stderr
            )))
        }
    }

    async fn activate_profile(&self, name: &str) -> Result<()> {
        let attempt = timeout(ACTIVATE_TIMEOUT, async {
            match self.activate_once(name).await {
                // Association rejections are frequently transient; one retry.
                Err(Error::AssocFailed) => {
                    tracing::warn!(profile = name, "association rejected, retrying once");
                    self.activate_once(name).await
                }
                other => other,
            }
        })
        .await;

        match attempt {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout),
        }
    }

    async fn deactivate_all_wifi(&self) -> Result<()> {
        let device = self.require_device().await?;
        if let Some(connection) = self.active_connection_name(&device).await? {
            let out = run_command("nmcli", &["connection", "down", &connection]).await?;
            if out.success {
                tracing::info!(connection = %connection, "station connection deactivated");
            }
        }
        Ok(())
    }

    async fn start_ap(&self, ssid: &str, psk: &str, channel: u8, ipv4: Ipv4Addr) -> Result<()> {
        let device = self.require_device().await?;

        // Capture a scan before the radio flips into AP mode so the setup
        // page has something to show.
        if !self.ap_active.load(Ordering::SeqCst) && self.scan_cache.lock().await.is_empty() {
            if let Err(e) = self.scan().await {
                tracing::warn!(error = %e, "pre-AP scan failed");
            }
        }

        let _ = self.delete_profile(AP_CONNECTION_NAME).await;

        let channel = channel.to_string();
        let addresses = format!("{ipv4}/24");
        let args: Vec<&str> = vec![
            "connection",
            "add",
            "type",
            "wifi",
            "ifname",
            &device,
            "con-name",
            AP_CONNECTION_NAME,
            "autoconnect",
            "no",
            "ssid",
            ssid,
            "mode",
            "ap",
            "802-11-wireless.band",
            "bg",
            "802-11-wireless.channel",
            &channel,
            "802-11-wireless-security.key-mgmt",
            "wpa-psk",
            "802-11-wireless-security.psk",
            psk,
            "ipv4.method",
            "shared",
            "ipv4.addresses",
            &addresses,
            "ipv6.method",
            "disabled",
        ];
        let out = run_command("nmcli", &args).await?;
        if !out.success {
            return Err(Error::ApStartFailed(out.stderr));
        }

        let up = timeout(
            AP_START_TIMEOUT,
            run_command("nmcli", &["connection", "up", AP_CONNECTION_NAME]),
        )
        .await;
        match up {
            Ok(Ok(out)) if out.success => {
                self.ap_active.store(true, Ordering::SeqCst);
                tracing::info!(ssid, "access point active");
                Ok(())
            }
            Ok(Ok(out)) => {
                let _ = self.delete_profile(AP_CONNECTION_NAME).await;
                Err(Error::ApStartFailed(out.stderr))
            }
            Ok(Err(e)) => {
                let _ = self.delete_profile(AP_CONNECTION_NAME).await;
                Err(Error::ApStartFailed(e.to_string()))
            }
            Err(_) => {
                let _ = self.delete_profile(AP_CONNECTION_NAME).await;
                Err(Error::ApStartFailed("activation timed out".into()))
            }
        }
    }

    async fn stop_ap(&self) -> Result<()> {
        let _ = run_command("nmcli", &["connection", "down", AP_CONNECTION_NAME]).await;
        let _ = self.delete_profile(AP_CONNECTION_NAME).await;
        self.ap_active.store(false, Ordering::SeqCst);
        // Give the daemon a moment to release the interface.
        sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn primary_ipv4(&self) -> Result<Option<String>> {
        let device = self.require_device().await?;
        let out = run_command(
            "nmcli",
            &["-t", "-f", "IP4.ADDRESS", "device", "show", &device],
        )
        .await?;
        if !out.success {
            return Ok(None);
        }
        Ok(parse_ip4_address(&out.stdout))
    }

    async fn current_ssid(&self) -> Result<Option<String>> {
        let device = self.require_device().await?;
        let Some(connection) = self.active_connection_name(&device).await? else {
            return Ok(None);
        };
        if connection == AP_CONNECTION_NAME {
            return Ok(None);
        }

        let out = run_command(
            "nmcli",
            &[
                "-t",
                "-f",
                "802-11-wireless.ssid",
                "connection",
                "show",
                &connection,
            ],
        )
        .await?;
        if !out.success {
            return Ok(None);
        }
        for line in out.stdout.lines() {
            if let Some(value) = line.strip_prefix("802-11-wireless.ssid:") {
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(Some(value.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn signal_dbm(&self) -> Result<Option<i32>> {
        let out = run_command(
            "nmcli",
            &["-t", "-f", "IN-USE,SIGNAL", "device", "wifi", "list"],
        )
        .await?;
        if !out.success {
            return Ok(None);
        }
        Ok(parse_in_use_signal(&out.stdout).map(signal_percent_to_dbm))
    }

    async fn check_connectivity(&self) -> Result<bool> {
        match timeout(
            CONNECTIVITY_TIMEOUT,
            run_command("ping", &["-c", "1", "-W", "2", "8.8.8.8"]),
        )
        .await
        {
            Ok(Ok(out)) => Ok(out.success),
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    async fn wifi_interface(&self) -> Option<String> {
        self.wifi_device().await
    }

    fn watch_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events_tx.subscribe()
    }
}

impl NetworkManagerBackend {
    /// Spawn the long-lived `nmcli monitor` reader. Restarts the child when
    /// it dies; events are coalesced and fanned out on the broadcast bus.
    pub fn spawn_monitor(self: Arc<Self>) {
        tokio::spawn(async move {
            let backend = self;
            loop {
                if let Err(e) = backend.monitor_once().await {
                    tracing::warn!(error = %e, "network event monitor terminated");
                }
                sleep(MONITOR_RESTART_DELAY).await;
                tracing::info!("restarting network event monitor");
            }
        });
    }

    async fn monitor_once(&self) -> Result<()> {
        let device = self.wifi_device().await;
        let mut child = Command::new("nmcli")
            .arg("monitor")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::CommandFailed("nmcli monitor has no stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut last_event: Option<(NetworkEvent, Instant)> = None;
        while let Some(line) = lines.next_line().await? {
            let Some(event) = parse_monitor_line(&line, device.as_deref(), AP_CONNECTION_NAME)
            else {
                continue;
            };
            if let Some((previous, at)) = &last_event {
                if *previous == event && at.elapsed() < EVENT_COALESCE_WINDOW {
                    continue;
                }
            }
            tracing::debug!(?event, "network event");
            last_event = Some((event.clone(), Instant::now()));
            let _ = self.events_tx.send(event);
        }

        let _ = child.wait().await;
        Err(Error::CommandFailed("nmcli monitor stream ended".into()))
    }
}

async fn detect_wifi_device() -> Option<String> {
    let out = run_command("nmcli", &["-t", "-f", "DEVICE,TYPE,STATE", "device"])
        .await
        .ok()?;
    if !out.success {
        return None;
    }
    pick_wifi_device(&out.stdout)
}

/// Choose the WiFi interface, preferring connected > disconnected > any.
fn pick_wifi_device(output: &str) -> Option<String> {
    let mut devices: Vec<(String, String)> = Vec::new();
    for line in output.lines() {
        let parts = split_escaped(line, ':');
        if parts.len() >= 3 && parts[1] == "wifi" {
            devices.push((parts[0].clone(), parts[2].clone()));
        }
    }

    for wanted in ["connected", "disconnected"] {
        if let Some((name, _)) = devices.iter().find(|(_, state)| state == wanted) {
            return Some(name.clone());
        }
    }
    devices.first().map(|(name, _)| name.clone())
}

/// Split an `nmcli -t` line on `sep`, honouring backslash escapes so that
/// SSIDs containing the separator survive.
fn split_escaped(line: &str, sep: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                current.push(escaped);
            }
        } else if c == sep {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}

/// Parse `nmcli -t -f SSID,SIGNAL,SECURITY,IN-USE device wifi list` output.
/// Hidden networks are dropped; duplicates keep the strongest signal.
fn parse_wifi_list(output: &str) -> Vec<WifiNetwork> {
    let mut strongest: HashMap<String, WifiNetwork> = HashMap::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts = split_escaped(line, ':');
        if parts.len() < 4 {
            continue;
        }
        let ssid = parts[0].clone();
        if ssid.is_empty() || ssid == "\\x00" {
            continue;
        }
        let signal: u8 = parts[1].parse().unwrap_or(0);
        let security = Security::parse(&parts[2]);
        let in_use = parts[3] == "*";

        match strongest.get_mut(&ssid) {
            Some(existing) => {
                if signal > existing.signal {
                    existing.signal = signal;
                    existing.security = security;
                }
                existing.in_use |= in_use;
            }
            None => {
                strongest.insert(
                    ssid.clone(),
                    WifiNetwork {
                        ssid,
                        signal,
                        security,
                        in_use,
                    },
                );
            }
        }
    }

    let mut networks: Vec<WifiNetwork> = strongest.into_values().collect();
    networks.sort_by(|a, b| b.signal.cmp(&a.signal).then_with(|| a.ssid.cmp(&b.ssid)));
    networks
}

fn parse_profile_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let parts = split_escaped(line, ':');
            if parts.len() >= 2 && parts[1].contains("wireless") {
                Some(parts[0].clone())
            } else {
                None
            }
        })
        .collect()
}

fn parse_ip4_address(output: &str) -> Option<String> {
    for line in output.lines() {
        if line.starts_with("IP4.ADDRESS") {
            let value = line.splitn(2, ':').nth(1)?.trim();
            let address = value.split('/').next()?.trim();
            if !address.is_empty() {
                return Some(address.to_string());
            }
        }
    }
    None
}

fn parse_in_use_signal(output: &str) -> Option<u8> {
    for line in output.lines() {
        let parts = split_escaped(line, ':');
        if parts.len() >= 2 && parts[0] == "*" {
            return parts[1].parse().ok();
        }
    }
    None
}

/// nmcli reports percent; the rest of the system speaks dBm.
fn signal_percent_to_dbm(percent: u8) -> i32 {
    i32::from(percent.min(100)) / 2 - 100
}

fn is_scan_busy(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("scanning not allowed") || lower.contains("scan request failed")
}

/// Map nmcli activation stderr onto the adapter's typed failures.
fn classify_activation_error(stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("secrets were required") {
        Error::AuthFailed
    } else if lower.contains("ip configuration could not be reserved") {
        Error::DhcpFailed
    } else if lower.contains("association") || lower.contains("assoc") {
        Error::AssocFailed
    } else if lower.contains("timeout was reached") {
        Error::ConnectTimeout
    } else {
        Error::CommandFailed(format!("activation failed: {stderr}"))
    }
}

fn quoted_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'([^']+)'").expect("static regex"))
}

/// Interpret one `nmcli monitor` line. Returns `None` for noise.
fn parse_monitor_line(
    line: &str,
    wifi_device: Option<&str>,
    ap_connection: &str,
) -> Option<NetworkEvent> {
    let lower = line.to_lowercase();

    if lower.contains("connectivity is now") {
        if lower.contains("none") {
            return Some(NetworkEvent::ConnectivityLost);
        }
        if lower.contains("full") {
            return Some(NetworkEvent::ConnectivityRestored);
        }
        return None;
    }

    if let Some(device) = wifi_device {
        if line.contains(device) {
            if lower.contains("using connection") {
                if let Some(captures) = quoted_name_re().captures(line) {
                    return Some(NetworkEvent::ActiveConnectionChanged {
                        ssid: captures[1].to_string(),
                    });
                }
            }
            if lower.contains("disconnected") {
                return Some(NetworkEvent::DeviceDisconnected);
            }
        }
    }

    if lower.contains("deactivated") || lower.contains("deactivating") {
        if let Some(captures) = quoted_name_re().captures(line) {
            let connection = captures[1].to_string();
            if connection != ap_connection {
                return Some(NetworkEvent::ConnectionDeactivated { connection });
            }
        }
        return None;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wifi_list_dedupes_by_strongest_signal() {
        let output = "HomeNet:72:WPA2:\nHomeNet:55:WPA2:\nCafe:40:WPA1 WPA2:*\n";
        let networks = parse_wifi_list(output);
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].ssid, "HomeNet");
        assert_eq!(networks[0].signal, 72);
        assert_eq!(networks[1].ssid, "Cafe");
        assert!(networks[1].in_use);
        assert_eq!(networks[1].security, Security::Wpa2);
    }

    #[test]
    fn hidden_networks_are_dropped() {
        let output = ":80:WPA2:\n\\x00:75:WPA2:\nVisible:50::\n";
        let networks = parse_wifi_list(output);
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].ssid, "Visible");
        assert_eq!(networks[0].security, Security::Open);
    }

    #[test]
    fn escaped_colons_in_ssids_survive() {
        let output = "Cafe\\: Lounge:61:WPA2:\n";
        let networks = parse_wifi_list(output);
        assert_eq!(networks[0].ssid, "Cafe: Lounge");
        assert_eq!(networks[0].signal, 61);
    }

    #[test]
    fn device_selection_prefers_connected() {
        let output = "eth0:ethernet:connected\nwlan1:wifi:unavailable\nwlan0:wifi:connected\n";
        assert_eq!(pick_wifi_device(output).as_deref(), Some("wlan0"));

        let output = "wlan1:wifi:unavailable\nwlan0:wifi:disconnected\n";
        assert_eq!(pick_wifi_device(output).as_deref(), Some("wlan0"));

        let output = "wlan1:wifi:unavailable\n";
        assert_eq!(pick_wifi_device(output).as_deref(), Some("wlan1"));

        assert_eq!(pick_wifi_device("eth0:ethernet:connected\n"), None);
    }

    #[test]
    fn activation_errors_are_classified() {
        assert!(matches!(
            classify_activation_error("Error: Secrets were required, but not provided."),
            Error::AuthFailed
        ));
        assert!(matches!(
            classify_activation_error("Error: IP configuration could not be reserved"),
            Error::DhcpFailed
        ));
        assert!(matches!(
            classify_activation_error("802.11 association took too long"),
            Error::AssocFailed
        ));
        assert!(matches!(
            classify_activation_error("Error: Timeout was reached"),
            Error::ConnectTimeout
        ));
        assert!(matches!(
            classify_activation_error("something exotic"),
            Error::CommandFailed(_)
        ));
    }

    #[test]
    fn monitor_lines_map_to_events() {
        assert_eq!(
            parse_monitor_line("Connectivity is now 'none'", Some("wlan0"), "provisiond-ap"),
            Some(NetworkEvent::ConnectivityLost)
        );
        assert_eq!(
            parse_monitor_line("Connectivity is now 'full'", Some("wlan0"), "provisiond-ap"),
            Some(NetworkEvent::ConnectivityRestored)
        );
        assert_eq!(
            parse_monitor_line("Connectivity is now 'limited'", Some("wlan0"), "provisiond-ap"),
            None
        );
        assert_eq!(
            parse_monitor_line("wlan0: disconnected", Some("wlan0"), "provisiond-ap"),
            Some(NetworkEvent::DeviceDisconnected)
        );
        assert_eq!(
            parse_monitor_line("wlan0: using connection 'HomeNet'", Some("wlan0"), "provisiond-ap"),
            Some(NetworkEvent::ActiveConnectionChanged {
                ssid: "HomeNet".into()
            })
        );
        assert_eq!(
            parse_monitor_line(
                "Connection 'HomeNet' deactivated",
                Some("wlan0"),
                "provisiond-ap"
            ),
            Some(NetworkEvent::ConnectionDeactivated {
                connection: "HomeNet".into()
            })
        );
        // Our own hotspot going down is not a loss event.
        assert_eq!(
            parse_monitor_line(
                "Connection 'provisiond-ap' deactivated",
                Some("wlan0"),
                "provisiond-ap"
            ),
            None
        );
    }

    #[test]
    fn ip4_address_strips_the_prefix_length() {
        let output = "IP4.ADDRESS[1]:192.168.1.23/24\nIP4.GATEWAY:192.168.1.1\n";
        assert_eq!(parse_ip4_address(output).as_deref(), Some("192.168.1.23"));
        assert_eq!(parse_ip4_address("IP4.GATEWAY:192.168.1.1\n"), None);
    }

    #[test]
    fn in_use_signal_is_found() {
        let output = ":80\n*:64\n:12\n";
        assert_eq!(parse_in_use_signal(output), Some(64));
        assert_eq!(parse_in_use_signal(":80\n"), None);
    }

    #[test]
    fn percent_to_dbm_is_monotonic() {
        assert_eq!(signal_percent_to_dbm(100), -50);
        assert_eq!(signal_percent_to_dbm(0), -100);
        assert!(signal_percent_to_dbm(80) > signal_percent_to_dbm(30));
    }

    #[test]
    fn busy_scans_are_recognised() {
        assert!(is_scan_busy(
            "Error: Scanning not allowed immediately following previous scan."
        ));
        assert!(!is_scan_busy("Error: Device 'wlan0' not found."));
    }

    #[test]
    fn profile_list_keeps_only_wireless_entries() {
        let output = "HomeNet:802-11-wireless\neth0-conn:802-3-ethernet\nCafe:802-11-wireless\n";
        assert_eq!(parse_profile_list(output), vec!["HomeNet", "Cafe"]);
    }
}
