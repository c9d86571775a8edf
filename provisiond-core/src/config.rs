//! Typed runtime configuration built from `APP_*` environment variables.
//!
//! Every knob has a default suitable for the target board; invalid values
//! abort startup instead of being silently replaced.

use crate::{Error, Result};
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "APP_";

/// Which tunnel provider to try first once the device is online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryProvider {
    Managed,
    Ssh,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Literal prefix for the AP SSID (and, lowercased, for the hostname).
    pub ap_ssid_prefix: String,
    pub ap_ip: Ipv4Addr,
    /// 2.4 GHz channel, 1-11.
    pub ap_channel: u8,
    pub web_host: IpAddr,
    pub web_port: u16,
    pub state_dir: PathBuf,
    pub enable_captive_portal: bool,
    pub tunnel_enabled: bool,
    pub tunnel_provider_primary: PrimaryProvider,
    pub tunnel_ssh_host: String,
    pub tunnel_ssh_port: u16,
    /// If set, the SSH relay grants long-lived tunnels.
    pub tunnel_access_token: Option<String>,
    pub tunnel_refresh_interval: Duration,
    /// Domain under which the managed provider exposes devices.
    pub managed_domain: String,
    /// systemd unit of the managed reverse-proxy client.
    pub managed_service: String,
    /// Env file holding the pre-issued device serial (`SERIAL=` line).
    pub device_env_path: PathBuf,
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            ap_ssid_prefix: "Distiller".to_string(),
            ap_ip: Ipv4Addr::new(192, 168, 4, 1),
            ap_channel: 6,
            web_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            web_port: 8080,
            state_dir: PathBuf::from("/var/lib/provisiond"),
            enable_captive_portal: true,
            tunnel_enabled: true,
            tunnel_provider_primary: PrimaryProvider::Managed,
            tunnel_ssh_host: "a.pinggy.io".to_string(),
            tunnel_ssh_port: 443,
            tunnel_access_token: None,
            tunnel_refresh_interval: Duration::from_secs(3300),
            managed_domain: "devices.pamir.ai".to_string(),
            managed_service: "frpc.service".to_string(),
            device_env_path: PathBuf::from("/etc/provisiond/device.env"),
            debug: false,
        }
    }
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Build settings from an arbitrary key lookup. Keys are the bare names
    /// from the configuration table, without the `APP_` prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(v) = non_empty(lookup("AP_SSID_PREFIX")) {
            settings.ap_ssid_prefix = v;
        }
        if let Some(v) = non_empty(lookup("AP_IP")) {
            settings.ap_ip = parse_value("AP_IP", &v)?;
        }
        if let Some(v) = non_empty(lookup("AP_CHANNEL")) {
            settings.ap_channel = parse_value("AP_CHANNEL", &v)?;
        }
        if let Some(v) = non_empty(lookup("WEB_HOST")) {
            settings.web_host = parse_value("WEB_HOST", &v)?;
        }
        if let Some(v) = non_empty(lookup("WEB_PORT")) {
            settings.web_port = parse_value("WEB_PORT", &v)?;
        }
        if let Some(v) = non_empty(lookup("STATE_DIR")) {
            settings.state_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty(lookup("ENABLE_CAPTIVE_PORTAL")) {
            settings.enable_captive_portal = parse_bool("ENABLE_CAPTIVE_PORTAL", &v)?;
        }
        if let Some(v) = non_empty(lookup("TUNNEL_ENABLED")) {
            settings.tunnel_enabled = parse_bool("TUNNEL_ENABLED", &v)?;
        }
        if let Some(v) = non_empty(lookup("TUNNEL_PROVIDER_PRIMARY")) {
            settings.tunnel_provider_primary = match v.to_ascii_lowercase().as_str() {
                "managed" => PrimaryProvider::Managed,
                "ssh" => PrimaryProvider::Ssh,
                other => {
                    return Err(Error::Config(format!(
                        "TUNNEL_PROVIDER_PRIMARY must be 'managed' or 'ssh', got '{other}'"
                    )))
                }
            };
        }
        if let Some(v) = non_empty(lookup("TUNNEL_SSH_HOST")) {
            settings.tunnel_ssh_host = v;
        }
        if let Some(v) = non_empty(lookup("TUNNEL_SSH_PORT")) {
            settings.tunnel_ssh_port = parse_value("TUNNEL_SSH_PORT", &v)?;
        }
        if let Some(v) = non_empty(lookup("TUNNEL_ACCESS_TOKEN")) {
            settings.tunnel_access_token = Some(v);
        }
        if let Some(v) = non_empty(lookup("TUNNEL_REFRESH_INTERVAL_S")) {
            let secs: u64 = parse_value("TUNNEL_REFRESH_INTERVAL_S", &v)?;
            settings.tunnel_refresh_interval = Duration::from_secs(secs);
        }
        if let Some(v) = non_empty(lookup("MANAGED_DOMAIN")) {
            settings.managed_domain = v;
        }
        if let Some(v) = non_empty(lookup("MANAGED_SERVICE")) {
            settings.managed_service = v;
        }
        if let Some(v) = non_empty(lookup("DEVICE_ENV_PATH")) {
            settings.device_env_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty(lookup("DEBUG")) {
            settings.debug = parse_bool("DEBUG", &v)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=11).contains(&self.ap_channel) {
            return Err(Error::Config(format!(
                "AP_CHANNEL must be between 1 and 11, got {}",
                self.ap_channel
            )));
        }
        if self.web_port == 0 {
            return Err(Error::Config("WEB_PORT must be non-zero".into()));
        }
        if self.tunnel_refresh_interval < Duration::from_secs(60) {
            return Err(Error::Config(
                "TUNNEL_REFRESH_INTERVAL_S must be at least 60".into(),
            ));
        }
        if self.ap_ssid_prefix.is_empty() || self.ap_ssid_prefix.len() > 16 {
            return Err(Error::Config(
                "AP_SSID_PREFIX must be 1-16 characters".into(),
            ));
        }
        if !self
            .ap_ssid_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::Config(
                "AP_SSID_PREFIX may only contain ASCII letters, digits and '-'".into(),
            ));
        }
        Ok(())
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn device_file(&self) -> PathBuf {
        self.state_dir.join("device.json")
    }

    /// Base URL of the setup page as reachable from AP clients.
    pub fn portal_base_url(&self) -> String {
        format!("http://{}:{}/", self.ap_ip, self.web_port)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}: cannot parse '{raw}': {e}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(map: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> = map
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = from_map(&[]).unwrap();
        assert_eq!(settings.ap_ssid_prefix, "Distiller");
        assert_eq!(settings.ap_ip, Ipv4Addr::new(192, 168, 4, 1));
        assert_eq!(settings.ap_channel, 6);
        assert_eq!(settings.web_port, 8080);
        assert!(settings.enable_captive_portal);
        assert!(settings.tunnel_enabled);
        assert_eq!(settings.tunnel_provider_primary, PrimaryProvider::Managed);
        assert_eq!(settings.tunnel_ssh_host, "a.pinggy.io");
        assert_eq!(settings.tunnel_refresh_interval, Duration::from_secs(3300));
        assert!(settings.tunnel_access_token.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let settings = from_map(&[
            ("AP_SSID_PREFIX", "Widget"),
            ("AP_CHANNEL", "11"),
            ("WEB_PORT", "9090"),
            ("TUNNEL_PROVIDER_PRIMARY", "ssh"),
            ("TUNNEL_ACCESS_TOKEN", "tok123"),
            ("ENABLE_CAPTIVE_PORTAL", "false"),
        ])
        .unwrap();
        assert_eq!(settings.ap_ssid_prefix, "Widget");
        assert_eq!(settings.ap_channel, 11);
        assert_eq!(settings.web_port, 9090);
        assert_eq!(settings.tunnel_provider_primary, PrimaryProvider::Ssh);
        assert_eq!(settings.tunnel_access_token.as_deref(), Some("tok123"));
        assert!(!settings.enable_captive_portal);
    }

    #[test]
    fn invalid_channel_is_rejected() {
        assert!(from_map(&[("AP_CHANNEL", "13")]).is_err());
        assert!(from_map(&[("AP_CHANNEL", "0")]).is_err());
        assert!(from_map(&[("AP_CHANNEL", "six")]).is_err());
    }

    #[test]
    fn invalid_bool_is_rejected() {
        assert!(from_map(&[("DEBUG", "maybe")]).is_err());
    }

    #[test]
    fn empty_values_fall_back_to_defaults() {
        let settings = from_map(&[("AP_SSID_PREFIX", ""), ("WEB_PORT", " ")]).unwrap();
        assert_eq!(settings.ap_ssid_prefix, "Distiller");
        assert_eq!(settings.web_port, 8080);
    }

    #[test]
    fn portal_base_url_uses_ap_address() {
        let settings = from_map(&[("WEB_PORT", "8888")]).unwrap();
        assert_eq!(settings.portal_base_url(), "http://192.168.4.1:8888/");
    }
}
