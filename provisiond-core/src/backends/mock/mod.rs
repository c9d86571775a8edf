//! A mock backend for tests and bench-top runs without real hardware.
//!
//! Behaviour is scripted through setters; `activate_profile` keeps a
//! concurrency gauge so tests can assert that the connection lock admits
//! only one attempt at a time.

use crate::traits::{NetworkBackend, NetworkEvent, Security, WifiNetwork};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// What a scripted activation attempt should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Success,
    AuthFail,
    AssocFail,
    DhcpFail,
    Timeout,
}

impl ConnectOutcome {
    fn into_result(self) -> Result<()> {
        match self {
            ConnectOutcome::Success => Ok(()),
            ConnectOutcome::AuthFail => Err(Error::AuthFailed),
            ConnectOutcome::AssocFail => Err(Error::AssocFailed),
            ConnectOutcome::DhcpFail => Err(Error::DhcpFailed),
            ConnectOutcome::Timeout => Err(Error::ConnectTimeout),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApRecord {
    pub ssid: String,
    pub psk: String,
}

pub struct MockBackend {
    networks: Mutex<Vec<WifiNetwork>>,
    profiles: Mutex<Vec<String>>,
    active_profile: Mutex<Option<String>>,
    connect_outcome: Mutex<ConnectOutcome>,
    activate_delay: Mutex<Duration>,
    ip_address: Mutex<String>,
    connectivity: AtomicBool,
    ap: Mutex<Option<ApRecord>>,
    ap_history: Mutex<Vec<ApRecord>>,
    events_tx: broadcast::Sender<NetworkEvent>,

    activations: AtomicUsize,
    activation_targets: Mutex<Vec<String>>,
    active_attempts: AtomicUsize,
    max_concurrent_attempts: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(32);
        MockBackend {
            networks: Mutex::new(vec![
                WifiNetwork {
                    ssid: "HomeNet".into(),
                    signal: 92,
                    security: Security::Wpa2,
                    in_use: false,
                },
                WifiNetwork {
                    ssid: "CafeGuest".into(),
                    signal: 61,
                    security: Security::Open,
                    in_use: false,
                },
            ]),
            profiles: Mutex::new(Vec::new()),
            active_profile: Mutex::new(None),
            connect_outcome: Mutex::new(ConnectOutcome::Success),
            activate_delay: Mutex::new(Duration::from_millis(10)),
            ip_address: Mutex::new("192.168.1.50".into()),
            connectivity: AtomicBool::new(true),
            ap: Mutex::new(None),
            ap_history: Mutex::new(Vec::new()),
            events_tx,
            activations: AtomicUsize::new(0),
            activation_targets: Mutex::new(Vec::new()),
            active_attempts: AtomicUsize::new(0),
            max_concurrent_attempts: AtomicUsize::new(0),
        }
    }

    pub fn set_networks(&self, networks: Vec<WifiNetwork>) {
        *self.networks.lock().unwrap() = networks;
    }

    pub fn set_connect_outcome(&self, outcome: ConnectOutcome) {
        *self.connect_outcome.lock().unwrap() = outcome;
    }

    pub fn set_activate_delay(&self, delay: Duration) {
        *self.activate_delay.lock().unwrap() = delay;
    }

    pub fn set_connectivity(&self, up: bool) {
        self.connectivity.store(up, Ordering::SeqCst);
    }

    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Total `activate_profile` calls observed.
    pub fn activation_count(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    /// Profile names passed to `activate_profile`, in order.
    pub fn activation_targets(&self) -> Vec<String> {
        self.activation_targets.lock().unwrap().clone()
    }

    /// Highest number of concurrently running activation attempts.
    pub fn max_concurrent_activations(&self) -> usize {
        self.max_concurrent_attempts.load(Ordering::SeqCst)
    }

    /// Every AP (ssid, psk) pair that was ever started.
    pub fn ap_history(&self) -> Vec<ApRecord> {
        self.ap_history.lock().unwrap().clone()
    }

    pub fn current_ap(&self) -> Option<ApRecord> {
        self.ap.lock().unwrap().clone()
    }

    pub fn has_profile(&self, name: &str) -> bool {
        self.profiles.lock().unwrap().iter().any(|p| p == name)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkBackend for MockBackend {
    async fn scan(&self) -> Result<Vec<WifiNetwork>> {
        Ok(self.networks.lock().unwrap().clone())
    }

    async fn list_profiles(&self) -> Result<Vec<String>> {
        Ok(self.profiles.lock().unwrap().clone())
    }

    async fn create_or_update_profile(
        &self,
        ssid: &str,
        _psk: Option<&str>,
        _hidden: bool,
    ) -> Result<()> {
        let mut profiles = self.profiles.lock().unwrap();
        if !profiles.iter().any(|p| p == ssid) {
            profiles.push(ssid.to_string());
        }
        Ok(())
    }

    async fn delete_profile(&self, name: &str) -> Result<()> {
        self.profiles.lock().unwrap().retain(|p| p != name);
        let mut active = self.active_profile.lock().unwrap();
        if active.as_deref() == Some(name) {
            *active = None;
        }
        Ok(())
    }

    async fn activate_profile(&self, name: &str) -> Result<()> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        self.activation_targets.lock().unwrap().push(name.to_string());
        let now_active = self.active_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_attempts
            .fetch_max(now_active, Ordering::SeqCst);

        let delay = *self.activate_delay.lock().unwrap();
        sleep(delay).await;

        self.active_attempts.fetch_sub(1, Ordering::SeqCst);

        let outcome = *self.connect_outcome.lock().unwrap();
        let result = outcome.into_result();
        if result.is_ok() {
            *self.active_profile.lock().unwrap() = Some(name.to_string());
            *self.ap.lock().unwrap() = None;
        }
        result
    }

    async fn deactivate_all_wifi(&self) -> Result<()> {
        *self.active_profile.lock().unwrap() = None;
        Ok(())
    }

    async fn start_ap(&self, ssid: &str, psk: &str, _channel: u8, _ipv4: Ipv4Addr) -> Result<()> {
        let record = ApRecord {
            ssid: ssid.to_string(),
            psk: psk.to_string(),
        };
        self.ap_history.lock().unwrap().push(record.clone());
        *self.ap.lock().unwrap() = Some(record);
        *self.active_profile.lock().unwrap() = None;
        Ok(())
    }

    async fn stop_ap(&self) -> Result<()> {
        *self.ap.lock().unwrap() = None;
        Ok(())
    }

    async fn primary_ipv4(&self) -> Result<Option<String>> {
        if self.active_profile.lock().unwrap().is_some() {
            Ok(Some(self.ip_address.lock().unwrap().clone()))
        } else {
            Ok(None)
        }
    }

    async fn current_ssid(&self) -> Result<Option<String>> {
        Ok(self.active_profile.lock().unwrap().clone())
    }

    async fn signal_dbm(&self) -> Result<Option<i32>> {
        if self.active_profile.lock().unwrap().is_some() {
            Ok(Some(-54))
        } else {
            Ok(None)
        }
    }

    async fn check_connectivity(&self) -> Result<bool> {
        Ok(self.connectivity.load(Ordering::SeqCst))
    }

    async fn wifi_interface(&self) -> Option<String> {
        Some("wlan0".to_string())
    }

    fn watch_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events_tx.subscribe()
    }
}
