//! The provisioning state machine.
//!
//! Owns the single process-wide connection lock: at most one connection
//! attempt (user-initiated or auto-recovery) runs at any time, and user
//! attempts preempt a pending recovery. Every transition funnels through
//! the state store so subscribers see one totally-ordered history.

use crate::captive_portal::CaptivePortal;
use crate::config::Settings;
use crate::identity::DeviceIdentity;
use crate::state::{ConnectionState, ErrorInfo, StatePatch, StateStore};
use crate::traits::{NetworkBackend, NetworkEvent};
use crate::tunnel::TunnelSupervisor;
use crate::{Error, Result};
use rand::rngs::OsRng;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

const ACTIVATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause between FAILED and the fallback into AP mode.
const FAILED_TO_AP_DELAY: Duration = Duration::from_secs(3);
/// Transient-jitter filter before auto-recovery does anything.
const RECOVERY_SETTLE: Duration = Duration::from_secs(3);
/// How often a recovery holder checks for a preemption request.
const PREEMPT_POLL: Duration = Duration::from_millis(200);
/// Settle time for the daemon's dnsmasq after the AP comes up.
const AP_SETTLE: Duration = Duration::from_secs(1);

const AP_PASSWORD_LEN: usize = 12;
/// Alphanumerics plus symbols that survive every shell and QR encoder.
const AP_PASSWORD_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_@#%";

/// Who currently owns the connection lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Holder {
    None = 0,
    User = 1,
    Recovery = 2,
}

/// Single non-reentrant cooperative mutex guarding connection attempts.
///
/// `try_acquire` is for auto-recovery; blocking `acquire` is for user
/// connects and additionally raises the preemption flag so a recovery
/// holder releases at its next check point.
pub struct ConnectionLock {
    semaphore: Semaphore,
    preempt_requested: AtomicBool,
    holder: AtomicU8,
}

pub struct ConnectionGuard<'a> {
    lock: &'a ConnectionLock,
    _permit: SemaphorePermit<'a>,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.lock.holder.store(Holder::None as u8, Ordering::SeqCst);
    }
}

impl ConnectionLock {
    fn new() -> Self {
        ConnectionLock {
            semaphore: Semaphore::new(1),
            preempt_requested: AtomicBool::new(false),
            holder: AtomicU8::new(Holder::None as u8),
        }
    }

    pub fn try_acquire(&self, who: Holder) -> Option<ConnectionGuard<'_>> {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                self.holder.store(who as u8, Ordering::SeqCst);
                Some(ConnectionGuard {
                    lock: self,
                    _permit: permit,
                })
            }
            Err(_) => None,
        }
    }

    pub async fn acquire(&self, who: Holder) -> ConnectionGuard<'_> {
        self.preempt_requested.store(true, Ordering::SeqCst);
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("connection lock semaphore is never closed");
        self.preempt_requested.store(false, Ordering::SeqCst);
        self.holder.store(who as u8, Ordering::SeqCst);
        ConnectionGuard {
            lock: self,
            _permit: permit,
        }
    }

    pub fn preempt_requested(&self) -> bool {
        self.preempt_requested.load(Ordering::SeqCst)
    }

    pub fn held_by_user(&self) -> bool {
        self.holder.load(Ordering::SeqCst) == Holder::User as u8
    }
}

/// Fresh AP password from the OS CSPRNG, regenerated on every AP entry.
pub fn generate_ap_password() -> String {
    let mut rng = OsRng;
    (0..AP_PASSWORD_LEN)
        .map(|_| {
            let index = rng.gen_range(0..AP_PASSWORD_CHARSET.len());
            AP_PASSWORD_CHARSET[index] as char
        })
        .collect()
}

/// Reject SSIDs/PSKs that are out of range or could smuggle shell
/// metacharacters into the OS daemon.
pub fn validate_connect_input(ssid: &str, password: Option<&str>) -> Result<()> {
    const FORBIDDEN: &[char] = &[';', '&', '|', '`', '$', '\n', '\r'];

    if ssid.is_empty() || ssid.len() > 32 {
        return Err(Error::BadInput("SSID must be 1-32 bytes".into()));
    }
    if ssid
        .chars()
        .any(|c| c == '\0' || c.is_ascii_control() || FORBIDDEN.contains(&c))
    {
        return Err(Error::BadInput("SSID contains invalid characters".into()));
    }

    if let Some(password) = password {
        if password.len() < 8 || password.len() > 63 {
            return Err(Error::BadInput("password must be 8-63 bytes".into()));
        }
        if password
            .chars()
            .any(|c| c == '\0' || c.is_ascii_control() || FORBIDDEN.contains(&c))
        {
            return Err(Error::BadInput(
                "password contains invalid characters".into(),
            ));
        }
    }

    Ok(())
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    identity: Arc<DeviceIdentity>,
    store: Arc<StateStore>,
    backend: Arc<dyn NetworkBackend>,
    captive: Arc<CaptivePortal>,
    tunnel: Arc<TunnelSupervisor>,
    lock: ConnectionLock,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        identity: Arc<DeviceIdentity>,
        store: Arc<StateStore>,
        backend: Arc<dyn NetworkBackend>,
        captive: Arc<CaptivePortal>,
        tunnel: Arc<TunnelSupervisor>,
    ) -> Arc<Self> {
        Arc::new(Orchestrator {
            settings,
            identity,
            store,
            backend,
            captive,
            tunnel,
            lock: ConnectionLock::new(),
        })
    }

    /// Whether a user connection attempt currently owns the lock.
    pub fn user_attempt_in_progress(&self) -> bool {
        self.lock.held_by_user()
    }

    /// Boot sequence: adopt an existing station connection, else try the
    /// saved profile, else open the provisioning AP.
    pub async fn startup(&self) -> Result<()> {
        // A hotspot left over from a crashed run would wedge the radio.
        if let Err(e) = self.backend.stop_ap().await {
            tracing::warn!(error = %e, "could not clean up leftover AP state");
        }

        if let Ok(Some(ssid)) = self.backend.current_ssid().await {
            tracing::info!(ssid = %ssid, "already connected at startup");
            if self.mark_connected(Some(&ssid)).await.is_ok() {
                self.tunnel.start();
                return Ok(());
            }
        }

        let saved = self.store.get().ssid.clone();
        if !saved.is_empty() {
            let profiles = self.backend.list_profiles().await.unwrap_or_default();
            if profiles.iter().any(|p| *p == saved) {
                tracing::info!(ssid = %saved, "reconnecting to saved network");
                self.store
                    .update(StatePatch {
                        connection_state: Some(ConnectionState::Connecting),
                        ssid: Some(saved.clone()),
                        ..Default::default()
                    })
                    .await;
                match self.activate(&saved).await {
                    Ok(()) => match self.mark_connected(Some(&saved)).await {
                        Ok(()) => {
                            self.tunnel.start();
                            return Ok(());
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "reconnect verification failed");
                        }
                    },
                    Err(e) => {
                        if matches!(e, Error::AuthFailed) {
                            // Stale credentials; the user must re-enter them.
                            tracing::warn!(ssid = %saved, "stale password, deleting profile");
                            let _ = self.backend.delete_profile(&saved).await;
                        }
                        tracing::warn!(error = %e, "saved network reconnect failed");
                    }
                }
            } else {
                tracing::info!(ssid = %saved, "saved network has no profile");
            }
        }

        self.enter_ap_mode().await
    }

    /// User connect path. The caller has already validated input for the
    /// HTTP 400 fast path; this re-validates before touching anything.
    pub async fn user_connect(
        &self,
        ssid: String,
        password: Option<String>,
        session_id: Uuid,
    ) -> Result<()> {
        validate_connect_input(&ssid, password.as_deref())?;
        if self.lock.held_by_user() {
            return Err(Error::Busy);
        }

        let _guard = self.lock.acquire(Holder::User).await;
        tracing::info!(ssid = %ssid, %session_id, "user-initiated connection");

        let was_connected = self.store.is_connected();
        self.store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Switching),
                ssid: Some(ssid.clone()),
                session_id: Some(session_id),
                error: Some(None),
                ..Default::default()
            })
            .await;
        if was_connected {
            self.tunnel.stop();
        }

        match self.connect_attempt(&ssid, password.as_deref()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_to_ap(&e).await;
                Err(e)
            }
        }
    }

    /// User disconnect: drop the station connection, forget the profile
    /// and reopen the provisioning AP.
    pub async fn user_disconnect(&self) -> Result<()> {
        let _guard = self.lock.acquire(Holder::User).await;
        tracing::info!("user-initiated disconnect");

        let saved = self.store.get().ssid.clone();
        self.store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Switching),
                error: Some(None),
                ..Default::default()
            })
            .await;
        self.tunnel.stop();

        if let Err(e) = self.backend.deactivate_all_wifi().await {
            tracing::warn!(error = %e, "deactivation failed");
        }
        if !saved.is_empty() {
            if let Err(e) = self.backend.delete_profile(&saved).await {
                tracing::warn!(ssid = %saved, error = %e, "could not delete profile");
            }
        }

        self.enter_ap_mode().await
    }

    /// Route one backend event. Only meaningful while we believe the
    /// station link is (coming) up.
    pub async fn handle_event(self: Arc<Self>, event: NetworkEvent) {
        let current = self.store.get().connection_state;
        if !matches!(
            current,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return;
        }

        match event {
            NetworkEvent::ConnectivityLost => {
                self.connection_lost("connectivity lost".to_string()).await;
            }
            NetworkEvent::DeviceDisconnected => {
                self.connection_lost("WiFi device disconnected".to_string())
                    .await;
            }
            NetworkEvent::ConnectionDeactivated { connection } => {
                self.connection_lost(format!("connection '{connection}' deactivated"))
                    .await;
            }
            NetworkEvent::ConnectivityRestored => {
                if self.backend.check_connectivity().await.unwrap_or(false) {
                    if let Err(e) = self.mark_connected(None).await {
                        tracing::debug!(error = %e, "restore notification without usable link");
                    }
                }
            }
            NetworkEvent::ActiveConnectionChanged { ssid } => {
                if current == ConnectionState::Connected {
                    self.store
                        .update(StatePatch {
                            ssid: Some(ssid),
                            ..Default::default()
                        })
                        .await;
                }
            }
        }
    }

    /// Drain the backend event stream; spawned once at startup.
    pub async fn run_event_loop(self: Arc<Self>) {
        let mut events = self.backend.watch_events();
        loop {
            match events.recv().await {
                Ok(event) => self.clone().handle_event(event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "network event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn connection_lost(self: Arc<Self>, reason: String) {
        tracing::warn!(reason = %reason, "network connection lost");
        self.store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Disconnected),
                error: Some(Some(ErrorInfo {
                    code: "CONNECTION_LOST".into(),
                    message: reason,
                })),
                ..Default::default()
            })
            .await;

        tokio::spawn(async move {
            self.recover().await;
        });
    }

    /// Auto-recovery after connectivity loss. Never blocks on the lock: a
    /// user attempt in flight owns recovery, and a user attempt arriving
    /// mid-recovery preempts it.
    pub async fn recover(self: Arc<Self>) {
        let Some(_guard) = self.lock.try_acquire(Holder::Recovery) else {
            tracing::info!("user connection in progress, skipping auto-recovery");
            return;
        };
        tracing::info!("auto-recovery started");

        if self.wait_preemptible(RECOVERY_SETTLE).await {
            tracing::info!("auto-recovery preempted by user connect");
            return;
        }

        if self.store.is_connected() {
            // A restored event won the race during the settle window.
            return;
        }
        if self.backend.check_connectivity().await.unwrap_or(false)
            && self.mark_connected(None).await.is_ok()
        {
            tracing::info!("connectivity restored without reconnecting");
            return;
        }
        if self.lock.preempt_requested() {
            tracing::info!("auto-recovery preempted by user connect");
            return;
        }

        let saved = self.store.get().ssid.clone();
        if saved.is_empty() {
            tracing::warn!("no saved network, falling back to AP mode");
            self.fail_to_ap(&Error::CommandFailed("no saved network to recover".into()))
                .await;
            return;
        }

        self.store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Connecting),
                ssid: Some(saved.clone()),
                ..Default::default()
            })
            .await;

        match self.activate(&saved).await {
            Ok(()) => match self.mark_connected(Some(&saved)).await {
                Ok(()) => {
                    tracing::info!(ssid = %saved, "auto-recovery reconnected");
                    self.tunnel.start();
                }
                Err(e) => self.fail_to_ap(&e).await,
            },
            Err(e) => {
                if matches!(e, Error::AuthFailed) {
                    tracing::warn!(ssid = %saved, "stale password, deleting profile");
                    let _ = self.backend.delete_profile(&saved).await;
                }
                self.fail_to_ap(&e).await;
            }
        }
    }

    /// Idempotent AP entry: fresh password, captive portal (re-)applied,
    /// hotspot (re-)started.
    pub async fn enter_ap_mode(&self) -> Result<()> {
        self.tunnel.stop();

        let password = generate_ap_password();
        self.backend
            .start_ap(
                &self.identity.ap_ssid,
                &password,
                self.settings.ap_channel,
                self.settings.ap_ip,
            )
            .await?;
        sleep(AP_SETTLE).await;

        let mut captive_error = None;
        if self.settings.enable_captive_portal {
            let interface = self
                .backend
                .wifi_interface()
                .await
                .unwrap_or_else(|| "wlan0".to_string());
            if let Err(e) = self.captive.enable(&interface).await {
                // The AP still works; clients just have to type the address.
                tracing::warn!(error = %e, "captive portal unavailable, setup reachable by IP only");
                captive_error = Some(ErrorInfo::from_error(&e));
            }
        }

        // A failure that brought us here stays visible on the setup page;
        // only a captive-portal problem overwrites it.
        self.store
            .update(StatePatch {
                connection_state: Some(ConnectionState::ApMode),
                ssid: Some(String::new()),
                ip_address: Some(String::new()),
                signal_dbm: Some(None),
                ap_password: Some(Some(password)),
                tunnel_url: Some(None),
                error: captive_error.map(Some),
                ..Default::default()
            })
            .await;

        tracing::info!(ssid = %self.identity.ap_ssid, "access point mode active");
        Ok(())
    }

    async fn connect_attempt(&self, ssid: &str, password: Option<&str>) -> Result<()> {
        if self.settings.enable_captive_portal {
            if let Err(e) = self.captive.disable().await {
                tracing::warn!(error = %e, "captive portal teardown failed");
            }
        }
        if let Err(e) = self.backend.stop_ap().await {
            tracing::warn!(error = %e, "AP teardown failed");
        }

        self.store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Connecting),
                ..Default::default()
            })
            .await;

        self.backend
            .create_or_update_profile(ssid, password, false)
            .await?;
        self.activate(ssid).await?;
        self.mark_connected(Some(ssid)).await?;
        self.tunnel.start();
        Ok(())
    }

    async fn activate(&self, ssid: &str) -> Result<()> {
        match timeout(ACTIVATE_TIMEOUT, self.backend.activate_profile(ssid)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout),
        }
    }

    /// Fill in the CONNECTED snapshot. CONNECTED always carries a
    /// non-empty SSID and IP; anything less is a failed attempt.
    async fn mark_connected(&self, ssid_hint: Option<&str>) -> Result<()> {
        let ssid = match ssid_hint {
            Some(ssid) => ssid.to_string(),
            None => self
                .backend
                .current_ssid()
                .await?
                .unwrap_or_default(),
        };
        if ssid.is_empty() {
            return Err(Error::CommandFailed("no active station connection".into()));
        }
        let ip = self.backend.primary_ipv4().await?.ok_or(Error::DhcpFailed)?;
        let signal = self.backend.signal_dbm().await.unwrap_or(None);

        self.store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Connected),
                ssid: Some(ssid.clone()),
                ip_address: Some(ip),
                signal_dbm: Some(signal),
                error: Some(None),
                ..Default::default()
            })
            .await;
        tracing::info!(ssid = %ssid, "connected");
        Ok(())
    }

    async fn fail_to_ap(&self, error: &Error) {
        tracing::warn!(code = error.code(), error = %error, "connection attempt failed");
        self.store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Failed),
                error: Some(Some(ErrorInfo::from_error(error))),
                ..Default::default()
            })
            .await;

        sleep(FAILED_TO_AP_DELAY).await;
        if let Err(e) = self.enter_ap_mode().await {
            tracing::error!(error = %e, "could not fall back to AP mode");
        }
    }

    /// Sleep in small slices, returning `true` as soon as a user connect
    /// requests the lock.
    async fn wait_preemptible(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.lock.preempt_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(PREEMPT_POLL.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ap_passwords_are_long_and_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let password = generate_ap_password();
            assert_eq!(password.len(), AP_PASSWORD_LEN);
            assert!(password
                .bytes()
                .all(|b| AP_PASSWORD_CHARSET.contains(&b)));
            seen.insert(password);
        }
        // 64 independent 12-char draws colliding would mean a broken RNG.
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn ap_password_charset_avoids_shell_metacharacters() {
        for forbidden in [b';', b'&', b'|', b'`', b'$', b'\'', b'"', b'\\'] {
            assert!(!AP_PASSWORD_CHARSET.contains(&forbidden));
        }
    }

    #[test]
    fn valid_inputs_pass_validation() {
        assert!(validate_connect_input("HomeNet", Some("hunter2hunter2")).is_ok());
        assert!(validate_connect_input("Cafe Guest-5G", None).is_ok());
        assert!(validate_connect_input("a", Some("12345678")).is_ok());
        assert!(validate_connect_input(&"x".repeat(32), Some(&"p".repeat(63))).is_ok());
    }

    #[test]
    fn out_of_range_lengths_are_rejected() {
        assert!(matches!(
            validate_connect_input("", None),
            Err(Error::BadInput(_))
        ));
        assert!(matches!(
            validate_connect_input(&"x".repeat(33), None),
            Err(Error::BadInput(_))
        ));
        assert!(matches!(
            validate_connect_input("HomeNet", Some("wrong")),
            Err(Error::BadInput(_))
        ));
        assert!(matches!(
            validate_connect_input("HomeNet", Some(&"p".repeat(64))),
            Err(Error::BadInput(_))
        ));
    }

    #[test]
    fn shell_metacharacters_are_rejected() {
        for bad in ["a;b", "a&b", "a|b", "a`b", "a$b", "a\nb", "a\0b"] {
            assert!(
                matches!(validate_connect_input(bad, None), Err(Error::BadInput(_))),
                "ssid {bad:?} should be rejected"
            );
            let password = format!("{bad}12345678");
            assert!(
                matches!(
                    validate_connect_input("HomeNet", Some(&password)),
                    Err(Error::BadInput(_))
                ),
                "password {password:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let lock = ConnectionLock::new();
        let guard = lock.try_acquire(Holder::User).unwrap();
        assert!(lock.held_by_user());
        assert!(lock.try_acquire(Holder::Recovery).is_none());
        drop(guard);
        assert!(!lock.held_by_user());
        assert!(lock.try_acquire(Holder::Recovery).is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_raises_the_preempt_flag() {
        let lock = std::sync::Arc::new(ConnectionLock::new());
        let guard = lock.try_acquire(Holder::Recovery).unwrap();
        assert!(!lock.preempt_requested());

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire(Holder::User).await;
            })
        };
        // Let the waiter block on the semaphore.
        tokio::task::yield_now().await;
        assert!(lock.preempt_requested());

        // The recovery holder yields; the user gets the lock and the flag
        // clears.
        drop(guard);
        waiter.await.unwrap();
        assert!(!lock.preempt_requested());
        assert!(!lock.held_by_user());
    }
}
