//! Remote-access tunnel supervisor.
//!
//! Two providers: a managed reverse proxy (a system service with a
//! pre-issued device serial) and an on-demand SSH forward to a public
//! relay. The managed provider is preferred when its credential exists;
//! while the SSH fallback is active we keep probing the managed one and
//! switch back as soon as it recovers. Failures stay internal: the rest of
//! the system only ever sees `tunnel_url` appear or go away.

use crate::config::{PrimaryProvider, Settings};
use crate::state::{StatePatch, StateStore, TunnelProvider};
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, timeout, Instant};

const MANAGED_HEALTH_INTERVAL: Duration = Duration::from_secs(60);
const MANAGED_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const MANAGED_FAILURE_LIMIT: u32 = 3;
const MANAGED_RECHECK_INTERVAL: Duration = Duration::from_secs(60);
const URL_PARSE_TIMEOUT: Duration = Duration::from_secs(20);
const TOKENED_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    StartingManaged,
    Managed,
    StartingSsh,
    Ssh,
    Failed,
}

/// Why a provider session ended.
enum Phase {
    /// The orchestrator no longer wants a tunnel.
    Stopped,
    /// The process is going away.
    Shutdown,
    /// Managed provider is (or became) unavailable; use the SSH relay.
    ManagedLost,
    /// Managed provider recovered while the SSH relay was active.
    ManagedAvailable,
    /// SSH lease is about to expire; restart the forward.
    Refresh,
    /// The attempt failed; back off and retry.
    Error,
}

pub struct TunnelSupervisor {
    settings: Arc<Settings>,
    store: Arc<StateStore>,
    desired_tx: watch::Sender<bool>,
    state: std::sync::Mutex<TunnelState>,
}

impl TunnelSupervisor {
    pub fn new(settings: Arc<Settings>, store: Arc<StateStore>) -> Arc<Self> {
        let (desired_tx, _) = watch::channel(false);
        Arc::new(TunnelSupervisor {
            settings,
            store,
            desired_tx,
            state: std::sync::Mutex::new(TunnelState::Idle),
        })
    }

    /// Ask for a tunnel. Idempotent; the supervisor task does the work.
    pub fn start(&self) {
        self.desired_tx.send_replace(true);
    }

    /// Tear the tunnel down. Idempotent.
    pub fn stop(&self) {
        self.desired_tx.send_replace(false);
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock().expect("tunnel state lock poisoned")
    }

    fn set_state(&self, next: TunnelState) {
        let mut state = self.state.lock().expect("tunnel state lock poisoned");
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "tunnel state change");
            *state = next;
        }
    }

    /// Supervisor main loop; spawn once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut desired = self.desired_tx.subscribe();
        loop {
            while !*desired.borrow_and_update() {
                if desired.changed().await.is_err() {
                    return;
                }
            }

            if !self.settings.tunnel_enabled {
                tracing::info!("tunnel service disabled in settings");
                if desired.changed().await.is_err() {
                    return;
                }
                continue;
            }

            let outcome = self.provide(&mut desired).await;
            self.clear_published_url().await;
            self.set_state(TunnelState::Idle);
            if matches!(outcome, Phase::Shutdown) {
                return;
            }
        }
    }

    /// Keep a tunnel up, switching providers as health dictates, until the
    /// desired flag flips off.
    async fn provide(&self, desired: &mut watch::Receiver<bool>) -> Phase {
        let serial = read_device_serial(&self.settings.device_env_path).await;
        match &serial {
            Some(serial) => tracing::info!(serial = %serial, "managed tunnel credential found"),
            None => tracing::info!("no managed tunnel credential, SSH relay only"),
        }

        let managed_configured =
            serial.is_some() && self.settings.tunnel_provider_primary == PrimaryProvider::Managed;
        let mut prefer_managed = managed_configured;
        let mut backoff = INITIAL_BACKOFF;

        while *desired.borrow() {
            let phase = if prefer_managed {
                self.managed_session(desired, serial.as_deref().unwrap_or_default())
                    .await
            } else {
                self.ssh_session(desired, managed_configured).await
            };

            match phase {
                Phase::Stopped | Phase::Shutdown => return phase,
                Phase::ManagedLost => prefer_managed = false,
                Phase::ManagedAvailable => prefer_managed = true,
                Phase::Refresh => {}
                Phase::Error => {
                    self.set_state(TunnelState::Failed);
                    self.clear_published_url().await;
                    tracing::warn!(delay_s = backoff.as_secs(), "tunnel attempt failed, backing off");
                    if let Some(phase) = wait_while_desired(desired, backoff).await {
                        return phase;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        Phase::Stopped
    }

    /// Hold the managed provider: publish its URL and watch its health.
    async fn managed_session(&self, desired: &mut watch::Receiver<bool>, serial: &str) -> Phase {
        self.set_state(TunnelState::StartingManaged);
        if !self.managed_healthy().await {
            tracing::info!("managed provider unavailable, falling back to SSH relay");
            return Phase::ManagedLost;
        }

        let url = format!("https://{}.{}", serial, self.settings.managed_domain);
        tracing::info!(url = %url, "managed tunnel active");
        self.publish(url, TunnelProvider::Managed).await;
        self.set_state(TunnelState::Managed);

        let mut failures = 0u32;
        loop {
            if let Some(phase) = wait_while_desired(desired, MANAGED_HEALTH_INTERVAL).await {
                return phase;
            }
            if self.managed_healthy().await {
                failures = 0;
            } else {
                failures += 1;
                tracing::warn!(failures, "managed provider health check failed");
                if failures >= MANAGED_FAILURE_LIMIT {
                    return Phase::ManagedLost;
                }
            }
        }
    }

    /// Hold one SSH forward: spawn, wait for the public URL, then babysit
    /// the child until refresh, managed recovery, death or stop.
    async fn ssh_session(&self, desired: &mut watch::Receiver<bool>, recheck_managed: bool) -> Phase {
        self.set_state(TunnelState::StartingSsh);

        let mut child = match self.spawn_ssh() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn SSH tunnel");
                return Phase::Error;
            }
        };
        let Some(stderr) = child.stderr.take() else {
            let _ = child.kill().await;
            return Phase::Error;
        };

        let url = match timeout(URL_PARSE_TIMEOUT, read_tunnel_url(stderr)).await {
            Ok(Some(url)) => url,
            Ok(None) | Err(_) => {
                tracing::warn!("SSH relay produced no tunnel URL in time");
                let _ = child.kill().await;
                return Phase::Error;
            }
        };

        tracing::info!(url = %url, "SSH tunnel active");
        self.publish(url, TunnelProvider::Ssh).await;
        self.set_state(TunnelState::Ssh);

        let refresh = sleep(self.refresh_after());
        tokio::pin!(refresh);
        let mut recheck = interval_at(
            Instant::now() + MANAGED_RECHECK_INTERVAL,
            MANAGED_RECHECK_INTERVAL,
        );

        // Decide the phase first, then reap the child, so no branch needs
        // the child while another one polls it.
        let phase = loop {
            tokio::select! {
                _ = &mut refresh => {
                    tracing::info!("refreshing SSH tunnel before lease expiry");
                    break Phase::Refresh;
                }
                _ = recheck.tick(), if recheck_managed => {
                    if self.managed_healthy().await {
                        tracing::info!("managed provider recovered, switching back");
                        break Phase::ManagedAvailable;
                    }
                }
                status = child.wait() => {
                    tracing::warn!(status = ?status.ok(), "SSH tunnel process exited");
                    break Phase::Error;
                }
                changed = desired.changed() => match changed {
                    Ok(()) if !*desired.borrow() => break Phase::Stopped,
                    Ok(()) => {}
                    Err(_) => break Phase::Shutdown,
                }
            }
        };

        let _ = child.kill().await;
        phase
    }

    fn spawn_ssh(&self) -> std::io::Result<Child> {
        let args = ssh_args(&self.settings);
        Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Relay leases are ~24 h with an access token, ~60 min without; the
    /// forward is restarted a safety margin before expiry.
    fn refresh_after(&self) -> Duration {
        if self.settings.tunnel_access_token.is_some() {
            TOKENED_LIFETIME - REFRESH_MARGIN
        } else {
            self.settings.tunnel_refresh_interval
        }
    }

    async fn managed_healthy(&self) -> bool {
        let args = ["is-active", "--quiet", self.settings.managed_service.as_str()];
        let probe = crate::backends::run_command("systemctl", &args);
        match timeout(MANAGED_HEALTH_TIMEOUT, probe).await {
            Ok(Ok(out)) => out.success,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    async fn publish(&self, url: String, provider: TunnelProvider) {
        self.store
            .update(StatePatch {
                tunnel_url: Some(Some(url)),
                tunnel_provider: Some(provider),
                ..Default::default()
            })
            .await;
    }

    async fn clear_published_url(&self) {
        let current = self.store.get();
        if current.tunnel_url.is_none() && current.tunnel_provider == TunnelProvider::None {
            return;
        }
        self.store
            .update(StatePatch {
                tunnel_url: Some(None),
                tunnel_provider: Some(TunnelProvider::None),
                ..Default::default()
            })
            .await;
    }
}

/// Sleep for `duration`, returning early when the tunnel is no longer
/// wanted. `None` means the full duration elapsed while still desired.
async fn wait_while_desired(
    desired: &mut watch::Receiver<bool>,
    duration: Duration,
) -> Option<Phase> {
    let deadline = sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            changed = desired.changed() => match changed {
                Ok(()) if !*desired.borrow() => return Some(Phase::Stopped),
                Ok(()) => {}
                Err(_) => return Some(Phase::Shutdown),
            }
        }
    }
}

/// SSH argv for the relay forward. Never a shell string.
fn ssh_args(settings: &Settings) -> Vec<String> {
    let destination = match &settings.tunnel_access_token {
        Some(token) => format!("{token}@{}", settings.tunnel_ssh_host),
        None => settings.tunnel_ssh_host.clone(),
    };
    vec![
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "ServerAliveInterval=30".into(),
        "-o".into(),
        "ServerAliveCountMax=3".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-R".into(),
        format!("0:localhost:{}", settings.web_port),
        "-p".into(),
        settings.tunnel_ssh_port.to_string(),
        destination,
    ]
}

/// Read relay output until a line carries the public URL.
async fn read_tunnel_url<R: AsyncRead + Unpin>(stream: R) -> Option<String> {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        tracing::debug!(line = trimmed, "relay output");
        if let Some(url) = extract_url(trimmed) {
            return Some(url);
        }
    }
    None
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s,]+").expect("static regex"))
}

fn extract_url(line: &str) -> Option<String> {
    url_re()
        .find(line)
        .map(|m| m.as_str().trim_end_matches(['.', '"', '\'']).to_string())
}

/// Pull the pre-issued device serial out of the device env file.
async fn read_device_serial(path: &Path) -> Option<String> {
    let data = tokio::fs::read_to_string(path).await.ok()?;
    for line in data.lines() {
        if let Some(value) = line.trim().strip_prefix("SERIAL=") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_extracted_from_relay_chatter() {
        assert_eq!(
            extract_url("http://abc123.free.example.link").as_deref(),
            Some("http://abc123.free.example.link")
        );
        assert_eq!(
            extract_url("Forwarding to https://xyz.example.link from relay").as_deref(),
            Some("https://xyz.example.link")
        );
        assert_eq!(extract_url("Warning: permanently added host key"), None);
    }

    #[test]
    fn ssh_args_use_the_token_when_configured() {
        let mut settings = Settings::default();
        settings.web_port = 8080;
        let args = ssh_args(&settings);
        assert_eq!(args.last().unwrap(), "a.pinggy.io");
        assert!(args.contains(&"0:localhost:8080".to_string()));
        assert!(args.contains(&"443".to_string()));

        settings.tunnel_access_token = Some("tok123".into());
        let args = ssh_args(&settings);
        assert_eq!(args.last().unwrap(), "tok123@a.pinggy.io");
    }

    #[test]
    fn refresh_interval_depends_on_the_token() {
        let settings = Arc::new(Settings::default());
        let store = Arc::new(crate::state::StateStore::new(None));
        let supervisor = TunnelSupervisor::new(settings, store.clone());
        assert_eq!(supervisor.refresh_after(), Duration::from_secs(3300));

        let mut settings = Settings::default();
        settings.tunnel_access_token = Some("tok".into());
        let supervisor = TunnelSupervisor::new(Arc::new(settings), store);
        assert_eq!(
            supervisor.refresh_after(),
            Duration::from_secs(24 * 60 * 60 - 5 * 60)
        );
    }

    #[tokio::test]
    async fn device_serial_is_read_from_the_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.env");

        tokio::fs::write(&path, "VENDOR=acme\nSERIAL=dev-1234\n")
            .await
            .unwrap();
        assert_eq!(read_device_serial(&path).await.as_deref(), Some("dev-1234"));

        tokio::fs::write(&path, "SERIAL=\"quoted-5678\"\n").await.unwrap();
        assert_eq!(
            read_device_serial(&path).await.as_deref(),
            Some("quoted-5678")
        );

        tokio::fs::write(&path, "VENDOR=acme\n").await.unwrap();
        assert_eq!(read_device_serial(&path).await, None);

        assert_eq!(read_device_serial(dir.path().join("nope.env").as_path()).await, None);
    }

    #[tokio::test]
    async fn url_reader_skips_noise_lines() {
        let chatter = b"Warning: added key\n\nhttps://tun.example.link ready\n".to_vec();
        let url = read_tunnel_url(std::io::Cursor::new(chatter)).await;
        assert_eq!(url.as_deref(), Some("https://tun.example.link"));
    }
}
