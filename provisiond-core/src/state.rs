//! System state snapshot store with atomic persistence and ordered
//! change notifications.
//!
//! Reads are lock-free clones of an immutable snapshot; writes are
//! serialised and run the full callback pass before the next update may
//! begin, so every subscriber observes the same totally-ordered sequence
//! of snapshots.

use crate::Error;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    ApMode,
    Switching,
    Connecting,
    Connected,
    Failed,
    #[default]
    Disconnected,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the provisioning state machine.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (ApMode, Switching)
                | (ApMode, Connecting)
                | (Switching, Connecting)
                | (Switching, ApMode)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Failed, ApMode)
                | (Failed, Connecting)
                | (Connected, Switching)
                | (Connected, Disconnected)
                | (Disconnected, Connecting)
                | (Disconnected, Connected)
                | (Disconnected, ApMode)
                | (Disconnected, Switching)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::ApMode => "AP_MODE",
            ConnectionState::Switching => "SWITCHING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Failed => "FAILED",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelProvider {
    Managed,
    Ssh,
    #[default]
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn from_error(e: &Error) -> Self {
        ErrorInfo {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// The single process-wide system state.
///
/// The AP password is deliberately excluded from serialisation so that it
/// never reaches the persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    #[serde(default)]
    pub connection_state: ConnectionState,
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub signal_dbm: Option<i32>,
    #[serde(skip_serializing, default)]
    pub ap_password: Option<String>,
    #[serde(default)]
    pub tunnel_url: Option<String>,
    #[serde(default)]
    pub tunnel_provider: TunnelProvider,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default = "Uuid::new_v4")]
    pub session_id: Uuid,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for SystemState {
    fn default() -> Self {
        SystemState {
            connection_state: ConnectionState::Disconnected,
            ssid: String::new(),
            ip_address: String::new(),
            signal_dbm: None,
            ap_password: None,
            tunnel_url: None,
            tunnel_provider: TunnelProvider::None,
            error: None,
            session_id: Uuid::new_v4(),
            updated_at: Utc::now(),
        }
    }
}

/// Partial update applied atomically by [`StateStore::update`].
///
/// Double-`Option` fields distinguish "leave unchanged" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub connection_state: Option<ConnectionState>,
    pub ssid: Option<String>,
    pub ip_address: Option<String>,
    pub signal_dbm: Option<Option<i32>>,
    pub ap_password: Option<Option<String>>,
    pub tunnel_url: Option<Option<String>>,
    pub tunnel_provider: Option<TunnelProvider>,
    pub error: Option<Option<ErrorInfo>>,
    pub session_id: Option<Uuid>,
}

impl StatePatch {
    fn apply(self, state: &mut SystemState) {
        if let Some(v) = self.connection_state {
            state.connection_state = v;
        }
        if let Some(v) = self.ssid {
            state.ssid = v;
        }
        if let Some(v) = self.ip_address {
            state.ip_address = v;
        }
        if let Some(v) = self.signal_dbm {
            state.signal_dbm = v;
        }
        if let Some(v) = self.ap_password {
            state.ap_password = v;
        }
        if let Some(v) = self.tunnel_url {
            state.tunnel_url = v;
        }
        if let Some(v) = self.tunnel_provider {
            state.tunnel_provider = v;
        }
        match self.error {
            Some(v) => state.error = v,
            // A successful connection implicitly clears a stale error.
            None if state.connection_state == ConnectionState::Connected => {
                state.error = None;
            }
            None => {}
        }
        if let Some(v) = self.session_id {
            state.session_id = v;
        }
        state.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceHealth {
    Healthy,
    Degraded,
    Failed,
}

struct PersistenceStatus {
    failures: u32,
    health: PersistenceHealth,
}

type ChangeCallback =
    Arc<dyn Fn(Arc<SystemState>, Arc<SystemState>) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct StateStore {
    state_file: Option<PathBuf>,
    current: RwLock<Arc<SystemState>>,
    update_lock: Mutex<()>,
    callbacks: RwLock<Vec<(u64, ChangeCallback)>>,
    next_callback_id: AtomicU64,
    persistence: std::sync::Mutex<PersistenceStatus>,
}

impl StateStore {
    /// Create a store, loading the previous snapshot from disk when present.
    /// Stale tunnel URLs never survive a restart; the AP password is absent
    /// from the file by construction.
    pub fn new(state_file: Option<PathBuf>) -> Self {
        let mut initial = SystemState::default();
        if let Some(path) = state_file.as_ref() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<SystemState>(&data) {
                    Ok(mut loaded) => {
                        loaded.tunnel_url = None;
                        loaded.tunnel_provider = TunnelProvider::None;
                        loaded.ap_password = None;
                        tracing::info!(path = %path.display(), "loaded persisted state");
                        initial = loaded;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "state file unreadable, starting fresh");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read state file, starting fresh");
                }
            }
        }

        StateStore {
            state_file,
            current: RwLock::new(Arc::new(initial)),
            update_lock: Mutex::new(()),
            callbacks: RwLock::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            persistence: std::sync::Mutex::new(PersistenceStatus {
                failures: 0,
                health: PersistenceHealth::Healthy,
            }),
        }
    }

    /// Cheap snapshot of the current state.
    pub fn get(&self) -> Arc<SystemState> {
        self.current.read().expect("state lock poisoned").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.get().connection_state == ConnectionState::Connected
    }

    pub fn is_ap_mode(&self) -> bool {
        self.get().connection_state == ConnectionState::ApMode
    }

    pub fn persistence_health(&self) -> PersistenceHealth {
        self.persistence.lock().expect("persistence lock poisoned").health
    }

    /// Apply a patch atomically, persist the snapshot, then run all change
    /// callbacks in registration order. The next update cannot begin its
    /// callback pass before this one finishes.
    pub async fn update(&self, patch: StatePatch) -> Arc<SystemState> {
        let _guard = self.update_lock.lock().await;

        let old = self.get();
        let mut next = (*old).clone();
        patch.apply(&mut next);
        let next = Arc::new(next);

        *self.current.write().expect("state lock poisoned") = next.clone();

        self.persist(&next).await;

        let callbacks: Vec<ChangeCallback> = self
            .callbacks
            .read()
            .expect("callback lock poisoned")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            if AssertUnwindSafe(cb(old.clone(), next.clone()))
                .catch_unwind()
                .await
                .is_err()
            {
                tracing::error!("state change callback panicked");
            }
        }

        next
    }

    /// Register a change callback; returns a token for [`off_change`].
    ///
    /// [`off_change`]: StateStore::off_change
    pub fn on_change<F>(&self, callback: F) -> u64
    where
        F: Fn(Arc<SystemState>, Arc<SystemState>) -> BoxFuture<'static, ()>
            + Send
            + Sync
            + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .expect("callback lock poisoned")
            .push((id, Arc::new(callback)));
        id
    }

    pub fn off_change(&self, id: u64) {
        self.callbacks
            .write()
            .expect("callback lock poisoned")
            .retain(|(cb_id, _)| *cb_id != id);
    }

    /// Write the snapshot to a temp file and rename it into place. Failures
    /// never abort the in-memory update; they only degrade persistence
    /// health until the next successful write.
    async fn persist(&self, state: &SystemState) {
        let Some(path) = self.state_file.as_ref() else {
            return;
        };

        let result: std::io::Result<()> = async {
            let data = serde_json::to_string_pretty(state)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, data).await?;
            tokio::fs::rename(&tmp, path).await?;
            Ok(())
        }
        .await;

        let mut status = self.persistence.lock().expect("persistence lock poisoned");
        match result {
            Ok(()) => {
                if status.failures > 0 {
                    tracing::info!("state persistence recovered");
                }
                status.failures = 0;
                status.health = PersistenceHealth::Healthy;
            }
            Err(e) => {
                status.failures += 1;
                status.health = if status.failures <= 3 {
                    tracing::warn!(failures = status.failures, error = %e, "state persistence degraded");
                    PersistenceHealth::Degraded
                } else {
                    tracing::error!(failures = status.failures, error = %e, "state persistence failed");
                    PersistenceHealth::Failed
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn patch_merges_into_the_snapshot() {
        let store = StateStore::new(None);
        let state = store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Connecting),
                ssid: Some("HomeNet".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(state.connection_state, ConnectionState::Connecting);
        assert_eq!(state.ssid, "HomeNet");
        // Untouched fields survive.
        assert_eq!(state.ip_address, "");
    }

    #[tokio::test]
    async fn connected_clears_a_stale_error() {
        let store = StateStore::new(None);
        store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Failed),
                error: Some(Some(ErrorInfo {
                    code: "AUTH_FAIL".into(),
                    message: "authentication failed".into(),
                })),
                ..Default::default()
            })
            .await;
        let state = store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Connected),
                ssid: Some("HomeNet".into()),
                ip_address: Some("10.0.0.5".into()),
                ..Default::default()
            })
            .await;
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn session_id_rotates_only_on_request() {
        let store = StateStore::new(None);
        let before = store.get().session_id;
        let unchanged = store
            .update(StatePatch {
                ssid: Some("x".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(unchanged.session_id, before);
        let fresh = Uuid::new_v4();
        let rotated = store
            .update(StatePatch {
                session_id: Some(fresh),
                ..Default::default()
            })
            .await;
        assert_eq!(rotated.session_id, fresh);
    }

    #[tokio::test]
    async fn persisted_snapshot_never_contains_the_ap_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(Some(path.clone()));
        store
            .update(StatePatch {
                connection_state: Some(ConnectionState::ApMode),
                ap_password: Some(Some("s3cret-pass!".into())),
                ..Default::default()
            })
            .await;

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("s3cret-pass!"));
        assert!(!raw.contains("ap_password"));
    }

    #[tokio::test]
    async fn reload_round_trips_everything_but_secrets_and_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(Some(path.clone()));
        let written = store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Connected),
                ssid: Some("HomeNet".into()),
                ip_address: Some("192.168.1.23".into()),
                signal_dbm: Some(Some(-55)),
                ap_password: Some(Some("ephemeral".into())),
                tunnel_url: Some(Some("https://x.example".into())),
                tunnel_provider: Some(TunnelProvider::Ssh),
                ..Default::default()
            })
            .await;

        let reloaded = StateStore::new(Some(path)).get();
        assert_eq!(reloaded.connection_state, written.connection_state);
        assert_eq!(reloaded.ssid, written.ssid);
        assert_eq!(reloaded.ip_address, written.ip_address);
        assert_eq!(reloaded.signal_dbm, written.signal_dbm);
        assert_eq!(reloaded.session_id, written.session_id);
        // Secrets and tunnel endpoints must not survive a restart.
        assert!(reloaded.ap_password.is_none());
        assert!(reloaded.tunnel_url.is_none());
        assert_eq!(reloaded.tunnel_provider, TunnelProvider::None);
    }

    #[tokio::test]
    async fn callbacks_fire_in_registration_order() {
        let store = Arc::new(StateStore::new(None));
        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        let o1 = order.clone();
        store.on_change(move |_, _| {
            let o1 = o1.clone();
            async move {
                o1.lock().unwrap().push("first");
            }
            .boxed()
        });
        let o2 = order.clone();
        store.on_change(move |_, _| {
            let o2 = o2.clone();
            async move {
                o2.lock().unwrap().push("second");
            }
            .boxed()
        });

        store.update(StatePatch::default()).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn a_panicking_callback_does_not_stop_the_others() {
        let store = Arc::new(StateStore::new(None));
        let hits: Arc<StdMutex<u32>> = Arc::new(StdMutex::new(0));

        store.on_change(|_, _| async { panic!("boom") }.boxed());
        let h = hits.clone();
        store.on_change(move |_, _| {
            let h = h.clone();
            async move {
                *h.lock().unwrap() += 1;
            }
            .boxed()
        });

        store.update(StatePatch::default()).await;
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn removed_callbacks_stop_firing() {
        let store = Arc::new(StateStore::new(None));
        let hits: Arc<StdMutex<u32>> = Arc::new(StdMutex::new(0));
        let h = hits.clone();
        let id = store.on_change(move |_, _| {
            let h = h.clone();
            async move {
                *h.lock().unwrap() += 1;
            }
            .boxed()
        });

        store.update(StatePatch::default()).await;
        store.off_change(id);
        store.update(StatePatch::default()).await;
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn callbacks_observe_old_and_new_snapshots() {
        let store = Arc::new(StateStore::new(None));
        let seen: Arc<StdMutex<Vec<(ConnectionState, ConnectionState)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        store.on_change(move |old, new| {
            let s = s.clone();
            async move {
                s.lock()
                    .unwrap()
                    .push((old.connection_state, new.connection_state));
            }
            .boxed()
        });

        store
            .update(StatePatch {
                connection_state: Some(ConnectionState::ApMode),
                ..Default::default()
            })
            .await;
        store
            .update(StatePatch {
                connection_state: Some(ConnectionState::Switching),
                ..Default::default()
            })
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (ConnectionState::Disconnected, ConnectionState::ApMode),
                (ConnectionState::ApMode, ConnectionState::Switching),
            ]
        );
    }

    #[test]
    fn transition_table_matches_the_state_machine() {
        use ConnectionState::*;
        assert!(ApMode.can_transition_to(Switching));
        assert!(Switching.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(ApMode));
        assert!(Connected.can_transition_to(Switching));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connecting));
        // No shortcuts.
        assert!(!ApMode.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Connected));
    }

    #[test]
    fn states_serialise_as_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::ApMode).unwrap(),
            "\"AP_MODE\""
        );
        assert_eq!(
            serde_json::to_string(&TunnelProvider::Managed).unwrap(),
            "\"MANAGED\""
        );
    }
}
