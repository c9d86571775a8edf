//! Pull-based display sink.
//!
//! The e-ink stack lives out of tree; this module only defines the
//! renderer contract and the polling loop that feeds it. The sink polls
//! the state store at a slow cadence and emits a frame only when
//! something the panel shows has changed, so it can never hold up the
//! orchestrator.

use crate::identity::DeviceIdentity;
use crate::state::{ConnectionState, StateStore, SystemState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Minimum period between two rendered frames.
const RENDER_PERIOD: Duration = Duration::from_secs(2);

/// Everything a provisioning screen can show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub state: ConnectionState,
    pub hostname: String,
    pub ssid: String,
    pub ip_address: String,
    pub ap_ssid: String,
    pub ap_password: Option<String>,
    pub tunnel_url: Option<String>,
}

impl DisplayFrame {
    pub fn from_state(identity: &DeviceIdentity, state: &SystemState) -> Self {
        DisplayFrame {
            state: state.connection_state,
            hostname: identity.hostname.clone(),
            ssid: state.ssid.clone(),
            ip_address: state.ip_address.clone(),
            ap_ssid: identity.ap_ssid.clone(),
            ap_password: state.ap_password.clone(),
            tunnel_url: state.tunnel_url.clone(),
        }
    }
}

/// Implemented by the actual panel driver.
#[async_trait]
pub trait DisplayRenderer: Send + Sync {
    async fn render(&self, frame: &DisplayFrame);
}

/// Default renderer: frames go to the log. Useful headless and in tests.
pub struct TracingRenderer;

#[async_trait]
impl DisplayRenderer for TracingRenderer {
    async fn render(&self, frame: &DisplayFrame) {
        tracing::info!(
            state = %frame.state,
            ssid = %frame.ssid,
            ip = %frame.ip_address,
            "display frame"
        );
    }
}

/// Poll the store and hand changed frames to the renderer. Runs forever;
/// spawn it as its own task.
pub async fn run_display_sink(
    store: Arc<StateStore>,
    identity: Arc<DeviceIdentity>,
    renderer: Arc<dyn DisplayRenderer>,
) {
    let mut last_frame: Option<DisplayFrame> = None;
    loop {
        let frame = DisplayFrame::from_state(&identity, &store.get());
        if last_frame.as_ref() != Some(&frame) {
            renderer.render(&frame).await;
            last_frame = Some(frame);
        }
        sleep(RENDER_PERIOD).await;
    }
}
