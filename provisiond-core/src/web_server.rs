//! HTTP/WebSocket surface.
//!
//! Thin axum layer over the orchestrator and the state store: REST for
//! status/scan/connect/disconnect, a WebSocket that mirrors every state
//! change, and the captive-portal catch-all that makes phones pop the
//! setup page.

use crate::config::Settings;
use crate::embed;
use crate::identity::DeviceIdentity;
use crate::orchestrator::{validate_connect_input, Orchestrator};
use crate::state::{ConnectionState, ErrorInfo, PersistenceHealth, StateStore, SystemState, TunnelProvider};
use crate::traits::{NetworkBackend, WifiNetwork};
use crate::{Error, Result};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

/// Scans are rate-limited; within this window the cached list is served.
const SCAN_CACHE_TTL: Duration = Duration::from_secs(5);
/// A WebSocket that cannot take a frame for this long is dropped.
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(1);
const STATE_CHANNEL_CAPACITY: usize = 32;

const APPLE_SUCCESS_BODY: &str =
    "<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>";
const NCSI_BODY: &str = "Microsoft NCSI";
const CONNECTTEST_BODY: &str = "Microsoft Connect Test";

#[derive(Default)]
struct ScanCache {
    refreshed_at: Option<Instant>,
    networks: Vec<WifiNetwork>,
}

pub struct AppState {
    pub settings: Arc<Settings>,
    pub identity: Arc<DeviceIdentity>,
    pub store: Arc<StateStore>,
    pub backend: Arc<dyn NetworkBackend>,
    pub orchestrator: Arc<Orchestrator>,
    updates: broadcast::Sender<Arc<SystemState>>,
    scan_cache: Mutex<ScanCache>,
    inflight_connects: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        identity: Arc<DeviceIdentity>,
        store: Arc<StateStore>,
        backend: Arc<dyn NetworkBackend>,
        orchestrator: Arc<Orchestrator>,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);

        // Forward every store change onto the broadcast bus. The callback
        // runs under the store's update lock, so subscribers observe
        // snapshots in publication order.
        let tx = updates.clone();
        store.on_change(move |_old, new| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(new);
            }
            .boxed()
        });

        Arc::new(AppState {
            settings,
            identity,
            store,
            backend,
            orchestrator,
            updates,
            scan_cache: Mutex::new(ScanCache::default()),
            inflight_connects: Mutex::new(HashSet::new()),
        })
    }
}

/// The status shape served over REST and WebSocket. `ap_password` is only
/// present while the device is in AP mode.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: ConnectionState,
    pub ssid: String,
    pub ip_address: String,
    pub signal_dbm: Option<i32>,
    pub tunnel_url: Option<String>,
    pub tunnel_provider: TunnelProvider,
    pub error: Option<ErrorInfo>,
    pub session_id: Uuid,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ap_password: Option<String>,
}

impl StatusResponse {
    pub fn from_state(state: &SystemState) -> Self {
        StatusResponse {
            state: state.connection_state,
            ssid: state.ssid.clone(),
            ip_address: state.ip_address.clone(),
            signal_dbm: state.signal_dbm,
            tunnel_url: state.tunnel_url.clone(),
            tunnel_provider: state.tunnel_provider,
            error: state.error.clone(),
            session_id: state.session_id,
            updated_at: state.updated_at,
            ap_password: if state.connection_state == ConnectionState::ApMode {
                state.ap_password.clone()
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub ssid: String,
    #[serde(default)]
    pub password: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/api/status", get(api_status))
        .route("/api/networks", get(api_networks))
        .route("/api/connect", post(api_connect))
        .route("/api/disconnect", post(api_disconnect))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Captive-portal probe endpoints of the major OS families.
        .route("/generate_204", get(probe_generate_204))
        .route("/gen_204", get(probe_generate_204))
        .route("/hotspot-detect.html", get(probe_apple))
        .route("/library/test/success.html", get(probe_apple))
        .route("/success.txt", get(probe_success_txt))
        .route("/ncsi.txt", get(probe_ncsi))
        .route("/connecttest.txt", get(probe_connecttest))
        .route("/canonical.html", get(probe_apple))
        .route("/kindle-wifi/wifistub.html", get(probe_apple))
        .fallback(catch_all)
        .with_state(state)
}

/// Bind-and-serve entry point for the daemon.
pub async fn serve(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    let app = router(state);
    axum::serve(listener, app).await.map_err(Error::Io)
}

fn http_status(error: &Error) -> StatusCode {
    match error {
        Error::BadInput(_) => StatusCode::BAD_REQUEST,
        Error::Busy => StatusCode::CONFLICT,
        Error::NoDevice | Error::ScanBusy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &Error) -> Response {
    (
        http_status(error),
        Json(json!({ "error": { "code": error.code(), "message": error.to_string() } })),
    )
        .into_response()
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in raw.split(';') {
        let mut kv = part.trim().splitn(2, '=');
        if kv.next() == Some("session_id") {
            return kv.next().map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        }
    }
    None
}

fn portal_redirect(state: &AppState) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, state.settings.portal_base_url())],
    )
        .into_response()
}

async fn api_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse::from_state(&state.store.get()))
}

async fn api_networks(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.store.get();
    let is_ap_mode = snapshot.connection_state == ConnectionState::ApMode;
    // The radio is busy while an attempt is switching it over; serve the
    // cached list rather than racing the connect.
    let radio_busy = matches!(
        snapshot.connection_state,
        ConnectionState::Switching | ConnectionState::Connecting
    );

    let mut cache = state.scan_cache.lock().await;
    let fresh = cache
        .refreshed_at
        .map(|at| at.elapsed() < SCAN_CACHE_TTL)
        .unwrap_or(false);

    if !fresh && !radio_busy {
        match state.backend.scan().await {
            Ok(networks) => {
                cache.refreshed_at = Some(Instant::now());
                cache.networks = networks;
            }
            Err(Error::ScanBusy) => {
                tracing::debug!("scan busy, serving cached list");
            }
            Err(e) => {
                if cache.networks.is_empty() {
                    return error_response(&e);
                }
                tracing::warn!(error = %e, "scan failed, serving cached list");
            }
        }
    }

    let networks = cache.networks.clone();
    drop(cache);

    let message = if is_ap_mode && networks.is_empty() {
        Some("Connect to the access point first to see available networks")
    } else {
        None
    };

    Json(json!({
        "is_ap_mode": is_ap_mode,
        "networks": networks,
        "message": message,
    }))
    .into_response()
}

async fn api_connect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ConnectRequest>,
) -> Response {
    // Empty password means an open network.
    let password = request.password.filter(|p| !p.is_empty());

    if let Err(e) = validate_connect_input(&request.ssid, password.as_deref()) {
        return error_response(&e);
    }
    if state.orchestrator.user_attempt_in_progress() {
        return error_response(&Error::Busy);
    }

    // One in-flight connect per browser session.
    let cookie = session_cookie(&headers).unwrap_or_else(|| Uuid::new_v4().to_string());
    {
        let mut inflight = state.inflight_connects.lock().await;
        if !inflight.insert(cookie.clone()) {
            return error_response(&Error::Busy);
        }
    }

    let session_id = Uuid::new_v4();
    let task_state = state.clone();
    let ssid = request.ssid;
    tokio::spawn(async move {
        if let Err(e) = task_state
            .orchestrator
            .user_connect(ssid, password, session_id)
            .await
        {
            tracing::warn!(code = e.code(), error = %e, "connection attempt ended in error");
        }
        task_state.inflight_connects.lock().await.remove(&cookie);
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "connecting", "session_id": session_id })),
    )
        .into_response()
}

async fn api_disconnect(State(state): State<Arc<AppState>>) -> Response {
    let task_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = task_state.orchestrator.user_disconnect().await {
            tracing::warn!(error = %e, "disconnect failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "disconnecting" })),
    )
        .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "healthy",
        "service": "provisiond",
        "device": state.identity.hostname.clone(),
    }))
    .into_response()
}

async fn ready(State(state): State<Arc<AppState>>) -> Response {
    let wifi_present = state.backend.wifi_interface().await.is_some();
    let persistence_ok = state.store.persistence_health() != PersistenceHealth::Failed;
    let all_ready = wifi_present && persistence_ok;

    let body = json!({
        "ready": all_ready,
        "checks": {
            "wifi_device": wifi_present,
            "state_persistence": persistence_ok,
        },
        "state": state.store.get().connection_state,
    });
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// --- Captive portal probes ---
//
// In AP mode every probe answers with a redirect to the setup page, which
// is what makes the client OS pop its sign-in sheet. Outside AP mode each
// probe gets the exact payload its OS expects, so the device does not look
// like a captive network once provisioned.

async fn probe_generate_204(State(state): State<Arc<AppState>>) -> Response {
    if state.store.is_ap_mode() {
        portal_redirect(&state)
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn probe_apple(State(state): State<Arc<AppState>>) -> Response {
    if state.store.is_ap_mode() {
        portal_redirect(&state)
    } else {
        Html(APPLE_SUCCESS_BODY).into_response()
    }
}

async fn probe_success_txt(State(state): State<Arc<AppState>>) -> Response {
    if state.store.is_ap_mode() {
        portal_redirect(&state)
    } else {
        "success\n".into_response()
    }
}

async fn probe_ncsi(State(state): State<Arc<AppState>>) -> Response {
    if state.store.is_ap_mode() {
        portal_redirect(&state)
    } else {
        NCSI_BODY.into_response()
    }
}

async fn probe_connecttest(State(state): State<Arc<AppState>>) -> Response {
    if state.store.is_ap_mode() {
        portal_redirect(&state)
    } else {
        CONNECTTEST_BODY.into_response()
    }
}

// --- Pages & assets ---

async fn serve_index() -> Response {
    serve_asset("index.html")
}

fn serve_asset(path: &str) -> Response {
    match embed::get_asset(path) {
        Some((data, mime)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime)
            .body(Body::from(data.into_owned()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Unknown paths: in AP mode everything funnels to the setup page (the
/// wildcard DNS sends arbitrary hosts here); otherwise serve assets with
/// an index.html fallback for client-side routes. The setup page's own
/// subresources are always served, even mid-captive-portal.
async fn catch_all(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    if !path.is_empty() && embed::get_asset(path).is_some() {
        return serve_asset(path);
    }

    if state.store.is_ap_mode() {
        return portal_redirect(&state);
    }
    serve_asset("index.html")
}

// --- WebSocket ---

async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_session(state, socket))
}

/// One WebSocket client: an initial full snapshot, then every state
/// change. Client messages are ignored except "ping". A client that
/// cannot take a frame within the send timeout is dropped.
async fn ws_session(state: Arc<AppState>, mut socket: WebSocket) {
    let mut updates = state.updates.subscribe();

    if send_snapshot(&mut socket, &state.store.get()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(snapshot) => {
                    if send_snapshot(&mut socket, &snapshot).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "WebSocket client lagged, resyncing");
                    if send_snapshot(&mut socket, &state.store.get()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                    let _ = socket.send(Message::Text("pong".into())).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

async fn send_snapshot(
    socket: &mut WebSocket,
    snapshot: &SystemState,
) -> std::result::Result<(), ()> {
    let payload = serde_json::to_string(&StatusResponse::from_state(snapshot)).map_err(|_| ())?;
    match tokio::time::timeout(WS_SEND_TIMEOUT, socket.send(Message::Text(payload.into()))).await {
        Ok(Ok(())) => Ok(()),
        // Backpressure or a dead peer; either way the connection goes.
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::MockBackend;
    use crate::captive_portal::CaptivePortal;
    use crate::state::StatePatch;
    use crate::tunnel::TunnelSupervisor;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let mut settings = Settings::default();
        settings.enable_captive_portal = false;
        settings.tunnel_enabled = false;
        let settings = Arc::new(settings);
        let identity =
            Arc::new(DeviceIdentity::from_mac("b8:27:eb:12:34:ab", "Distiller").unwrap());
        let store = Arc::new(StateStore::new(None));
        let backend = Arc::new(MockBackend::new());
        let captive = Arc::new(CaptivePortal::new(&settings));
        let tunnel = TunnelSupervisor::new(settings.clone(), store.clone());
        let orchestrator = Orchestrator::new(
            settings.clone(),
            identity.clone(),
            store.clone(),
            backend.clone(),
            captive,
            tunnel,
        );
        AppState::new(settings, identity, store, backend, orchestrator)
    }

    async fn get_response(state: Arc<AppState>, path: &str) -> Response {
        router(state)
            .oneshot(
                Request::builder()
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn post_json(state: Arc<AppState>, path: &str, body: serde_json::Value) -> Response {
        router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn ap_password_is_only_serialised_in_ap_mode() {
        let mut state = SystemState::default();
        state.ap_password = Some("hushhush12ab".into());

        state.connection_state = ConnectionState::ApMode;
        let json = serde_json::to_string(&StatusResponse::from_state(&state)).unwrap();
        assert!(json.contains("hushhush12ab"));

        state.connection_state = ConnectionState::Connected;
        let json = serde_json::to_string(&StatusResponse::from_state(&state)).unwrap();
        assert!(!json.contains("hushhush12ab"));
        assert!(!json.contains("ap_password"));
    }

    #[tokio::test]
    async fn status_endpoint_returns_the_snapshot() {
        let state = test_state();
        let response = get_response(state, "/api/status").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "DISCONNECTED");
        assert!(body["session_id"].is_string());
    }

    #[tokio::test]
    async fn probes_redirect_only_in_ap_mode() {
        let state = test_state();

        let response = get_response(state.clone(), "/generate_204").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        state
            .store
            .update(StatePatch {
                connection_state: Some(ConnectionState::ApMode),
                ..Default::default()
            })
            .await;

        for path in [
            "/generate_204",
            "/hotspot-detect.html",
            "/library/test/success.html",
            "/ncsi.txt",
            "/success.txt",
            "/connecttest.txt",
        ] {
            let response = get_response(state.clone(), path).await;
            assert_eq!(response.status(), StatusCode::FOUND, "path {path}");
            assert_eq!(
                response.headers()[header::LOCATION],
                "http://192.168.4.1:8080/"
            );
        }
    }

    #[tokio::test]
    async fn probes_serve_expected_payloads_when_provisioned() {
        let state = test_state();
        let response = get_response(state.clone(), "/ncsi.txt").await;
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], NCSI_BODY.as_bytes());

        let response = get_response(state, "/hotspot-detect.html").await;
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("Success"));
    }

    #[tokio::test]
    async fn malformed_connect_input_is_a_400_and_leaves_state_alone() {
        let state = test_state();
        let before = state.store.get();

        for body in [
            json!({ "ssid": "HomeNet", "password": "wrong" }),
            json!({ "ssid": "", "password": "hunter2hunter2" }),
            json!({ "ssid": "Home;Net", "password": "hunter2hunter2" }),
            json!({ "ssid": "Home`Net", "password": "hunter2hunter2" }),
            json!({ "ssid": "HomeNet", "password": "pass|word123" }),
            json!({ "ssid": "HomeNet", "password": "pass$word123" }),
        ] {
            let response = post_json(state.clone(), "/api/connect", body).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let json = body_json(response).await;
            assert_eq!(json["error"]["code"], "BAD_INPUT");
        }

        let after = state.store.get();
        assert_eq!(after.connection_state, before.connection_state);
        assert_eq!(after.ssid, before.ssid);
        assert_eq!(after.session_id, before.session_id);
    }

    #[tokio::test]
    async fn connect_answers_202_and_reaches_connected() {
        let state = test_state();
        let response = post_json(
            state.clone(),
            "/api/connect",
            json!({ "ssid": "HomeNet", "password": "hunter2hunter2" }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let session_id: Uuid = serde_json::from_value(body["session_id"].clone()).unwrap();

        // The attempt runs in the background; wait for it to land.
        for _ in 0..100 {
            if state.store.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let snapshot = state.store.get();
        assert_eq!(snapshot.connection_state, ConnectionState::Connected);
        assert_eq!(snapshot.ssid, "HomeNet");
        assert!(!snapshot.ip_address.is_empty());
        assert_eq!(snapshot.session_id, session_id);
    }

    #[tokio::test]
    async fn disconnect_answers_202() {
        let state = test_state();
        let response = post_json(state, "/api/disconnect", json!({})).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn health_and_ready_report_ok_with_a_working_backend() {
        let state = test_state();
        let response = get_response(state.clone(), "/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = get_response(state, "/ready").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn networks_endpoint_reports_ap_mode_flag() {
        let state = test_state();
        let response = get_response(state.clone(), "/api/networks").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["is_ap_mode"], false);
        assert!(body["networks"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn unknown_paths_redirect_in_ap_mode_and_serve_the_app_otherwise() {
        let state = test_state();

        let response = get_response(state.clone(), "/some/client/route").await;
        assert_eq!(response.status(), StatusCode::OK);

        state
            .store
            .update(StatePatch {
                connection_state: Some(ConnectionState::ApMode),
                ..Default::default()
            })
            .await;
        let response = get_response(state, "/some/client/route").await;
        assert_eq!(response.status(), StatusCode::FOUND);
    }
}
