//! Process wiring: build every component, start the long-lived tasks,
//! then wait for a shutdown signal and unwind in reverse order.

use anyhow::{bail, Context, Result};
use provisiond_core::backends::network_manager::NetworkManagerBackend;
use provisiond_core::captive_portal::CaptivePortal;
use provisiond_core::config::Settings;
use provisiond_core::display::{run_display_sink, TracingRenderer};
use provisiond_core::identity::IdentityStore;
use provisiond_core::mdns::MdnsPublisher;
use provisiond_core::orchestrator::Orchestrator;
use provisiond_core::state::StateStore;
use provisiond_core::traits::NetworkBackend;
use provisiond_core::tunnel::TunnelSupervisor;
use provisiond_core::web_server::{self, AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

pub async fn run(debug: bool) -> Result<()> {
    let mut settings = Settings::from_env().context("invalid configuration")?;
    settings.debug |= debug;
    let settings = Arc::new(settings);

    std::fs::create_dir_all(&settings.state_dir).with_context(|| {
        format!(
            "cannot create state directory {}",
            settings.state_dir.display()
        )
    })?;

    let identity = Arc::new(
        IdentityStore::new(settings.device_file())
            .load_or_create(&settings.ap_ssid_prefix)
            .context("cannot establish device identity")?,
    );
    tracing::info!(
        device_id = %identity.device_id,
        hostname = %identity.hostname,
        ap_ssid = %identity.ap_ssid,
        "device identity"
    );

    let store = Arc::new(StateStore::new(Some(settings.state_file())));

    let nm = Arc::new(NetworkManagerBackend::new());
    nm.initialize()
        .await
        .context("no usable WiFi device")?;
    nm.clone().spawn_monitor();
    let backend: Arc<dyn NetworkBackend> = nm;

    let captive = Arc::new(CaptivePortal::new(&settings));
    let tunnel = TunnelSupervisor::new(settings.clone(), store.clone());
    tokio::spawn(tunnel.clone().run());

    let orchestrator = Orchestrator::new(
        settings.clone(),
        identity.clone(),
        store.clone(),
        backend.clone(),
        captive.clone(),
        tunnel.clone(),
    );

    // Bind before touching the radio: the captive portal needs somewhere
    // to send clients the moment the AP comes up.
    let listener = TcpListener::bind((settings.web_host, settings.web_port))
        .await
        .with_context(|| format!("cannot bind {}:{}", settings.web_host, settings.web_port))?;
    tracing::info!(host = %settings.web_host, port = settings.web_port, "web server listening");

    let app_state = AppState::new(
        settings.clone(),
        identity.clone(),
        store.clone(),
        backend.clone(),
        orchestrator.clone(),
    );
    let mut server = tokio::spawn(web_server::serve(app_state, listener));

    let mdns = MdnsPublisher::new(&identity, settings.web_port);
    mdns.publish().await;
    mdns.clone().attach(&store);

    tokio::spawn(run_display_sink(
        store.clone(),
        identity.clone(),
        Arc::new(TracingRenderer),
    ));
    tokio::spawn(orchestrator.clone().run_event_loop());

    orchestrator.startup().await.context("startup failed")?;
    tracing::info!(
        "setup page: http://{}:{} (or http://{}.local:{})",
        settings.ap_ip,
        settings.web_port,
        identity.hostname,
        settings.web_port
    );

    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
        _ = sigterm.recv() => tracing::info!("termination requested"),
        result = &mut server => {
            return match result {
                Ok(Ok(())) => bail!("web server exited unexpectedly"),
                Ok(Err(e)) => Err(e).context("web server failed"),
                Err(e) => Err(e).context("web server task panicked"),
            };
        }
    }

    // Unwind in reverse order of construction.
    tunnel.stop();
    if let Err(e) = captive.disable().await {
        tracing::warn!(error = %e, "captive portal cleanup failed");
    }
    mdns.unpublish().await;
    server.abort();

    Ok(())
}
