//! Captive portal plumbing, scoped to AP mode.
//!
//! Two side effects make unmodified phones pop the setup page: a wildcard
//! DNS drop-in for the daemon's dnsmasq (every A query resolves to the AP
//! address) and NAT REDIRECT rules that bend port-80 traffic to the local
//! web server. Acquisition is transactional; whatever was applied is
//! undone when a later step fails, and re-entry purges leftovers first.

use crate::config::Settings;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const DNSMASQ_DROPIN_DIR: &str = "/etc/NetworkManager/dnsmasq-shared.d";
const DNSMASQ_DROPIN_FILE: &str = "80-provisiond-captive.conf";

/// How many stacked duplicates of a rule purge will unwind.
const PURGE_DEPTH: usize = 4;

#[async_trait]
trait CommandRunner: Send + Sync {
    /// Run a command, returning whether it exited successfully.
    async fn run(&self, program: &str, args: &[String]) -> Result<bool>;
}

struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<bool> {
        let out = crate::backends::run_command(program, args).await?;
        Ok(out.success)
    }
}

#[derive(Default)]
struct PortalState {
    interface: Option<String>,
}

pub struct CaptivePortal {
    gateway_ip: Ipv4Addr,
    web_port: u16,
    dnsmasq_config: PathBuf,
    runner: Arc<dyn CommandRunner>,
    state: Mutex<PortalState>,
}

impl CaptivePortal {
    pub fn new(settings: &Settings) -> Self {
        CaptivePortal {
            gateway_ip: settings.ap_ip,
            web_port: settings.web_port,
            dnsmasq_config: PathBuf::from(DNSMASQ_DROPIN_DIR).join(DNSMASQ_DROPIN_FILE),
            runner: Arc::new(SystemRunner),
            state: Mutex::new(PortalState::default()),
        }
    }

    /// Bring the portal up on `interface`. Leftovers from a previous entry
    /// (including a crashed one) are purged before anything is applied.
    pub async fn enable(&self, interface: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.purge(&mut state, Some(interface)).await;

        if let Some(parent) = self.dnsmasq_config.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::CaptiveFailed(format!("cannot create dnsmasq drop-in dir: {e}"))
            })?;
        }
        tokio::fs::write(
            &self.dnsmasq_config,
            dnsmasq_config_contents(self.gateway_ip),
        )
        .await
        .map_err(|e| Error::CaptiveFailed(format!("cannot write dnsmasq drop-in: {e}")))?;

        for rule in nat_rules(interface, self.gateway_ip, self.web_port) {
            match self.apply_rule(&rule).await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    let failed = format!("iptables {}", rule.join(" "));
                    self.purge(&mut state, Some(interface)).await;
                    return Err(Error::CaptiveFailed(format!("rule rejected: {failed}")));
                }
            }
        }

        state.interface = Some(interface.to_string());
        tracing::info!(interface, "captive portal enabled");
        Ok(())
    }

    /// Release everything. Safe to call on all exit paths, including when
    /// the portal was never (fully) enabled.
    pub async fn disable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let interface = state.interface.clone();
        self.purge(&mut state, interface.as_deref()).await;
        tracing::info!("captive portal disabled");
        Ok(())
    }

    async fn apply_rule(&self, rule: &[String]) -> Result<bool> {
        let mut args: Vec<String> = vec!["-t".into(), "nat".into(), "-A".into()];
        args.extend_from_slice(rule);
        self.runner.run("iptables", &args).await
    }

    /// Delete every known rule (unwinding stacked duplicates) and remove
    /// the DNS drop-in. Never fails; missing rules are fine.
    async fn purge(&self, state: &mut PortalState, interface: Option<&str>) {
        if let Some(interface) = interface {
            for rule in nat_rules(interface, self.gateway_ip, self.web_port) {
                for _ in 0..PURGE_DEPTH {
                    let mut args: Vec<String> = vec!["-t".into(), "nat".into(), "-D".into()];
                    args.extend_from_slice(&rule);
                    match self.runner.run("iptables", &args).await {
                        Ok(true) => continue,
                        _ => break,
                    }
                }
            }
        }

        if self.dnsmasq_config.exists() {
            if let Err(e) = tokio::fs::remove_file(&self.dnsmasq_config).await {
                tracing::warn!(error = %e, "could not remove dnsmasq drop-in");
            }
        }
        state.interface = None;
    }
}

/// Wildcard DNS drop-in handed to the daemon's dnsmasq instance.
fn dnsmasq_config_contents(gateway_ip: Ipv4Addr) -> String {
    format!(
        "# Captive portal DNS configuration\n\
         # This file is automatically managed - do not edit manually\n\
         \n\
         # Return the gateway IP for all DNS queries (wildcard DNS)\n\
         address=/#/{gateway_ip}\n\
         \n\
         # Prevent DNS loops\n\
         no-resolv\n\
         no-poll\n"
    )
}

/// NAT rule bodies (without table/chain-action prefix) for the redirect.
fn nat_rules(interface: &str, gateway_ip: Ipv4Addr, web_port: u16) -> Vec<Vec<String>> {
    let port = web_port.to_string();
    let gateway = gateway_ip.to_string();
    vec![
        vec![
            "PREROUTING".into(),
            "-i".into(),
            interface.into(),
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            "80".into(),
            "-j".into(),
            "REDIRECT".into(),
            "--to-port".into(),
            port.clone(),
        ],
        // HTTPS cannot be truly redirected, but some detectors give up
        // faster when the port answers at all.
        vec![
            "PREROUTING".into(),
            "-i".into(),
            interface.into(),
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            "443".into(),
            "-j".into(),
            "REDIRECT".into(),
            "--to-port".into(),
            port,
        ],
        vec![
            "OUTPUT".into(),
            "-p".into(),
            "tcp".into(),
            "-d".into(),
            gateway,
            "--dport".into(),
            "80".into(),
            "-j".into(),
            "ACCEPT".into(),
        ],
    ]
}
