//! mDNS advertisement through Avahi.
//!
//! Fire-and-forget: a service-group file is dropped into Avahi's services
//! directory and the daemon picks it up on its own. Failures are logged
//! and never propagate; losing mDNS must not take provisioning down.

use crate::identity::DeviceIdentity;
use crate::state::{StateStore, SystemState};
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::Arc;

const AVAHI_SERVICES_DIR: &str = "/etc/avahi/services";
const SERVICE_FILE_NAME: &str = "provisiond.service";

pub struct MdnsPublisher {
    service_file: PathBuf,
    hostname: String,
    port: u16,
}

impl MdnsPublisher {
    pub fn new(identity: &DeviceIdentity, port: u16) -> Arc<Self> {
        Arc::new(MdnsPublisher {
            service_file: PathBuf::from(AVAHI_SERVICES_DIR).join(SERVICE_FILE_NAME),
            hostname: identity.hostname.clone(),
            port,
        })
    }

    /// Write (or rewrite) the service file. Best-effort.
    pub async fn publish(&self) {
        let xml = service_group_xml(&self.hostname, self.port);
        if let Some(parent) = self.service_file.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %e, "cannot create Avahi services directory");
                return;
            }
        }
        match tokio::fs::write(&self.service_file, xml).await {
            Ok(()) => {
                tracing::info!(hostname = %self.hostname, port = self.port, "mDNS service advertised")
            }
            Err(e) => tracing::warn!(error = %e, "cannot write Avahi service file"),
        }
    }

    /// Remove the service file on shutdown. Best-effort.
    pub async fn unpublish(&self) {
        match tokio::fs::remove_file(&self.service_file).await {
            Ok(()) => tracing::info!("mDNS service withdrawn"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "cannot remove Avahi service file"),
        }
    }

    /// Re-publish whenever the device's address changes; Avahi resolves
    /// the hostname itself, but a rewrite nudges it after interface flips.
    pub fn attach(self: Arc<Self>, store: &StateStore) {
        let publisher = self;
        store.on_change(move |old: Arc<SystemState>, new: Arc<SystemState>| {
            let publisher = publisher.clone();
            async move {
                if old.ip_address != new.ip_address && !new.ip_address.is_empty() {
                    publisher.publish().await;
                }
            }
            .boxed()
        });
    }
}

fn service_group_xml(hostname: &str, port: u16) -> String {
    format!(
        r#"<?xml version="1.0" standalone='no'?>
<!DOCTYPE service-group SYSTEM "avahi-service.dtd">
<service-group>
  <name>{hostname} WiFi Setup</name>
  <service>
    <type>_http._tcp</type>
    <port>{port}</port>
    <txt-record>path=/</txt-record>
    <txt-record>device={hostname}</txt-record>
  </service>
</service-group>
"#
    )
}
