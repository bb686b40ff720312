//! Best-effort Bonjour advertisement via the host `dns-sd` tool.
//!
//! On Unix hosts with `dns-sd` on the PATH, the daemon registers
//! `_karnevil9._tcp.local.` under the configured service name. Absence of
//! the tool is not an error; the child is killed on shutdown.

use std::sync::Mutex;

use tracing::{debug, info};

/// mDNS service type advertised for the control plane.
pub const SERVICE_TYPE: &str = "_karnevil9._tcp";

/// Handle over the advertising child process.
#[derive(Default)]
pub struct MdnsHandle {
    child: Mutex<Option<tokio::process::Child>>,
}

impl MdnsHandle {
    /// Handle with no advertisement running.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Try to start advertisement; best effort.
    #[cfg(unix)]
    pub fn advertise(service_name: &str, port: u16) -> Self {
        let spawned = tokio::process::Command::new("dns-sd")
            .arg("-R")
            .arg(service_name)
            .arg(SERVICE_TYPE)
            .arg("local")
            .arg(port.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => {
                info!(service_name, port, "mDNS advertisement started");
                Self {
                    child: Mutex::new(Some(child)),
                }
            }
            Err(e) => {
                debug!(error = %e, "dns-sd unavailable; skipping mDNS advertisement");
                Self::disabled()
            }
        }
    }

    /// Non-Unix hosts never advertise.
    #[cfg(not(unix))]
    pub fn advertise(_service_name: &str, _port: u16) -> Self {
        Self::disabled()
    }

    /// Whether an advertisement child is running.
    pub fn is_active(&self) -> bool {
        self.child.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Stop the advertisement, killing the child process.
    pub async fn stop(&self) {
        let child = self.child.lock().ok().and_then(|mut c| c.take());
        if let Some(mut child) = child {
            let _ = child.kill().await;
            debug!("mDNS advertisement stopped");
        }
    }
}
