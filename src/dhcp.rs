// SPDX-License-Identifier: MIT

//! Supervisor for the external `dhcp` worker. The daemon's job ends
//! at the key handshake; address configuration is somebody else's
//! problem, started on connect and SIGTERMed on the way down.

use std::process::ExitStatus;

use log::warn;
use tokio::process::{Child, Command};

const DHCP_BIN: &str = "dhcp";

#[derive(Default)]
pub struct DhcpChild {
    child: Option<Child>,
}

impl DhcpChild {
    /// Starts `dhcp <ifname>`, replacing any worker still running.
    pub fn trigger(&mut self, ifname: &str) {
        self.kill();
        match Command::new(DHCP_BIN).arg(ifname).spawn() {
            Ok(child) => self.child = Some(child),
            Err(e) => warn!("exec {DHCP_BIN}: {e}"),
        }
    }

    /// Asks the worker to stop. The exit status is collected by the
    /// event loop awaiting [`DhcpChild::wait`].
    pub fn kill(&mut self) {
        if let Some(child) = &self.child {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Pends until the worker exits; pends forever while none runs,
    /// which is exactly what a select arm wants.
    pub async fn wait(&mut self) -> ExitStatus {
        match &mut self.child {
            Some(child) => {
                let status = child
                    .wait()
                    .await
                    .unwrap_or_else(|_| ExitStatus::default());
                self.child = None;
                status
            }
            None => std::future::pending().await,
        }
    }

    /// Non-fatal post-mortem, same diagnostics as the original.
    pub fn log_exit(status: ExitStatus) {
        use std::os::unix::process::ExitStatusExt;
        if status.success() {
            return;
        }
        if let Some(code) = status.code() {
            warn!("dhcp failed with code {code}");
        } else if let Some(sig) = status.signal() {
            warn!("dhcp killed by signal {sig}");
        }
    }
}
