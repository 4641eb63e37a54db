//! Companion daemon bootstrap over ADB.
//!
//! Once a target connects, make sure the daemon package is installed on it
//! and start it:
//!
//! ```text
//! CONNECTED                    -> pm list packages
//! listing has the package      -> am broadcast -n <starter>
//! listing lacks it             -> push apk to <remote path>
//! FILE_PUSHED(true)            -> pm install <remote path>
//! install output has "Success" -> am broadcast -n <starter>
//! ```
//!
//! Shell responses are matched by the echoed command they contain.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded, select};

use crate::adb::{AdbEvent, AdbEventKind, AdbRegistry, AdbStatus, PushSource};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub package: String,
    /// Broadcast receiver component that launches the daemon.
    pub starter: String,
    pub remote_apk_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            package: "com.boostvision.daemon".to_string(),
            starter: "com.boostvision.daemon/.DaemonStarter".to_string(),
            remote_apk_path: "/data/local/tmp/daemon.apk".to_string(),
        }
    }
}

/// What to do in reaction to an ADB event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapAction {
    Send(String),
    PushApk,
    Started,
}

pub struct DaemonBootstrap {
    ip: String,
    config: DaemonConfig,
}

impl DaemonBootstrap {
    pub fn new(ip: &str, config: DaemonConfig) -> Self {
        Self {
            ip: ip.to_string(),
            config,
        }
    }

    pub fn start_command(&self) -> String {
        format!("am broadcast -n {}\n", self.config.starter)
    }

    /// Next step for `event`; events for other devices yield `None`.
    pub fn on_event(&self, event: &AdbEvent) -> Option<BootstrapAction> {
        if event.ip != self.ip {
            return None;
        }
        match &event.kind {
            AdbEventKind::Status(AdbStatus::Connected) => {
                Some(BootstrapAction::Send("pm list packages\n".to_string()))
            }
            AdbEventKind::Response(response) if response.contains("pm list packages") => {
                if self.is_installed(response) {
                    Some(BootstrapAction::Send(self.start_command()))
                } else {
                    tracing::info!(ip = %self.ip, package = %self.config.package, "daemon not installed");
                    Some(BootstrapAction::PushApk)
                }
            }
            AdbEventKind::Response(response) if response.contains("pm install") => {
                if response.contains("Success") {
                    Some(BootstrapAction::Send(self.start_command()))
                } else {
                    tracing::warn!(ip = %self.ip, response = %response, "daemon install failed");
                    None
                }
            }
            AdbEventKind::Response(response) if response.contains("am broadcast") => {
                Some(BootstrapAction::Started)
            }
            AdbEventKind::FilePushed(true) => Some(BootstrapAction::Send(format!(
                "pm install {}\n",
                self.config.remote_apk_path
            ))),
            AdbEventKind::FilePushed(false) => {
                tracing::warn!(ip = %self.ip, "daemon apk push failed");
                None
            }
            _ => None,
        }
    }

    fn is_installed(&self, listing: &str) -> bool {
        listing
            .lines()
            .filter_map(|line| line.split_once("package:"))
            .any(|(_, name)| name.trim() == self.config.package)
    }

    /// Drive the bootstrap from `registry`'s events on a background thread.
    pub fn spawn(self, registry: AdbRegistry, apk: PushSource) -> BootstrapHandle {
        let events = registry.subscribe();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = thread::spawn(move || {
            loop {
                select! {
                    recv(events) -> event => {
                        let Ok(event) = event else { break };
                        if let Err(e) = self.apply(&registry, &apk, &event) {
                            tracing::warn!(ip = %self.ip, error = %e, "daemon bootstrap stopped");
                            break;
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
        });

        BootstrapHandle {
            stop: stop_tx,
            thread: Some(thread),
        }
    }

    fn apply(&self, registry: &AdbRegistry, apk: &PushSource, event: &AdbEvent) -> Result<()> {
        match self.on_event(event) {
            Some(BootstrapAction::Send(command)) => registry.send_command(&self.ip, &command),
            Some(BootstrapAction::PushApk) => {
                registry.push_file(&self.ip, apk.clone(), &self.config.remote_apk_path)
            }
            Some(BootstrapAction::Started) => {
                tracing::info!(ip = %self.ip, "daemon started");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

pub struct BootstrapHandle {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl BootstrapHandle {
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.stop.send(());
        let _ = thread.join();
    }
}

impl Drop for BootstrapHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
