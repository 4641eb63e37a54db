use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;

use crate::adb::client::AdbClient;
use crate::adb::crypto::AdbCrypto;
use crate::adb::event::{AdbEvent, AdbEventKind, AdbStatus};
use crate::adb::{AdbConfig, PushSource};
use crate::error::{MirrorError, Result};
use crate::event::EventBus;

enum RegistryCommand {
    Connect {
        ip: String,
        port: u16,
    },
    Disconnect(String),
    /// `None` fans out to every connected client.
    SendCommand {
        ip: Option<String>,
        command: String,
    },
    Push {
        ip: Option<String>,
        source: PushSource,
        remote_path: String,
    },
    Status {
        ip: String,
        reply: Sender<AdbStatus>,
    },
    Release,
}

/// Owns the IP-to-client map on a single worker thread.
///
/// Handles are cheap to clone; every clone talks to the same worker and
/// shares one event stream. Clients for every device publish into it.
#[derive(Clone)]
pub struct AdbRegistry {
    commands: Sender<RegistryCommand>,
    events: EventBus<AdbEvent>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AdbRegistry {
    pub fn new(config: AdbConfig, crypto: Option<Arc<dyn AdbCrypto>>) -> Self {
        let (tx, rx) = unbounded();
        let events = EventBus::new();
        let worker = RegistryWorker {
            config,
            crypto,
            events: events.clone(),
            clients: HashMap::new(),
        };
        let handle = thread::spawn(move || worker.run(rx));

        Self {
            commands: tx,
            events,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub fn subscribe(&self) -> Receiver<AdbEvent> {
        self.events.subscribe()
    }

    pub fn connect(&self, ip: &str, port: u16) -> Result<()> {
        self.enqueue(RegistryCommand::Connect {
            ip: ip.to_string(),
            port,
        })
    }

    pub fn disconnect(&self, ip: &str) -> Result<()> {
        self.enqueue(RegistryCommand::Disconnect(ip.to_string()))
    }

    /// Send a shell line to one device.
    pub fn send_command(&self, ip: &str, command: &str) -> Result<()> {
        self.enqueue(RegistryCommand::SendCommand {
            ip: Some(ip.to_string()),
            command: command.to_string(),
        })
    }

    /// Send a shell line to every connected device.
    pub fn broadcast_command(&self, command: &str) -> Result<()> {
        self.enqueue(RegistryCommand::SendCommand {
            ip: None,
            command: command.to_string(),
        })
    }

    pub fn push_file(&self, ip: &str, source: PushSource, remote_path: &str) -> Result<()> {
        self.enqueue(RegistryCommand::Push {
            ip: Some(ip.to_string()),
            source,
            remote_path: remote_path.to_string(),
        })
    }

    /// Push to every connected device; each reports its own `FilePushed`.
    pub fn broadcast_push(&self, source: PushSource, remote_path: &str) -> Result<()> {
        self.enqueue(RegistryCommand::Push {
            ip: None,
            source,
            remote_path: remote_path.to_string(),
        })
    }

    /// Current status of a device, `Disconnected` when unknown.
    pub fn status(&self, ip: &str) -> Result<AdbStatus> {
        let (tx, rx) = bounded(1);
        self.enqueue(RegistryCommand::Status {
            ip: ip.to_string(),
            reply: tx,
        })?;
        rx.recv().map_err(|_| MirrorError::Channel("registry status reply"))
    }

    /// Disconnect every connected client and stop the worker.
    pub fn release(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.commands.send(RegistryCommand::Release);
        if worker.join().is_err() {
            tracing::error!("ADB registry worker panicked");
        }
    }

    fn enqueue(&self, command: RegistryCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| MirrorError::Released)
    }
}

struct RegistryWorker {
    config: AdbConfig,
    crypto: Option<Arc<dyn AdbCrypto>>,
    events: EventBus<AdbEvent>,
    clients: HashMap<String, AdbClient>,
}

impl RegistryWorker {
    fn run(mut self, rx: Receiver<RegistryCommand>) {
        for command in rx.iter() {
            match command {
                RegistryCommand::Connect { ip, port } => self.connect(ip, port),
                RegistryCommand::Disconnect(ip) => match self.clients.get(&ip) {
                    Some(client) => log_err(&ip, client.disconnect()),
                    None => tracing::debug!(ip = %ip, "disconnect for unknown device"),
                },
                RegistryCommand::SendCommand { ip, command } => self.send_command(ip.as_deref(), &command),
                RegistryCommand::Push {
                    ip,
                    source,
                    remote_path,
                } => self.push(ip.as_deref(), &source, &remote_path),
                RegistryCommand::Status { ip, reply } => {
                    let status = self
                        .clients
                        .get(&ip)
                        .map_or(AdbStatus::Disconnected, AdbClient::status);
                    let _ = reply.send(status);
                }
                RegistryCommand::Release => break,
            }
        }
        self.release();
    }

    fn connect(&mut self, ip: String, port: u16) {
        if self.clients.get(&ip).is_some_and(|c| c.port() != port) {
            tracing::info!(ip = %ip, port, "port changed, replacing client");
            self.clients.remove(&ip);
        }

        let client = self.clients.entry(ip.clone()).or_insert_with(|| {
            let config = AdbConfig {
                port,
                ..self.config.clone()
            };
            AdbClient::new(&ip, config, self.crypto.clone(), self.events.clone())
        });
        log_err(&ip, client.connect());
    }

    fn send_command(&self, ip: Option<&str>, command: &str) {
        match ip {
            Some(ip) => match self.clients.get(ip) {
                Some(client) => log_err(ip, client.write(command)),
                None => tracing::warn!(ip, "command for unknown device dropped"),
            },
            None => {
                for client in self.connected() {
                    log_err(client.ip(), client.write(command));
                }
            }
        }
    }

    fn push(&self, ip: Option<&str>, source: &PushSource, remote_path: &str) {
        match ip {
            Some(ip) => match self.clients.get(ip) {
                Some(client) => log_err(ip, client.push(source.clone(), remote_path)),
                None => {
                    tracing::warn!(ip, "push for unknown device");
                    self.events.publish(AdbEvent {
                        ip: ip.to_string(),
                        kind: AdbEventKind::FilePushed(false),
                    });
                }
            },
            None => {
                for client in self.connected() {
                    log_err(client.ip(), client.push(source.clone(), remote_path));
                }
            }
        }
    }

    fn connected(&self) -> impl Iterator<Item = &AdbClient> {
        self.clients
            .values()
            .filter(|c| c.status() == AdbStatus::Connected)
    }

    fn release(&mut self) {
        for client in self.connected() {
            log_err(client.ip(), client.disconnect());
        }
        // Dropping a client drains its queue and joins its worker.
        let released = self.clients.len();
        self.clients.clear();
        tracing::debug!(released, "ADB registry released");
    }
}

fn log_err(ip: &str, result: Result<()>) {
    if let Err(e) = result {
        tracing::warn!(ip, error = %e, "ADB client rejected request");
    }
}
