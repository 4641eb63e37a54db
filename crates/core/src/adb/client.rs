//! A client for one ADB daemon endpoint.
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED
//!                      |                          ^
//!                      +------ connect error -----+
//! ```
//!
//! Control operations are queued to a per-client worker and applied in
//! order. Blocking I/O for the handshake and the shell read loop runs on
//! separate threads that report back through the same queue, tagged with
//! the connection generation so stale reports are ignored.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::adb::connection::{AdbConnection, AdbStream};
use crate::adb::crypto::AdbCrypto;
use crate::adb::event::{AdbEvent, AdbEventKind, AdbStatus};
use crate::adb::{AdbConfig, PushSource, sync};
use crate::error::{ErrorKind, MirrorError, Result};
use crate::event::EventBus;

/// Shell prompt that terminates one command's output.
pub const PROMPT_SENTINEL: &str = "/ $ ";

enum Command {
    Connect,
    Disconnect,
    Write(String),
    Push {
        source: PushSource,
        remote_path: String,
    },
    Established {
        generation: u64,
        connection: AdbConnection,
        shell: Arc<AdbStream>,
    },
    ConnectFailed {
        generation: u64,
        error: MirrorError,
    },
    Lost {
        generation: u64,
    },
    Shutdown,
}

pub struct AdbClient {
    ip: String,
    port: u16,
    commands: Sender<Command>,
    status: Arc<Mutex<AdbStatus>>,
    worker: Option<JoinHandle<()>>,
}

impl AdbClient {
    pub fn new(
        ip: &str,
        config: AdbConfig,
        crypto: Option<Arc<dyn AdbCrypto>>,
        events: EventBus<AdbEvent>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let status = Arc::new(Mutex::new(AdbStatus::Disconnected));
        let port = config.port;

        let worker = Worker {
            ip: ip.to_string(),
            config,
            crypto,
            events,
            status: status.clone(),
            commands: tx.clone(),
            generation: 0,
            link: None,
        };
        let handle = thread::spawn(move || worker.run(rx));

        Self {
            ip: ip.to_string(),
            port,
            commands: tx,
            status,
            worker: Some(handle),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> AdbStatus {
        *self.status.lock()
    }

    pub fn connect(&self) -> Result<()> {
        self.enqueue(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.enqueue(Command::Disconnect)
    }

    /// Queue a shell line (the caller terminates it with `\n`).
    ///
    /// Fails with [`MirrorError::NotConnected`] while disconnected; nothing
    /// is written in that case.
    pub fn write(&self, command: &str) -> Result<()> {
        if command.is_empty() {
            tracing::warn!(ip = %self.ip, "empty shell command ignored");
            return Ok(());
        }
        if self.status() == AdbStatus::Disconnected {
            return Err(MirrorError::NotConnected(self.ip.clone()));
        }
        self.enqueue(Command::Write(command.to_string()))
    }

    /// Queue a push. The outcome arrives as [`AdbEventKind::FilePushed`].
    pub fn push(&self, source: PushSource, remote_path: &str) -> Result<()> {
        self.enqueue(Command::Push {
            source,
            remote_path: remote_path.to_string(),
        })
    }

    /// Disconnect and stop the worker.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown);
        if worker.join().is_err() {
            tracing::error!(ip = %self.ip, "ADB client worker panicked");
        }
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        if self.worker.is_none() {
            return Err(MirrorError::Released);
        }
        self.commands.send(command).map_err(|_| MirrorError::Released)
    }
}

impl Drop for AdbClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Link {
    connection: AdbConnection,
    shell: Arc<AdbStream>,
    sync: Option<AdbStream>,
}

struct Worker {
    ip: String,
    config: AdbConfig,
    crypto: Option<Arc<dyn AdbCrypto>>,
    events: EventBus<AdbEvent>,
    status: Arc<Mutex<AdbStatus>>,
    commands: Sender<Command>,
    generation: u64,
    link: Option<Link>,
}

impl Worker {
    fn run(mut self, rx: Receiver<Command>) {
        for command in rx.iter() {
            match command {
                Command::Connect => self.connect(),
                Command::Disconnect => self.disconnect(),
                Command::Write(line) => self.write(&line),
                Command::Push { source, remote_path } => self.push(&source, &remote_path),
                Command::Established {
                    generation,
                    connection,
                    shell,
                } => self.established(generation, connection, shell),
                Command::ConnectFailed { generation, error } => {
                    if generation == self.generation && self.current() == AdbStatus::Connecting {
                        tracing::warn!(ip = %self.ip, error = %error, "ADB connect failed");
                        self.publish(AdbEventKind::Error {
                            kind: ErrorKind::ConnectFailed,
                            message: error.to_string(),
                        });
                        self.set_status(AdbStatus::Disconnected);
                    }
                }
                Command::Lost { generation } => {
                    if generation == self.generation && self.link.is_some() {
                        self.fail_closed("connection closed");
                    }
                }
                Command::Shutdown => {
                    self.disconnect();
                    break;
                }
            }
        }
        tracing::debug!(ip = %self.ip, "ADB client worker exited");
    }

    fn connect(&mut self) {
        if self.current() != AdbStatus::Disconnected {
            tracing::debug!(ip = %self.ip, status = %self.current(), "connect ignored");
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        self.set_status(AdbStatus::Connecting);

        let ip = self.ip.clone();
        let config = self.config.clone();
        let crypto = self.crypto.clone();
        let tx = self.commands.clone();
        thread::spawn(move || {
            let result = AdbConnection::dial(&ip, &config, crypto).and_then(|connection| {
                let shell = connection.open("shell:")?;
                Ok((connection, shell))
            });
            let report = match result {
                Ok((connection, shell)) => Command::Established {
                    generation,
                    connection,
                    shell: Arc::new(shell),
                },
                Err(error) => Command::ConnectFailed { generation, error },
            };
            let _ = tx.send(report);
        });
    }

    fn established(&mut self, generation: u64, connection: AdbConnection, shell: Arc<AdbStream>) {
        if generation != self.generation || self.current() != AdbStatus::Connecting {
            tracing::debug!(ip = %self.ip, "stale connection dropped");
            return;
        }

        self.link = Some(Link {
            connection,
            shell: shell.clone(),
            sync: None,
        });
        self.set_status(AdbStatus::Connected);

        let ip = self.ip.clone();
        let events = self.events.clone();
        let tx = self.commands.clone();
        thread::spawn(move || {
            read_shell(&shell, &ip, &events);
            let _ = tx.send(Command::Lost { generation });
        });
    }

    fn disconnect(&mut self) {
        self.generation += 1;
        if let Some(mut link) = self.link.take() {
            if let Some(sync) = link.sync.take()
                && let Err(e) = sync.close()
            {
                tracing::debug!(ip = %self.ip, error = %e, "closing sync stream");
            }
            if let Err(e) = link.shell.close() {
                tracing::debug!(ip = %self.ip, error = %e, "closing shell stream");
            }
            link.connection.close();
        }
        self.set_status(AdbStatus::Disconnected);
    }

    fn write(&mut self, line: &str) {
        let Some(link) = &self.link else {
            tracing::warn!(ip = %self.ip, "shell command dropped, not connected");
            return;
        };
        tracing::debug!(ip = %self.ip, command = line.trim_end(), "shell command");
        if let Err(e) = link.shell.write(line.as_bytes()) {
            tracing::warn!(ip = %self.ip, error = %e, "shell write failed");
            self.fail_closed("connection closed");
        }
    }

    fn push(&mut self, source: &PushSource, remote_path: &str) {
        if self.link.is_none() {
            tracing::warn!(ip = %self.ip, remote_path, "push while disconnected");
            self.publish(AdbEventKind::FilePushed(false));
            return;
        }
        let mut reader = match source.open() {
            Ok(reader) => reader,
            Err(e) => {
                tracing::warn!(ip = %self.ip, error = %e, "push source unavailable");
                self.publish(AdbEventKind::FilePushed(false));
                return;
            }
        };

        let result = match self.link.as_mut() {
            Some(link) => push_on(link, &mut reader, remote_path, source.mtime_secs()),
            None => Ok(false),
        };
        match result {
            Ok(ok) => self.publish(AdbEventKind::FilePushed(ok)),
            Err(e) => {
                tracing::warn!(ip = %self.ip, error = %e, remote_path, "push failed");
                self.publish(AdbEventKind::Error {
                    kind: ErrorKind::Closed,
                    message: "push failed".to_string(),
                });
                self.publish(AdbEventKind::FilePushed(false));
                self.disconnect();
            }
        }
    }

    fn fail_closed(&mut self, message: &str) {
        self.publish(AdbEventKind::Error {
            kind: ErrorKind::Closed,
            message: message.to_string(),
        });
        self.disconnect();
    }

    fn current(&self) -> AdbStatus {
        *self.status.lock()
    }

    /// Publish only on a real transition.
    fn set_status(&self, status: AdbStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        tracing::info!(ip = %self.ip, %status, "ADB status");
        self.publish(AdbEventKind::Status(status));
    }

    fn publish(&self, kind: AdbEventKind) {
        self.events.publish(AdbEvent {
            ip: self.ip.clone(),
            kind,
        });
    }
}

/// Reuse the sync stream while the device keeps it open.
fn push_on(link: &mut Link, reader: &mut dyn std::io::Read, remote_path: &str, mtime_secs: u32) -> Result<bool> {
    let stream = match link.sync.take() {
        Some(stream) if !stream.is_closed() => stream,
        _ => link.connection.open("sync:")?,
    };
    let result = sync::push_file(&stream, reader, remote_path, link.connection.max_data(), mtime_secs);
    link.sync = Some(stream);
    result
}

/// Raw shell bytes up to the next prompt, decoded once per response.
#[derive(Default)]
struct ShellOutput {
    buf: Vec<u8>,
}

impl ShellOutput {
    /// Append a payload; returns the whole response once it ends in the prompt.
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.buf.extend_from_slice(bytes);
        if !self.buf.ends_with(PROMPT_SENTINEL.as_bytes()) {
            return None;
        }
        let buf = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Emit one response per prompt until the shell stream closes.
fn read_shell(shell: &AdbStream, ip: &str, events: &EventBus<AdbEvent>) {
    let mut output = ShellOutput::default();
    while let Ok(bytes) = shell.read() {
        if let Some(response) = output.push(&bytes) {
            tracing::debug!(ip, response = %response, "shell response");
            events.publish(AdbEvent {
                ip: ip.to_string(),
                kind: AdbEventKind::Response(response),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn client(port: u16) -> (AdbClient, Receiver<AdbEvent>) {
        let events = EventBus::new();
        let rx = events.subscribe();
        let config = AdbConfig {
            port,
            ..AdbConfig::default()
        };
        (AdbClient::new("127.0.0.1", config, None, events), rx)
    }

    fn next(rx: &Receiver<AdbEvent>) -> AdbEventKind {
        rx.recv_timeout(Duration::from_secs(5)).unwrap().kind
    }

    #[test]
    fn write_while_disconnected_is_rejected() {
        let (client, rx) = client(closed_port());
        let err = client.write("ls\n").unwrap_err();
        assert!(matches!(err, MirrorError::NotConnected(ip) if ip == "127.0.0.1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn push_while_disconnected_reports_false() {
        let (client, rx) = client(closed_port());
        client.push(PushSource::from(b"x".to_vec()), "/data/local/tmp/x").unwrap();
        assert_eq!(next(&rx), AdbEventKind::FilePushed(false));
    }

    #[test]
    fn refused_connect_goes_back_to_disconnected() {
        let (client, rx) = client(closed_port());
        client.connect().unwrap();
        assert_eq!(next(&rx), AdbEventKind::Status(AdbStatus::Connecting));
        assert!(matches!(
            next(&rx),
            AdbEventKind::Error {
                kind: ErrorKind::ConnectFailed,
                ..
            }
        ));
        assert_eq!(next(&rx), AdbEventKind::Status(AdbStatus::Disconnected));
        assert_eq!(client.status(), AdbStatus::Disconnected);
    }

    #[test]
    fn shell_output_splits_on_prompt() {
        let mut output = ShellOutput::default();
        assert_eq!(output.push(b"package:a\r\n"), None);
        assert_eq!(output.push(b"shell@x:/ $ ").as_deref(), Some("package:a\r\nshell@x:/ $ "));
        assert_eq!(output.push(b"/ $ ").as_deref(), Some("/ $ "));
    }

    #[test]
    fn shell_output_keeps_split_utf8_intact() {
        let mut output = ShellOutput::default();
        let text = "caf\u{e9}\r\n/ $ ".as_bytes();
        let split = text.iter().position(|&b| b == 0xc3).unwrap() + 1;
        assert_eq!(output.push(&text[..split]), None);
        assert_eq!(output.push(&text[split..]).as_deref(), Some("caf\u{e9}\r\n/ $ "));
    }

    #[test]
    fn disconnect_when_disconnected_emits_nothing() {
        let (mut client, rx) = client(closed_port());
        client.disconnect().unwrap();
        client.shutdown();
        assert!(rx.try_recv().is_err());
        assert!(matches!(client.connect(), Err(MirrorError::Released)));
    }
}
