use std::io::{BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::MirrorError;
use crate::event::EventBus;
use crate::protocol::split_header;
use crate::server::ServerConfig;
use crate::session::{RtspEvent, WfdSession};

/// Largest `Content-Length` accepted from a sink. WFD parameter bodies are
/// a few hundred bytes.
pub const MAX_BODY_LEN: usize = 64 * 1024;

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::RtspListener::stop`] can terminate it promptly.
pub fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    events: EventBus<RtspEvent>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let c = config.clone();
                let e = events.clone();
                let r = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, c, e, r);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single sink connection and the session it drives.
struct Connection {
    reader: BufReader<TcpStream>,
    session: WfdSession<TcpStream>,
    peer_addr: SocketAddr,
    /// Current line, kept across read-timeout ticks.
    line: Vec<u8>,
    /// Header block of the message being framed.
    head: Vec<u8>,
}

impl Connection {
    /// Entry point: set up a connection and run its message loop.
    pub fn handle(
        stream: TcpStream,
        config: Arc<ServerConfig>,
        events: EventBus<RtspEvent>,
        running: Arc<AtomicBool>,
    ) {
        let (peer_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            _ => return,
        };

        tracing::info!(%peer_addr, "sink connected");

        if let Err(e) = stream.set_read_timeout(Some(config.poll_interval)) {
            tracing::warn!(%peer_addr, error = %e, "failed to set read timeout");
            return;
        }
        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            session: WfdSession::new(stream, peer_addr, local_addr.ip(), config, events),
            peer_addr,
            line: Vec::new(),
            head: Vec::new(),
        };

        let reason = match conn.session.start() {
            Ok(()) => conn.run(&running),
            Err(_) => "write error",
        };
        conn.session.close();

        tracing::info!(%peer_addr, reason, "sink disconnected");
    }

    /// Message loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            if self.session.poll_keepalive(Instant::now()).is_err() {
                return "write error";
            }

            let text = match self.read_message() {
                Ok(Some(text)) => text,
                Ok(None) => continue,
                Err(reason) => return reason,
            };

            match self.session.handle_message(&text) {
                Ok(()) => {}
                Err(MirrorError::Io(_)) => return "write error",
                Err(MirrorError::Parse { .. }) => return "parse error",
                Err(_) => {}
            }
            if self.session.is_closed() {
                return "session closed";
            }
        }

        "listener stopped"
    }

    /// Frame one message: header lines up to a blank line, then
    /// `Content-Length` body bytes. `Ok(None)` on a read-timeout tick.
    fn read_message(&mut self) -> Result<Option<String>, &'static str> {
        loop {
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => return Err("connection closed by peer"),
                Ok(_) => {
                    let line = std::mem::take(&mut self.line);
                    let blank = line == b"\r\n" || line == b"\n";
                    if blank && self.head.is_empty() {
                        continue;
                    }
                    self.head.extend_from_slice(&line);
                    if blank {
                        break;
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Err("read error"),
            }
        }

        let mut text = String::from_utf8_lossy(&std::mem::take(&mut self.head)).into_owned();
        let length = content_length(&text);
        let length = match usize::try_from(length) {
            Ok(length) if length <= MAX_BODY_LEN => length,
            _ => {
                tracing::warn!(peer = %self.peer_addr, length, max = MAX_BODY_LEN, "message body too large");
                return Err("body too large");
            }
        };
        if length > 0 {
            let body = self.read_body(length)?;
            text.push_str(&String::from_utf8_lossy(&body));
        }
        Ok(Some(text))
    }

    /// Read an exact body, with the tick timeout lifted so a slow body
    /// is not split across ticks.
    fn read_body(&mut self, length: usize) -> Result<Vec<u8>, &'static str> {
        let stream = self.reader.get_ref();
        let timeout = stream.read_timeout().map_err(|_| "read error")?;
        stream.set_read_timeout(None).map_err(|_| "read error")?;

        let mut body = vec![0; length];
        let result = self.reader.read_exact(&mut body);

        if self.reader.get_ref().set_read_timeout(timeout).is_err() {
            return Err("read error");
        }
        match result {
            Ok(()) => Ok(body),
            Err(e) => {
                tracing::debug!(peer = %self.peer_addr, error = %e, length, "short body");
                Err("read error")
            }
        }
    }
}

fn content_length(head: &str) -> u64 {
    head.lines()
        .skip(1)
        .filter_map(split_header)
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0)
}
