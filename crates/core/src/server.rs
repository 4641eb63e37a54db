use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::error::Result;
use crate::event::EventBus;
use crate::protocol::SERVER_AGENT;
use crate::session::RtspEvent;
use crate::transport::tcp;

/// Default WFD control port.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:7236";

/// Listener and per-session configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the RTSP listener binds to.
    pub bind_addr: String,
    /// Value of the `Server` header on every outbound message.
    pub server_name: String,
    /// Timeout advertised in `Session: <id>;timeout=<secs>`.
    pub session_timeout_secs: u64,
    /// How long before the timeout the M16 keep-alive is sent.
    pub keepalive_margin_secs: u64,
    /// Local RTP port advertised in SETUP replies (UDP/TCP transports).
    pub server_rtp_port: u16,
    /// `wfd_video_formats` value sent in M4.
    pub video_formats: String,
    /// Host used in `wfd_presentation_URL`.
    /// When `None`, the local address of the sink's connection is used.
    pub presentation_host: Option<String>,
    /// Read-timeout tick on session sockets; bounds keep-alive latency
    /// and how quickly sessions notice [`RtspListener::stop`].
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            server_name: SERVER_AGENT.to_string(),
            session_timeout_secs: 30,
            keepalive_margin_secs: 5,
            server_rtp_port: 20000,
            video_formats: "28 00 02 02 00000020 00000000 00000000 00 0000 0000 00 none none".to_string(),
            presentation_host: None,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Accepts sink connections and runs one [`WfdSession`](crate::session::WfdSession)
/// per connection on its own thread.
///
/// Events from every session are fanned out through a shared [`EventBus`];
/// see [`subscribe`](Self::subscribe).
pub struct RtspListener {
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
    events: EventBus<RtspEvent>,
    accept_thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl RtspListener {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(ServerConfig {
            bind_addr: bind_addr.to_string(),
            ..ServerConfig::default()
        })
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(false)),
            events: EventBus::new(),
            accept_thread: None,
            local_addr: None,
        }
    }

    /// Bind and start accepting. A running listener is stopped and rebound.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            tracing::debug!("listener already running, restarting");
            self.stop();
        }

        let listener = TcpListener::bind(&self.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running = Arc::new(AtomicBool::new(true));
        self.local_addr = Some(local_addr);

        let running = self.running.clone();
        let events = self.events.clone();
        let config = self.config.clone();

        tracing::info!(addr = %local_addr, "RTSP listener started");

        self.accept_thread = Some(thread::spawn(move || {
            tcp::accept_loop(listener, config, events, running);
        }));

        Ok(())
    }

    /// Stop accepting and signal every session to end. No-op when stopped.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take()
            && handle.join().is_err()
        {
            tracing::error!("accept thread panicked");
        }
        self.local_addr = None;
        tracing::info!("RTSP listener stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address actually bound, useful with port `0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn subscribe(&self) -> Receiver<RtspEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for RtspListener {
    fn drop(&mut self) {
        self.stop();
    }
}
