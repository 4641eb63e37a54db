//! WFD source-side RTSP session (one per accepted sink connection).
//!
//! The session negotiates capabilities with the sink, then serves the
//! sink's SETUP/PLAY requests:
//!
//! ```text
//! start()              -> AwaitingOptions   (M1 sent)
//! OPTIONS from sink    -> M3Sent            (200 + M3 GET_PARAMETER)
//! M3 response          -> M4Sent            (M4 SET_PARAMETER)
//! M4 response          -> M5Sent            (M5 trigger SETUP)
//! M5 response          -> Negotiated { playing: false }
//! PLAY                 -> Negotiated { playing: true }
//! TEARDOWN / I/O error -> Closed
//! ```
//!
//! Requests we originate are tracked by CSeq as a [`Pending`] tag. A
//! non-200 answer to M1 closes the session.
//!
//! The session owns its writer; every outbound byte is written from the
//! thread that drives it.

pub mod transport;

use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ErrorKind, MirrorError, Result};
use crate::event::EventBus;
use crate::protocol::params::{
    self, AudioCodec, ClientRtpPorts, WFD_AUDIO_CODECS, WFD_CLIENT_RTP_PORTS, WFD_CONTENT_PROTECTION,
    WFD_PRESENTATION_URL, WFD_TRIGGER_METHOD, WFD_VIDEO_FORMATS,
};
use crate::protocol::{RequestBuilder, ResponseBuilder, RtspRequest, RtspResponse};
use crate::server::ServerConfig;
pub use transport::{ClientTransport, RtpSession, TransportMode};

/// Methods advertised in the OPTIONS reply.
pub const PUBLIC_METHODS: &str =
    "org.wfa.wfd1.0, SETUP, TEARDOWN, PLAY, PAUSE, GET_PARAMETER, SET_PARAMETER";

const WFD_CONTROL_URI: &str = "rtsp://localhost/wfd1.0";
const STREAM_SUFFIX: &str = "/wfd1.0/streamid=0";
const TEXT_PARAMETERS: &str = "text/parameters";

/// Negotiation progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingOptions,
    M3Sent,
    M4Sent,
    M5Sent,
    Negotiated { playing: bool },
    Closed,
}

/// Request we sent and are awaiting a response for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    M1,
    M3,
    M4,
    M5,
    KeepAlive,
}

/// Notifications a session raises towards its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMessage {
    StreamingStarted,
    StreamingStopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspEventKind {
    Error { kind: ErrorKind, detail: String },
    Message(StreamMessage),
}

/// Event published by a session, tagged with the sink's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspEvent {
    pub peer: SocketAddr,
    pub kind: RtspEventKind,
}

/// State machine for one sink connection.
pub struct WfdSession<W: Write> {
    out: W,
    peer: SocketAddr,
    local_ip: IpAddr,
    config: Arc<ServerConfig>,
    events: EventBus<RtspEvent>,
    state: SessionState,
    next_cseq: i32,
    pending: HashMap<i32, Pending>,
    chosen_rtp_port: Option<u16>,
    audio: Option<AudioCodec>,
    playback_session_id: Option<u32>,
    rtp_session: Option<RtpSession>,
    keepalive_at: Option<Instant>,
}

impl<W: Write> WfdSession<W> {
    pub fn new(
        out: W,
        peer: SocketAddr,
        local_ip: IpAddr,
        config: Arc<ServerConfig>,
        events: EventBus<RtspEvent>,
    ) -> Self {
        Self {
            out,
            peer,
            local_ip,
            config,
            events,
            state: SessionState::AwaitingOptions,
            next_cseq: 1,
            pending: HashMap::new(),
            chosen_rtp_port: None,
            audio: None,
            playback_session_id: None,
            rtp_session: None,
            keepalive_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn playback_session_id(&self) -> Option<u32> {
        self.playback_session_id
    }

    pub fn chosen_rtp_port(&self) -> Option<u16> {
        self.chosen_rtp_port
    }

    pub fn audio_codec(&self) -> Option<AudioCodec> {
        self.audio
    }

    pub fn rtp_session(&self) -> Option<&RtpSession> {
        self.rtp_session.as_ref()
    }

    pub fn pending(&self, cseq: i32) -> Option<Pending> {
        self.pending.get(&cseq).copied()
    }

    pub fn keepalive_deadline(&self) -> Option<Instant> {
        self.keepalive_at
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.out
    }

    /// Open negotiation by sending M1 (`OPTIONS * RTSP/1.0`).
    pub fn start(&mut self) -> Result<()> {
        tracing::info!(peer = %self.peer, "starting WFD negotiation");
        let cseq = self.take_cseq();
        let text = self
            .request("OPTIONS", "*", cseq)
            .header("Require", "org.wfa.wfd1.0")
            .serialize();
        self.send_tracked(text, cseq, Pending::M1)
    }

    /// Dispatch one framed message (request or response).
    ///
    /// Every error is published as an [`RtspEventKind::Error`] before being
    /// returned. Parse and I/O errors mean the connection should be dropped.
    pub fn handle_message(&mut self, raw: &str) -> Result<()> {
        let result = if raw.starts_with("RTSP") {
            match RtspResponse::parse(raw) {
                Ok(response) => self.handle_response(&response),
                Err(e) => Err(e),
            }
        } else {
            match RtspRequest::parse(raw) {
                Ok(request) => self.handle_request(&request),
                Err(e) => {
                    let text = self.response(ResponseBuilder::bad_request(-1)).serialize();
                    if let Err(write_err) = self.send(text) {
                        tracing::debug!(peer = %self.peer, error = %write_err, "400 reply not sent");
                    }
                    Err(e)
                }
            }
        };

        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    pub fn handle_request(&mut self, request: &RtspRequest) -> Result<()> {
        if self.is_closed() {
            tracing::warn!(peer = %self.peer, method = %request.method, "request after close rejected");
            return Err(MirrorError::failed("session closed"));
        }

        tracing::debug!(peer = %self.peer, method = %request.method, uri = %request.uri, cseq = request.cseq, "request");

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(request),
            "SETUP" => self.handle_setup(request),
            "PLAY" => self.handle_play(request),
            "TEARDOWN" => self.handle_teardown(request),
            "GET_PARAMETER" => self.handle_get_parameter(request),
            _ => {
                tracing::warn!(method = %request.method, cseq = request.cseq, "unsupported RTSP method");
                self.reply(ResponseBuilder::method_not_allowed(request.cseq))?;
                Err(MirrorError::protocol(
                    ErrorKind::Unsupported,
                    format!("method {}", request.method),
                ))
            }
        }
    }

    pub fn handle_response(&mut self, response: &RtspResponse) -> Result<()> {
        if self.is_closed() {
            return Err(MirrorError::failed("session closed"));
        }

        let Some(pending) = self.pending.remove(&response.cseq) else {
            tracing::warn!(peer = %self.peer, cseq = response.cseq, "response for unknown CSeq dropped");
            return Err(MirrorError::failed(format!("unmatched CSeq {}", response.cseq)));
        };

        tracing::debug!(peer = %self.peer, cseq = response.cseq, status = response.status, ?pending, "response");

        if !response.is_ok() {
            if pending == Pending::M1 {
                tracing::warn!(peer = %self.peer, status = response.status, "sink rejected M1, negotiation aborted");
                self.close();
            }
            return Err(MirrorError::failed(format!(
                "{pending:?} answered {} {}",
                response.status, response.reason
            )));
        }

        match pending {
            Pending::M1 | Pending::KeepAlive => Ok(()),
            Pending::M3 => self.handle_m3_response(response),
            Pending::M4 => self.send_m5(),
            Pending::M5 => {
                self.state = SessionState::Negotiated { playing: false };
                tracing::info!(peer = %self.peer, "capability negotiation complete");
                Ok(())
            }
        }
    }

    /// Send the M16 keep-alive if its deadline has passed.
    pub fn poll_keepalive(&mut self, now: Instant) -> Result<()> {
        let Some(deadline) = self.keepalive_at else {
            return Ok(());
        };
        if now < deadline || self.is_closed() {
            return Ok(());
        }
        let Some(id) = self.playback_session_id else {
            return Ok(());
        };

        tracing::trace!(peer = %self.peer, session = id, "sending keep-alive");
        let cseq = self.take_cseq();
        let text = self
            .request("GET_PARAMETER", WFD_CONTROL_URI, cseq)
            .session(id, self.config.session_timeout_secs)
            .serialize();
        self.arm_keepalive(now);
        let before = self.pending.len();
        self.pending.retain(|_, pending| *pending != Pending::KeepAlive);
        if self.pending.len() < before {
            tracing::debug!(peer = %self.peer, "previous keep-alive unanswered");
        }
        self.send_tracked(text, cseq, Pending::KeepAlive)
    }

    /// Move to `Closed`, releasing the RTP session and disarming the timer.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        tracing::debug!(peer = %self.peer, "session closed");
        self.state = SessionState::Closed;
        self.rtp_session = None;
        self.keepalive_at = None;
        self.pending.clear();
    }

    fn handle_options(&mut self, request: &RtspRequest) -> Result<()> {
        self.reply(ResponseBuilder::ok(request.cseq).header("Public", PUBLIC_METHODS))?;
        self.send_m3()
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> Result<()> {
        let cseq = request.cseq;

        if self.playback_session_id.is_some() {
            self.reply(ResponseBuilder::bad_request(cseq))?;
            return Err(MirrorError::malformed("SETUP on a session that is already set up"));
        }

        let Some(header) = request.header("Transport") else {
            self.reply(ResponseBuilder::bad_request(cseq))?;
            return Err(MirrorError::malformed("SETUP without Transport header"));
        };

        let transport = match ClientTransport::resolve(header) {
            Ok(t) => t,
            Err(e) => {
                let reply = match e.kind() {
                    ErrorKind::Unsupported => ResponseBuilder::unsupported_transport(cseq),
                    _ => ResponseBuilder::bad_request(cseq),
                };
                self.reply(reply)?;
                return Err(e);
            }
        };

        if !request.uri.starts_with("rtsp://") {
            self.reply(ResponseBuilder::bad_request(cseq))?;
            return Err(MirrorError::malformed(format!("SETUP uri {}", request.uri)));
        }
        if !request.uri.ends_with(STREAM_SUFFIX) {
            self.reply(ResponseBuilder::not_found(cseq))?;
            return Err(MirrorError::malformed(format!("SETUP uri {}", request.uri)));
        }

        let id = rand::random::<u32>();
        let rtp = RtpSession::new(self.peer.ip(), transport, self.config.server_rtp_port);

        tracing::info!(
            peer = %self.peer,
            session = id,
            mode = ?rtp.mode,
            client_rtp = rtp.client_rtp_port,
            server_rtp = rtp.server_rtp_port,
            "playback session created via SETUP"
        );

        let reply = ResponseBuilder::ok(cseq)
            .session(id, self.config.session_timeout_secs)
            .header("Transport", &rtp.transport_header());
        self.playback_session_id = Some(id);
        self.rtp_session = Some(rtp);
        self.arm_keepalive(Instant::now());
        self.reply(reply)
    }

    fn handle_play(&mut self, request: &RtspRequest) -> Result<()> {
        let cseq = request.cseq;
        if request.session_id().is_none() && self.playback_session_id.is_none() {
            self.reply(ResponseBuilder::session_not_found(cseq))?;
            return Err(MirrorError::malformed("PLAY without a session"));
        }

        let mut reply = ResponseBuilder::ok(cseq).header("Range", "npt=now-");
        if let Some(id) = self.playback_session_id {
            reply = reply.session(id, self.config.session_timeout_secs);
        }
        self.reply(reply)?;

        self.state = SessionState::Negotiated { playing: true };
        tracing::info!(peer = %self.peer, "streaming started");
        self.publish(RtspEventKind::Message(StreamMessage::StreamingStarted));
        Ok(())
    }

    fn handle_teardown(&mut self, request: &RtspRequest) -> Result<()> {
        if request.session_id().is_none() && self.playback_session_id.is_none() {
            self.reply(ResponseBuilder::session_not_found(request.cseq))?;
            return Err(MirrorError::malformed("TEARDOWN without a session"));
        }
        self.reply(ResponseBuilder::ok(request.cseq))?;

        tracing::info!(peer = %self.peer, "session terminated via TEARDOWN");
        self.close();
        self.publish(RtspEventKind::Message(StreamMessage::StreamingStopped));
        Ok(())
    }

    /// Sink keep-alive; also pushes our own keep-alive further out.
    fn handle_get_parameter(&mut self, request: &RtspRequest) -> Result<()> {
        let mut reply = ResponseBuilder::ok(request.cseq);
        if let Some(id) = self.playback_session_id {
            reply = reply.session(id, self.config.session_timeout_secs);
        }
        if self.keepalive_at.is_some() {
            self.arm_keepalive(Instant::now());
        }
        self.reply(reply)
    }

    fn handle_m3_response(&mut self, response: &RtspResponse) -> Result<()> {
        let params = response.parameters();

        let ports = params
            .get(WFD_CLIENT_RTP_PORTS)
            .ok_or_else(|| MirrorError::malformed("M3 response without wfd_client_rtp_ports"))?;
        let ports = ClientRtpPorts::parse(ports)?;
        self.chosen_rtp_port = Some(ports.rtp_port0);
        self.audio = params::select_audio_codec(params.get(WFD_AUDIO_CODECS).map(String::as_str));

        tracing::debug!(rtp_port = ports.rtp_port0, audio = ?self.audio, "sink capabilities");
        self.send_m4()
    }

    fn send_m3(&mut self) -> Result<()> {
        let body = [
            WFD_CONTENT_PROTECTION,
            WFD_VIDEO_FORMATS,
            WFD_AUDIO_CODECS,
            WFD_CLIENT_RTP_PORTS,
        ]
        .iter()
        .map(|name| format!("{name}\r\n"))
        .collect::<String>();

        let cseq = self.take_cseq();
        let text = self
            .request("GET_PARAMETER", WFD_CONTROL_URI, cseq)
            .body(TEXT_PARAMETERS, body)
            .serialize();
        self.send_tracked(text, cseq, Pending::M3)?;
        self.state = SessionState::M3Sent;
        Ok(())
    }

    fn send_m4(&mut self) -> Result<()> {
        let host = self
            .config
            .presentation_host
            .clone()
            .unwrap_or_else(|| self.local_ip.to_string());
        let rtp_port = self.chosen_rtp_port.unwrap_or(transport::DEFAULT_CLIENT_RTP_PORT);

        let mut body = format!("{WFD_VIDEO_FORMATS}: {}\r\n", self.config.video_formats);
        if let Some(codec) = self.audio {
            body.push_str(&format!("{WFD_AUDIO_CODECS}: {}\r\n", codec.wfd_value()));
        }
        body.push_str(&format!("{WFD_PRESENTATION_URL}: rtsp://{host}{STREAM_SUFFIX} none\r\n"));
        body.push_str(&format!(
            "{WFD_CLIENT_RTP_PORTS}: RTP/AVP/UDP;unicast {rtp_port} 0 mode=play\r\n"
        ));

        let cseq = self.take_cseq();
        let text = self
            .request("SET_PARAMETER", WFD_CONTROL_URI, cseq)
            .body(TEXT_PARAMETERS, body)
            .serialize();
        self.send_tracked(text, cseq, Pending::M4)?;
        self.state = SessionState::M4Sent;
        Ok(())
    }

    fn send_m5(&mut self) -> Result<()> {
        let cseq = self.take_cseq();
        let text = self
            .request("SET_PARAMETER", WFD_CONTROL_URI, cseq)
            .body(TEXT_PARAMETERS, format!("{WFD_TRIGGER_METHOD}: SETUP\r\n"))
            .serialize();
        self.send_tracked(text, cseq, Pending::M5)?;
        self.state = SessionState::M5Sent;
        Ok(())
    }

    fn arm_keepalive(&mut self, now: Instant) {
        let secs = self
            .config
            .session_timeout_secs
            .saturating_sub(self.config.keepalive_margin_secs)
            .max(1);
        self.keepalive_at = Some(now + Duration::from_secs(secs));
    }

    fn take_cseq(&mut self) -> i32 {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        cseq
    }

    fn request(&self, method: &str, uri: &str, cseq: i32) -> RequestBuilder {
        RequestBuilder::new(method, uri, cseq).server(&self.config.server_name)
    }

    fn response(&self, builder: ResponseBuilder) -> ResponseBuilder {
        builder.server(&self.config.server_name)
    }

    fn reply(&mut self, builder: ResponseBuilder) -> Result<()> {
        tracing::debug!(peer = %self.peer, status = builder.status, "response");
        let text = self.response(builder).serialize();
        self.send(text)
    }

    /// Write a request and register its continuation once it is on the wire.
    fn send_tracked(&mut self, text: String, cseq: i32, pending: Pending) -> Result<()> {
        self.send(text)?;
        self.pending.insert(cseq, pending);
        Ok(())
    }

    fn send(&mut self, text: String) -> Result<()> {
        tracing::trace!(peer = %self.peer, message = %text, "writing");
        self.out.write_all(text.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    fn report(&self, err: &MirrorError) {
        tracing::warn!(peer = %self.peer, error = %err, "session error");
        self.publish(RtspEventKind::Error {
            kind: err.kind(),
            detail: err.to_string(),
        });
    }

    fn publish(&self, kind: RtspEventKind) {
        self.events.publish(RtspEvent { peer: self.peer, kind });
    }
}
