use std::collections::HashMap;

use crate::error::{ParseErrorKind, Result};
use crate::protocol::params::parse_parameters;
use crate::protocol::{MessageHead, parse_cseq, split_head_body, split_header};

/// A parsed RTSP response, i.e. the peer's answer to one of our requests.
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 3\r\n
/// Content-Type: text/parameters\r\n
/// Content-Length: 58\r\n
/// \r\n
/// wfd_client_rtp_ports: RTP/AVP/UDP;unicast 19000 0 mode=play\r\n
/// ```
///
/// Unlike requests, header values are kept raw.
#[derive(Debug, Clone, Default)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    /// Sequence number, `-1` when absent or not an integer.
    pub cseq: i32,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RtspResponse {
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = split_head_body(raw);
        let lines: Vec<&str> = head.lines().collect();
        let mut response = Self::parse_lines(&lines)?;
        response.body = body.to_string();
        Ok(response)
    }

    /// Parse an already-delimited response head (`RTSP/<ver> <status> <reason>`).
    pub fn parse_lines(lines: &[&str]) -> Result<Self> {
        let first = lines.first().ok_or(ParseErrorKind::EmptyMessage)?;

        let mut parts = first.trim().splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("RTSP/") {
            return Err(ParseErrorKind::InvalidStartLine.into());
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or(ParseErrorKind::InvalidStatus)?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        let mut response = RtspResponse {
            status,
            reason,
            cseq: -1,
            headers: HashMap::new(),
            body: String::new(),
        };

        for line in &lines[1..] {
            let Some((name, value)) = split_header(line) else {
                continue;
            };
            if name == "cseq" {
                response.cseq = parse_cseq(value);
            } else {
                response.headers.insert(name, value.to_string());
            }
        }

        tracing::trace!(status, cseq = response.cseq, "parsed response");
        Ok(response)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// `text/parameters` body as a `name -> value` map.
    pub fn parameters(&self) -> HashMap<String, String> {
        parse_parameters(&self.body)
    }
}

/// Server identification string used when no name is configured.
pub const SERVER_AGENT: &str = "miracast-rs/0.1";

/// Builder for responses to the peer's requests.
///
/// Chain [`header`](Self::header) and [`body`](Self::body), then call
/// [`serialize`](Self::serialize). `Content-Length` is computed when a body
/// is present.
#[must_use]
pub struct ResponseBuilder {
    pub status: u16,
    pub reason: String,
    head: MessageHead,
}

impl ResponseBuilder {
    pub fn new(status: u16, reason: &str, cseq: i32) -> Self {
        ResponseBuilder {
            status,
            reason: reason.to_string(),
            head: MessageHead::new(cseq),
        }
    }

    /// 200 OK.
    pub fn ok(cseq: i32) -> Self {
        Self::new(200, "OK", cseq)
    }

    /// 400 Bad Request: malformed or missing required header.
    pub fn bad_request(cseq: i32) -> Self {
        Self::new(400, "Bad Request", cseq)
    }

    /// 404 Not found: the stream URI is not ours.
    pub fn not_found(cseq: i32) -> Self {
        Self::new(404, "Not found", cseq)
    }

    /// 405 Method Not Allowed.
    pub fn method_not_allowed(cseq: i32) -> Self {
        Self::new(405, "Method Not Allowed", cseq)
    }

    /// 454 Session Not Found.
    pub fn session_not_found(cseq: i32) -> Self {
        Self::new(454, "Session Not Found", cseq)
    }

    /// 461 Unsupported Transport.
    pub fn unsupported_transport(cseq: i32) -> Self {
        Self::new(461, "Unsupported Transport", cseq)
    }

    pub fn server(mut self, server: &str) -> Self {
        self.head.server = server.to_string();
        self
    }

    pub fn session(mut self, id: u32, timeout_secs: u64) -> Self {
        self.head.session = Some((id, timeout_secs));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.head.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, content_type: &str, body: String) -> Self {
        self.head.body = Some((content_type.to_string(), body));
        self
    }

    pub fn serialize(&self) -> String {
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status, self.reason);
        self.head.write_to(&mut out);
        out
    }
}
