use std::collections::HashMap;

use crate::error::{ParseErrorKind, Result};
use crate::protocol::{Attributes, MessageHead, parse_attributes, parse_cseq, split_head_body, split_header};

/// A parsed RTSP request.
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header names are lowercased. Each header value is split on `;` into an
/// attribute mapping, so `Transport: RTP/AVP/UDP;unicast;client_port=19000-19001`
/// becomes `{RTP/AVP/UDP: "", unicast: "", client_port: "19000-19001"}`.
/// `CSeq` is lifted into [`cseq`](Self::cseq) and is not stored as a header.
#[derive(Debug, Clone, Default)]
pub struct RtspRequest {
    /// RTSP method token (OPTIONS, SETUP, PLAY, ...).
    pub method: String,
    /// Request-URI, `*` for server-wide requests.
    pub uri: String,
    /// Protocol version, e.g. `RTSP/1.0`.
    pub version: String,
    /// Sequence number, `-1` when absent or not an integer.
    pub cseq: i32,
    pub headers: HashMap<String, Attributes>,
    pub body: String,
}

impl RtspRequest {
    /// Parse a complete request (head, blank line, optional body).
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = split_head_body(raw);
        let lines: Vec<&str> = head.lines().collect();
        let mut request = Self::parse_lines(&lines)?;
        request.body = body.to_string();
        Ok(request)
    }

    /// Parse an already-delimited request head.
    ///
    /// Returns [`ParseErrorKind::InvalidStartLine`] when the first line does
    /// not match `METHOD URI RTSP/<ver>`.
    pub fn parse_lines(lines: &[&str]) -> Result<Self> {
        let first = lines.first().ok_or(ParseErrorKind::EmptyMessage)?;

        let parts: Vec<&str> = first.split_whitespace().collect();
        if parts.len() != 3 || !is_token(parts[0]) || !parts[2].starts_with("RTSP/") {
            return Err(ParseErrorKind::InvalidStartLine.into());
        }

        let mut request = RtspRequest {
            method: parts[0].to_string(),
            uri: parts[1].to_string(),
            version: parts[2].to_string(),
            cseq: -1,
            headers: HashMap::new(),
            body: String::new(),
        };

        for line in &lines[1..] {
            let Some((name, value)) = split_header(line) else {
                continue;
            };
            if name == "cseq" {
                request.cseq = parse_cseq(value);
            } else {
                request.headers.insert(name, parse_attributes(value));
            }
        }

        tracing::trace!(method = %request.method, uri = %request.uri, cseq = request.cseq, "parsed request");
        Ok(request)
    }

    /// Attribute mapping for a header (name lookup is case-insensitive).
    pub fn header(&self, name: &str) -> Option<&Attributes> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Session identifier from the `Session` header, ignoring `;timeout=`.
    pub fn session_id(&self) -> Option<&str> {
        self.header("Session")?
            .iter()
            .find(|(_, value)| value.is_empty())
            .map(|(key, _)| key.as_str())
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Builder for requests originated by this side of the connection.
///
/// Serializes the common header block (`Date`, `Server`, `CSeq`, optional
/// `Session`) in that order, then any extra headers, then the body with
/// `Content-Type`/`Content-Length`.
#[must_use]
pub struct RequestBuilder {
    method: String,
    uri: String,
    head: MessageHead,
}

impl RequestBuilder {
    pub fn new(method: &str, uri: &str, cseq: i32) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            head: MessageHead::new(cseq),
        }
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
        let mut out = format!("{} {} RTSP/1.0\r\n", self.method, self.uri);
        self.head.write_to(&mut out);
        out
    }
}
