//! RTSP message codec for the Wi-Fi Display control channel.
//!
//! WFD reuses RTSP/1.0 framing, but both ends send requests: the source
//! (us) drives capability negotiation with `OPTIONS`, `GET_PARAMETER` and
//! `SET_PARAMETER`, while the sink sends `OPTIONS`, `SETUP` and `PLAY`.
//!
//! ```text
//! Source                                   Sink
//!   | -- M1 OPTIONS * ---------------------> |
//!   | <--------------------- M2 OPTIONS * -- |
//!   | -- M3 GET_PARAMETER -----------------> |
//!   | -- M4 SET_PARAMETER -----------------> |
//!   | -- M5 SET_PARAMETER (trigger SETUP) -> |
//!   | <------------------------- M6 SETUP -- |
//!   | <-------------------------- M7 PLAY -- |
//! ```
//!
//! Parameter bodies (`text/parameters`) are tokenized in [`params`].

pub mod params;
pub mod request;
pub mod response;

use std::collections::HashMap;

pub use request::{RequestBuilder, RtspRequest};
pub use response::{ResponseBuilder, RtspResponse, SERVER_AGENT};

/// `;`-delimited header parameters: `name -> value`, bare flags map to `""`.
pub type Attributes = HashMap<String, String>;

/// Split a raw message at the first blank line into head and body.
pub(crate) fn split_head_body(raw: &str) -> (&str, &str) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        return (&raw[..pos], &raw[pos + 4..]);
    }
    if let Some(pos) = raw.find("\n\n") {
        return (&raw[..pos], &raw[pos + 2..]);
    }
    (raw, "")
}

/// Split a header line on its first `:` into a lowercased name and trimmed value.
///
/// Lines shorter than four characters are terminators (bare CRLF and the
/// like) and yield `None`, as do lines without a colon.
pub(crate) fn split_header(line: &str) -> Option<(String, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() < 4 {
        return None;
    }
    let Some((name, value)) = line.split_once(':') else {
        tracing::warn!(line, "header line without colon skipped");
        return None;
    };
    Some((name.trim().to_ascii_lowercase(), value.trim()))
}

pub(crate) fn parse_attributes(value: &str) -> Attributes {
    value
        .split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.split_once('=') {
            Some((key, val)) => (key.trim().to_string(), val.trim().to_string()),
            None => (segment.to_string(), String::new()),
        })
        .collect()
}

pub(crate) fn parse_cseq(value: &str) -> i32 {
    value.trim().parse().unwrap_or(-1)
}

/// Header block shared by outbound requests and responses.
pub(crate) struct MessageHead {
    pub cseq: i32,
    pub server: String,
    pub session: Option<(u32, u64)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<(String, String)>,
}

impl MessageHead {
    pub fn new(cseq: i32) -> Self {
        Self {
            cseq,
            server: SERVER_AGENT.to_string(),
            session: None,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn write_to(&self, out: &mut String) {
        let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
        out.push_str(&format!("Date: {date}\r\n"));
        out.push_str(&format!("Server: {}\r\n", self.server));
        if self.cseq >= 0 {
            out.push_str(&format!("CSeq: {}\r\n", self.cseq));
        }
        if let Some((id, timeout)) = self.session {
            out.push_str(&format!("Session: {id};timeout={timeout}\r\n"));
        }
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        match &self.body {
            Some((content_type, body)) => {
                out.push_str(&format!("Content-Type: {content_type}\r\n"));
                out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                out.push_str(body);
            }
            None => out.push_str("\r\n"),
        }
    }
}
