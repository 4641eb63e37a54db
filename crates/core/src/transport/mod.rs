//! Network transport for the WFD control channel.
//!
//! - **TCP** ([`tcp`]): one RTSP connection per sink, with a thread per
//!   connection. The socket's read timeout doubles as the session's timer
//!   tick, so the keep-alive is written from the same thread as replies.
//!
//! RTP media delivery is out of scope; only the negotiated ports are kept.

pub mod tcp;
