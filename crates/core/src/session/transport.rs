use std::net::IpAddr;

use crate::error::{ErrorKind, MirrorError, Result};
use crate::protocol::Attributes;

/// RTP port used when a sink asks for `RTP/AVP/UDP;unicast` without ports.
pub const DEFAULT_CLIENT_RTP_PORT: u16 = 19000;

/// How RTP is carried to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Udp,
    Tcp,
    /// RTP multiplexed on the RTSP connection (`interleaved=<a>-<b>`).
    TcpInterleaved,
}

/// Transport parameters resolved from a SETUP `Transport` header.
///
/// ## Accepted forms
///
/// ```text
/// RTP/AVP/TCP;interleaved=0-1            -> TcpInterleaved, channels 0/1
/// RTP/AVP/TCP;unicast;client_port=5000   -> Tcp, RTP only
/// RTP/AVP;unicast;client_port=5000-5001  -> Udp
/// RTP/AVP/UDP;unicast;client_port=5000   -> Udp, RTP only
/// RTP/AVP/UDP;unicast                    -> Udp, port 19000, no RTCP
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTransport {
    pub mode: TransportMode,
    pub rtp_port: u16,
    pub rtcp_port: Option<u16>,
}

impl ClientTransport {
    /// Resolve the transport from the header's attribute mapping.
    ///
    /// Errors carry [`ErrorKind::Malformed`] for a recognised profile with
    /// bad ports (answered with 400) and [`ErrorKind::Unsupported`] for
    /// anything else (answered with 461).
    pub fn resolve(transport: &Attributes) -> Result<Self> {
        let has = |key: &str| transport.contains_key(key);
        let client_port = transport.get("client_port").map(String::as_str);

        if has("RTP/AVP/TCP") {
            if let Some(channels) = transport.get("interleaved")
                && let Ok((rtp_port, Some(rtcp_port))) = parse_port_pair(channels, true)
            {
                return Ok(Self {
                    mode: TransportMode::TcpInterleaved,
                    rtp_port,
                    rtcp_port: Some(rtcp_port),
                });
            }
            let ports = client_port.ok_or_else(|| MirrorError::malformed("RTP/AVP/TCP without client_port"))?;
            let (rtp_port, rtcp_port) = parse_port_pair(ports, false)?;
            return Ok(Self {
                mode: TransportMode::Tcp,
                rtp_port,
                rtcp_port,
            });
        }

        if (has("RTP/AVP") || has("RTP/AVP/UDP"))
            && let Some(ports) = client_port
        {
            let (rtp_port, rtcp_port) = parse_port_pair(ports, false)?;
            return Ok(Self {
                mode: TransportMode::Udp,
                rtp_port,
                rtcp_port,
            });
        }

        if has("RTP/AVP/UDP") && has("unicast") {
            return Ok(Self {
                mode: TransportMode::Udp,
                rtp_port: DEFAULT_CLIENT_RTP_PORT,
                rtcp_port: None,
            });
        }

        Err(MirrorError::protocol(ErrorKind::Unsupported, "unsupported transport"))
    }
}

/// Parse `rtp-rtcp` or a lone `rtp` port.
///
/// With `require_both` a lone value is malformed.
fn parse_port_pair(value: &str, require_both: bool) -> Result<(u16, Option<u16>)> {
    let malformed = || MirrorError::malformed(format!("bad port spec: {value}"));

    if let Some((rtp, rtcp)) = value.split_once('-') {
        let rtp = rtp.trim().parse().map_err(|_| malformed())?;
        let rtcp = rtcp.trim().parse().map_err(|_| malformed())?;
        return Ok((rtp, Some(rtcp)));
    }
    if require_both {
        return Err(malformed());
    }
    let rtp = value.trim().parse().map_err(|_| malformed())?;
    Ok((rtp, None))
}

/// RTP delivery parameters for one negotiated session.
///
/// Created once SETUP succeeds and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpSession {
    pub client_ip: IpAddr,
    pub client_rtp_port: u16,
    pub client_rtcp_port: Option<u16>,
    pub mode: TransportMode,
    /// Local RTP port advertised to the sink (unused when interleaved).
    pub server_rtp_port: u16,
}

impl RtpSession {
    pub fn new(client_ip: IpAddr, transport: ClientTransport, server_rtp_port: u16) -> Self {
        let server_rtp_port = match transport.mode {
            TransportMode::TcpInterleaved => 0,
            TransportMode::Udp | TransportMode::Tcp => server_rtp_port,
        };
        Self {
            client_ip,
            client_rtp_port: transport.rtp_port,
            client_rtcp_port: transport.rtcp_port,
            mode: transport.mode,
            server_rtp_port,
        }
    }

    /// `Transport` header value for the SETUP reply.
    ///
    /// ```text
    /// RTP/AVP/UDP;unicast;client_port=19000-19001;server_port=20000-20001
    /// ```
    pub fn transport_header(&self) -> String {
        let proto = if self.mode == TransportMode::Tcp { "TCP" } else { "UDP" };
        match (self.mode, self.client_rtcp_port) {
            (TransportMode::TcpInterleaved, rtcp) => format!(
                "RTP/AVP/TCP;interleaved={}-{}",
                self.client_rtp_port,
                rtcp.unwrap_or(self.client_rtp_port.saturating_add(1))
            ),
            (_, Some(rtcp)) => format!(
                "RTP/AVP/{proto};unicast;client_port={}-{};server_port={}-{}",
                self.client_rtp_port,
                rtcp,
                self.server_rtp_port,
                self.server_rtp_port.saturating_add(1)
            ),
            (_, None) => format!(
                "RTP/AVP/{proto};unicast;client_port={};server_port={}",
                self.client_rtp_port, self.server_rtp_port
            ),
        }
    }
}
