//! Tokenizers for WFD `text/parameters` values.
//!
//! ```text
//! wfd_audio_codecs: LPCM 00000002 00, AAC 00000001 00
//! wfd_client_rtp_ports: RTP/AVP/UDP;unicast 19000 0 mode=play
//! ```

use std::collections::HashMap;

use crate::error::{MirrorError, Result};

pub const WFD_CONTENT_PROTECTION: &str = "wfd_content_protection";
pub const WFD_VIDEO_FORMATS: &str = "wfd_video_formats";
pub const WFD_AUDIO_CODECS: &str = "wfd_audio_codecs";
pub const WFD_CLIENT_RTP_PORTS: &str = "wfd_client_rtp_ports";
pub const WFD_PRESENTATION_URL: &str = "wfd_presentation_URL";
pub const WFD_TRIGGER_METHOD: &str = "wfd_trigger_method";

/// Parse a `text/parameters` body into `name -> value`.
///
/// Each non-empty line is `name: value`. Lines without a colon are bare
/// parameter names (as in a GET_PARAMETER body) and map to `""`.
pub fn parse_parameters(body: &str) -> HashMap<String, String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(':') {
            Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

/// Audio codec chosen for the session after M3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Lpcm,
}

impl AudioCodec {
    /// Value advertised in the M4 `wfd_audio_codecs` line.
    pub fn wfd_value(self) -> &'static str {
        match self {
            Self::Aac => "AAC 00000001 00",
            Self::Lpcm => "LPCM 00000002 00",
        }
    }
}

/// AAC 48 kHz stereo.
const AAC_MODE_48K_2CH: u32 = 0x1;
/// LPCM 48 kHz stereo.
const LPCM_MODE_48K_2CH: u32 = 0x2;

/// Pick the audio codec from a sink's `wfd_audio_codecs` value.
///
/// The value is a comma-separated list of `<codec> <modes> <latency>`
/// entries with hex fields. AAC wins when both are usable. `none`, an
/// absent value, or entries without a usable mode bit disable audio.
pub fn select_audio_codec(value: Option<&str>) -> Option<AudioCodec> {
    let value = value?.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        return None;
    }

    let mut aac = false;
    let mut lpcm = false;
    for entry in value.split(',') {
        let mut fields = entry.split_whitespace();
        let (Some(codec), Some(modes)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(modes) = u32::from_str_radix(modes, 16) else {
            tracing::debug!(entry, "unparsable audio codec modes");
            continue;
        };
        match codec.to_ascii_uppercase().as_str() {
            "AAC" => aac |= modes & AAC_MODE_48K_2CH != 0,
            "LPCM" => lpcm |= modes & LPCM_MODE_48K_2CH != 0,
            _ => {}
        }
    }

    if aac {
        Some(AudioCodec::Aac)
    } else if lpcm {
        Some(AudioCodec::Lpcm)
    } else {
        None
    }
}

/// Sink RTP port pair offered in `wfd_client_rtp_ports`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRtpPorts {
    pub rtp_port0: u16,
    pub rtp_port1: u16,
}

impl ClientRtpPorts {
    /// Parse `RTP/AVP/UDP;unicast <port0> <port1> mode=play`.
    pub fn parse(value: &str) -> Result<Self> {
        let fields: Vec<&str> = value.split_whitespace().collect();
        let [profile, port0, port1, mode] = fields.as_slice() else {
            return Err(MirrorError::malformed(format!("wfd_client_rtp_ports: {value}")));
        };
        if !profile.eq_ignore_ascii_case("RTP/AVP/UDP;unicast") || !mode.eq_ignore_ascii_case("mode=play") {
            return Err(MirrorError::malformed(format!("wfd_client_rtp_ports: {value}")));
        }
        let rtp_port0 = port0
            .parse()
            .map_err(|_| MirrorError::malformed(format!("rtp port: {port0}")))?;
        let rtp_port1 = port1
            .parse()
            .map_err(|_| MirrorError::malformed(format!("rtp port: {port1}")))?;
        Ok(Self { rtp_port0, rtp_port1 })
    }
}
