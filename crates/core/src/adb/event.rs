use std::fmt;

use crate::error::ErrorKind;

/// Connection state of one [`AdbClient`](crate::adb::AdbClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdbStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for AdbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbEventKind {
    Status(AdbStatus),
    Error { kind: ErrorKind, message: String },
    /// Shell output up to and including the prompt.
    Response(String),
    FilePushed(bool),
}

/// Event raised by a client, tagged with the device address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbEvent {
    pub ip: String,
    pub kind: AdbEventKind,
}
