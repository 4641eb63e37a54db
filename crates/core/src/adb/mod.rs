//! ADB client side: transport framing, per-device clients and the registry.
//!
//! - [`message`]: the 24-byte header wire format.
//! - [`connection`]: `CNXN`/`AUTH` handshake and stream demultiplexing.
//! - [`sync`]: SYNC `SEND`/`DATA`/`DONE`/`QUIT` push.
//! - [`client`]: one device, status machine, shell responses.
//! - [`registry`]: IP-keyed clients with addressed and fan-out operations.

pub mod client;
pub mod connection;
pub mod crypto;
pub mod event;
pub mod message;
pub mod registry;
pub mod sync;

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use crate::error::Result;

pub use client::AdbClient;
pub use connection::{AdbConnection, AdbStream};
pub use crypto::AdbCrypto;
pub use event::{AdbEvent, AdbEventKind, AdbStatus};
pub use registry::AdbRegistry;

/// Default adbd TCP port.
pub const DEFAULT_ADB_PORT: u16 = 5555;

#[derive(Debug, Clone)]
pub struct AdbConfig {
    pub port: u16,
    /// `None` leaves the OS connect timeout in place.
    pub connect_timeout: Option<Duration>,
    /// max_payload offered in `CNXN`.
    pub max_payload: u32,
    pub system_identity: String,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_ADB_PORT,
            connect_timeout: None,
            max_payload: 4096,
            system_identity: "host::".to_string(),
        }
    }
}

/// Content of a push. Cloneable so a fan-out push can open one reader per
/// client.
#[derive(Debug, Clone)]
pub enum PushSource {
    Bytes(Arc<[u8]>),
    File(PathBuf),
}

impl PushSource {
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match self {
            Self::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Self::File(path) => Ok(Box::new(File::open(path)?)),
        }
    }

    /// Timestamp sent in `DONE`: the file's mtime, or now for in-memory data.
    pub fn mtime_secs(&self) -> u32 {
        let modified = match self {
            Self::File(path) => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            Self::Bytes(_) => None,
        };
        modified.unwrap_or_else(|| chrono::Utc::now().timestamp()) as u32
    }
}

impl From<Vec<u8>> for PushSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<PathBuf> for PushSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}
