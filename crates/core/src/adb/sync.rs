//! SYNC sub-protocol push (`sync:` service).
//!
//! ```text
//! SEND <len> "<path>,33206"
//! DATA <len> <bytes>        (repeated, len <= max_data)
//! DONE <mtime seconds>
//!                           <- "OKAY" | "FAIL" <len> <reason>
//! QUIT 0
//! ```
//!
//! Every length and timestamp is a 4-byte little-endian integer.

use std::io::Read;

use crate::adb::connection::AdbStream;
use crate::error::Result;

/// Regular file, mode 0644 as the decimal the daemon expects.
pub const PUSH_MODE: u32 = 33206;

/// Byte stream a push is written to.
pub trait SyncIo {
    fn write(&self, data: &[u8]) -> Result<()>;
    fn read(&self) -> Result<Vec<u8>>;
}

impl SyncIo for AdbStream {
    fn write(&self, data: &[u8]) -> Result<()> {
        AdbStream::write(self, data)
    }

    fn read(&self) -> Result<Vec<u8>> {
        AdbStream::read(self)
    }
}

fn frame(tag: &[u8; 4], value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(tag);
    out[4..].copy_from_slice(&value.to_le_bytes());
    out
}

/// Push `source` to `remote_path`.
///
/// Returns whether the daemon answered `OKAY`. Any I/O error on either side
/// is returned as `Err`.
pub fn push_file(
    stream: &dyn SyncIo,
    source: &mut dyn Read,
    remote_path: &str,
    max_data: usize,
    mtime_secs: u32,
) -> Result<bool> {
    let target = format!("{remote_path},{PUSH_MODE}");
    stream.write(&frame(b"SEND", target.len() as u32))?;
    stream.write(target.as_bytes())?;

    let mut buf = vec![0u8; max_data.max(1)];
    let mut sent = 0usize;
    loop {
        let read = source.read(&mut buf)?;
        if read == 0 {
            break;
        }
        stream.write(&frame(b"DATA", read as u32))?;
        stream.write(&buf[..read])?;
        sent += read;
        tracing::trace!(sent_kb = sent / 1024, "push progress");
    }

    stream.write(&frame(b"DONE", mtime_secs))?;
    let reply = stream.read()?;
    let ok = reply.starts_with(b"OKAY");
    if !ok {
        tracing::warn!(remote_path, reply = %String::from_utf8_lossy(&reply), "push rejected");
    }
    stream.write(&frame(b"QUIT", 0))?;

    tracing::debug!(remote_path, bytes = sent, ok, "push finished");
    Ok(ok)
}
