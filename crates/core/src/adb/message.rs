//! ADB transport messages.
//!
//! Every message is a 24-byte little-endian header followed by `data_len`
//! payload bytes:
//!
//! ```text
//! +---------+------+------+----------+---------------+-----------------+
//! | command | arg0 | arg1 | data_len | data_checksum | magic (~command)|
//! +---------+------+------+----------+---------------+-----------------+
//! ```

use std::io::{Read, Write};

use crate::error::{ParseErrorKind, Result};

pub const A_CNXN: u32 = 0x4e58_4e43;
pub const A_AUTH: u32 = 0x4854_5541;
pub const A_OPEN: u32 = 0x4e45_504f;
pub const A_OKAY: u32 = 0x5941_4b4f;
pub const A_CLSE: u32 = 0x4553_4c43;
pub const A_WRTE: u32 = 0x4554_5257;

/// Protocol version offered in `CNXN`.
pub const A_VERSION: u32 = 0x0100_0000;

/// `AUTH` arg0 values.
pub const AUTH_TOKEN: u32 = 1;
pub const AUTH_SIGNATURE: u32 = 2;
pub const AUTH_RSAPUBLICKEY: u32 = 3;

pub const HEADER_LEN: usize = 24;

/// Upper bound on an accepted payload, well above any negotiated max_data.
const MAX_ACCEPTED_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbMessage {
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
}

impl AdbMessage {
    pub fn new(command: u32, arg0: u32, arg1: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    pub fn connect(max_payload: u32, system_identity: &str) -> Self {
        Self::new(A_CNXN, A_VERSION, max_payload, nul_terminated(system_identity))
    }

    pub fn auth(kind: u32, data: impl Into<Vec<u8>>) -> Self {
        Self::new(A_AUTH, kind, 0, data)
    }

    pub fn open(local_id: u32, destination: &str) -> Self {
        Self::new(A_OPEN, local_id, 0, nul_terminated(destination))
    }

    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new(A_OKAY, local_id, remote_id, Vec::new())
    }

    pub fn write(local_id: u32, remote_id: u32, data: &[u8]) -> Self {
        Self::new(A_WRTE, local_id, remote_id, data)
    }

    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(A_CLSE, local_id, remote_id, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        for word in [
            self.command,
            self.arg0,
            self.arg1,
            self.payload.len() as u32,
            checksum(&self.payload),
            self.command ^ 0xffff_ffff,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.encode())?;
        out.flush()?;
        Ok(())
    }

    /// Read one message, validating magic and (when non-zero) checksum.
    pub fn read_from<R: Read + ?Sized>(input: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        input.read_exact(&mut header)?;

        let word = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        let (command, arg0, arg1, len, sum, magic) =
            (word(0), word(4), word(8), word(12) as usize, word(16), word(20));

        if magic != command ^ 0xffff_ffff || len > MAX_ACCEPTED_PAYLOAD {
            return Err(ParseErrorKind::InvalidFrame.into());
        }

        let mut payload = vec![0; len];
        input.read_exact(&mut payload)?;
        // Devices on protocol version >= 0x01000001 send a zero checksum.
        if sum != 0 && sum != checksum(&payload) {
            return Err(ParseErrorKind::InvalidFrame.into());
        }

        Ok(Self {
            command,
            arg0,
            arg1,
            payload,
        })
    }

    /// Four-letter command name for logs.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.command.to_le_bytes()).into_owned()
    }
}

fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}
