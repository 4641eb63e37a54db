use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::Result;

/// Key pair used to answer a device's `AUTH` challenge.
///
/// Key generation and persistence live with the embedder; this crate only
/// signs tokens and offers the public key.
pub trait AdbCrypto: Send + Sync {
    /// Public key in the device's binary RSA format (not yet base64-encoded).
    fn public_key(&self) -> Vec<u8>;

    /// Sign a 20-byte `AUTH` token.
    fn sign(&self, token: &[u8]) -> Result<Vec<u8>>;
}

/// `AUTH RSAPUBLICKEY` payload: base64 key, a space, a comment, NUL.
pub fn public_key_payload(crypto: &dyn AdbCrypto, comment: &str) -> Vec<u8> {
    let mut payload = BASE64_STANDARD.encode(crypto.public_key()).into_bytes();
    payload.push(b' ');
    payload.extend_from_slice(comment.as_bytes());
    payload.push(0);
    payload
}
