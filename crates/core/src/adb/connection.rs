//! One ADB transport connection and its logical streams.
//!
//! After the `CNXN` handshake a reader thread demultiplexes incoming
//! messages by local stream id. `WRTE` payloads are queued on the stream's
//! data channel and acknowledged with `OKAY`; `OKAY`s are queued on its ack
//! channel; `CLSE` detaches the stream, which disconnects both channels.
//! Writers take the socket lock per message, so the reader thread and
//! stream writers never interleave bytes.

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::adb::AdbConfig;
use crate::adb::crypto::{AdbCrypto, public_key_payload};
use crate::adb::message::{
    A_AUTH, A_CLSE, A_CNXN, A_OKAY, A_WRTE, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, AdbMessage,
};
use crate::error::{ErrorKind, MirrorError, Result};

struct Slot {
    data: Sender<Vec<u8>>,
    acks: Sender<u32>,
    closed: Arc<AtomicBool>,
}

/// State shared by the connection, its streams and the reader thread.
struct Link {
    writer: Mutex<TcpStream>,
    streams: Mutex<HashMap<u32, Slot>>,
    closed: AtomicBool,
}

impl Link {
    fn send(&self, msg: &AdbMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        let mut writer = self.writer.lock();
        msg.write_to(&mut *writer)
    }

    fn detach(&self, local_id: u32) {
        if let Some(slot) = self.streams.lock().remove(&local_id) {
            slot.closed.store(true, Ordering::SeqCst);
        }
    }

    fn shutdown_streams(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, slot) in self.streams.lock().drain() {
            slot.closed.store(true, Ordering::SeqCst);
        }
    }
}

fn closed_error() -> MirrorError {
    MirrorError::protocol(ErrorKind::Closed, "ADB stream closed")
}

/// An authenticated transport connection to one ADB daemon.
pub struct AdbConnection {
    link: Arc<Link>,
    socket: TcpStream,
    reader: Option<JoinHandle<()>>,
    max_data: usize,
    next_local_id: AtomicU32,
}

impl AdbConnection {
    /// Open a TCP socket to `ip:port` and run the handshake.
    pub fn dial(ip: &str, config: &AdbConfig, crypto: Option<Arc<dyn AdbCrypto>>) -> Result<Self> {
        let socket = match config.connect_timeout {
            None => TcpStream::connect((ip, config.port))?,
            Some(timeout) => {
                let addr = (ip, config.port).to_socket_addrs()?.next().ok_or_else(|| {
                    MirrorError::protocol(ErrorKind::ConnectFailed, format!("cannot resolve {ip}"))
                })?;
                TcpStream::connect_timeout(&addr, timeout)?
            }
        };
        Self::handshake(socket, config, crypto)
    }

    /// Run `CNXN`/`AUTH` on an already connected socket.
    pub fn handshake(mut socket: TcpStream, config: &AdbConfig, crypto: Option<Arc<dyn AdbCrypto>>) -> Result<Self> {
        AdbMessage::connect(config.max_payload, &config.system_identity).write_to(&mut socket)?;

        let mut signature_sent = false;
        let max_data = loop {
            let msg = AdbMessage::read_from(&mut socket)?;
            match msg.command {
                A_CNXN => {
                    tracing::debug!(version = msg.arg0, max_data = msg.arg1, "device accepted connection");
                    break (msg.arg1 as usize).max(1);
                }
                A_AUTH if msg.arg0 == AUTH_TOKEN => {
                    let Some(crypto) = crypto.as_deref() else {
                        return Err(MirrorError::AuthRequired);
                    };
                    if signature_sent {
                        tracing::info!("signature rejected, offering public key");
                        AdbMessage::auth(AUTH_RSAPUBLICKEY, public_key_payload(crypto, &config.system_identity))
                            .write_to(&mut socket)?;
                    } else {
                        let signature = crypto.sign(&msg.payload)?;
                        AdbMessage::auth(AUTH_SIGNATURE, signature).write_to(&mut socket)?;
                        signature_sent = true;
                    }
                }
                _ => {
                    return Err(MirrorError::protocol(
                        ErrorKind::ConnectFailed,
                        format!("unexpected {} during handshake", msg.name()),
                    ));
                }
            }
        };

        let reader_socket = socket.try_clone()?;
        let link = Arc::new(Link {
            writer: Mutex::new(socket.try_clone()?),
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let reader_link = link.clone();
        let reader = thread::spawn(move || read_loop(reader_socket, reader_link));

        Ok(Self {
            link,
            socket,
            reader: Some(reader),
            max_data,
            next_local_id: AtomicU32::new(1),
        })
    }

    /// Largest payload the device accepts in one `WRTE`.
    pub fn max_data(&self) -> usize {
        self.max_data
    }

    pub fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }

    /// Open a logical stream to a service such as `shell:` or `sync:`.
    pub fn open(&self, destination: &str) -> Result<AdbStream> {
        let local_id = self.next_local_id.fetch_add(1, Ordering::SeqCst);
        let (data_tx, data_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));

        self.link.streams.lock().insert(
            local_id,
            Slot {
                data: data_tx,
                acks: ack_tx,
                closed: closed.clone(),
            },
        );

        if let Err(e) = self.link.send(&AdbMessage::open(local_id, destination)) {
            self.link.detach(local_id);
            return Err(e);
        }

        let remote_id = ack_rx
            .recv()
            .map_err(|_| MirrorError::failed(format!("device refused {destination}")))?;

        tracing::debug!(destination, local_id, remote_id, "stream opened");
        Ok(AdbStream {
            local_id,
            remote_id,
            max_data: self.max_data,
            link: self.link.clone(),
            data: data_rx,
            acks: ack_rx,
            closed,
        })
    }

    /// Shut the socket down and wait for the reader thread.
    pub fn close(&mut self) {
        self.link.shutdown_streams();
        let _ = self.socket.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            tracing::error!("ADB reader thread panicked");
        }
    }
}

impl Drop for AdbConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(mut socket: TcpStream, link: Arc<Link>) {
    loop {
        let msg = match AdbMessage::read_from(&mut socket) {
            Ok(msg) => msg,
            Err(e) => {
                if !link.closed.load(Ordering::SeqCst) {
                    tracing::debug!(error = %e, "ADB read failed");
                }
                break;
            }
        };

        let local_id = msg.arg1;
        match msg.command {
            A_OKAY => {
                if let Some(slot) = link.streams.lock().get(&local_id) {
                    let _ = slot.acks.send(msg.arg0);
                }
            }
            A_WRTE => {
                let known = match link.streams.lock().get(&local_id) {
                    Some(slot) => slot.data.send(msg.payload).is_ok(),
                    None => false,
                };
                if !known {
                    tracing::trace!(local_id, "WRTE for unknown stream dropped");
                    continue;
                }
                if link.send(&AdbMessage::okay(local_id, msg.arg0)).is_err() {
                    break;
                }
            }
            A_CLSE => link.detach(local_id),
            _ => tracing::trace!(command = %msg.name(), "ignored ADB message"),
        }
    }
    link.shutdown_streams();
}

/// A logical stream multiplexed on an [`AdbConnection`].
pub struct AdbStream {
    local_id: u32,
    remote_id: u32,
    max_data: usize,
    link: Arc<Link>,
    data: Receiver<Vec<u8>>,
    acks: Receiver<u32>,
    closed: Arc<AtomicBool>,
}

impl AdbStream {
    /// Write `data`, split into `max_data` chunks, waiting for the device's
    /// `OKAY` after each.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.max_data) {
            if self.is_closed() {
                return Err(closed_error());
            }
            self.link.send(&AdbMessage::write(self.local_id, self.remote_id, chunk))?;
            self.acks.recv().map_err(|_| closed_error())?;
        }
        Ok(())
    }

    /// Block until the next `WRTE` payload arrives.
    ///
    /// Payloads queued before a close are still returned.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.data.recv().map_err(|_| closed_error())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.link.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.link.detach(self.local_id);
        self.link.send(&AdbMessage::close(self.local_id, self.remote_id))
    }
}

impl Drop for AdbStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::crypto::tests::FixedKey;
    use crate::adb::message::{A_OPEN, AUTH_TOKEN};
    use std::net::TcpListener;

    fn device<F>(script: F) -> (TcpStream, JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            script(socket);
        });
        (TcpStream::connect(addr).unwrap(), handle)
    }

    fn expect(socket: &mut TcpStream, command: u32) -> AdbMessage {
        let msg = AdbMessage::read_from(socket).unwrap();
        assert_eq!(msg.command, command, "got {}", msg.name());
        msg
    }

    #[test]
    fn handshake_without_auth() {
        let (socket, device) = device(|mut s| {
            let cnxn = expect(&mut s, A_CNXN);
            assert_eq!(cnxn.payload, b"host::\0");
            AdbMessage::connect(2048, "device::").write_to(&mut s).unwrap();
        });
        let conn = AdbConnection::handshake(socket, &AdbConfig::default(), None).unwrap();
        assert_eq!(conn.max_data(), 2048);
        device.join().unwrap();
    }

    #[test]
    fn auth_signature_then_public_key() {
        let (socket, device) = device(|mut s| {
            expect(&mut s, A_CNXN);
            AdbMessage::auth(AUTH_TOKEN, b"token".to_vec()).write_to(&mut s).unwrap();
            let sig = expect(&mut s, A_AUTH);
            assert_eq!((sig.arg0, sig.payload.as_slice()), (AUTH_SIGNATURE, &b"nekot"[..]));
            AdbMessage::auth(AUTH_TOKEN, b"token".to_vec()).write_to(&mut s).unwrap();
            let key = expect(&mut s, A_AUTH);
            assert_eq!(key.arg0, AUTH_RSAPUBLICKEY);
            assert!(key.payload.starts_with(b"3q2+7w== "));
            AdbMessage::connect(4096, "device::").write_to(&mut s).unwrap();
        });
        let crypto: Arc<dyn AdbCrypto> = Arc::new(FixedKey);
        assert!(AdbConnection::handshake(socket, &AdbConfig::default(), Some(crypto)).is_ok());
        device.join().unwrap();
    }

    #[test]
    fn auth_without_crypto_fails() {
        let (socket, device) = device(|mut s| {
            expect(&mut s, A_CNXN);
            AdbMessage::auth(AUTH_TOKEN, b"token".to_vec()).write_to(&mut s).unwrap();
        });
        let err = AdbConnection::handshake(socket, &AdbConfig::default(), None).err().unwrap();
        assert!(matches!(err, MirrorError::AuthRequired));
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);
        device.join().unwrap();
    }

    #[test]
    fn stream_write_waits_for_okay_and_reads_are_acked() {
        let (socket, device) = device(|mut s| {
            expect(&mut s, A_CNXN);
            AdbMessage::connect(4, "device::").write_to(&mut s).unwrap();

            let open = expect(&mut s, A_OPEN);
            assert_eq!(open.payload, b"shell:\0");
            let local = open.arg0;
            AdbMessage::okay(77, local).write_to(&mut s).unwrap();

            // 6 bytes with max_data 4 arrive as two WRTEs.
            for expected in [&b"echo"[..], &b" x"[..]] {
                let wrte = expect(&mut s, A_WRTE);
                assert_eq!((wrte.arg0, wrte.arg1), (local, 77));
                assert_eq!(wrte.payload, expected);
                AdbMessage::okay(77, local).write_to(&mut s).unwrap();
            }

            AdbMessage::write(77, local, b"x\n/ $ ").write_to(&mut s).unwrap();
            let ack = expect(&mut s, A_OKAY);
            assert_eq!((ack.arg0, ack.arg1), (local, 77));
            AdbMessage::close(77, local).write_to(&mut s).unwrap();
        });

        let conn = AdbConnection::handshake(socket, &AdbConfig::default(), None).unwrap();
        let shell = conn.open("shell:").unwrap();
        shell.write(b"echo x").unwrap();
        assert_eq!(shell.read().unwrap(), b"x\n/ $ ");
        assert!(shell.read().is_err());
        assert!(shell.is_closed());
        device.join().unwrap();
    }

    #[test]
    fn refused_open_is_failed() {
        let (socket, device) = device(|mut s| {
            expect(&mut s, A_CNXN);
            AdbMessage::connect(4096, "device::").write_to(&mut s).unwrap();
            let open = expect(&mut s, A_OPEN);
            AdbMessage::close(0, open.arg0).write_to(&mut s).unwrap();
        });
        let conn = AdbConnection::handshake(socket, &AdbConfig::default(), None).unwrap();
        let err = conn.open("sync:").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Failed);
        device.join().unwrap();
    }
}
