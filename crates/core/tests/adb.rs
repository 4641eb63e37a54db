//! ADB client and registry against a scripted fake daemon on loopback.

use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use miracast::adb::message::{A_CNXN, A_OKAY, A_OPEN, A_WRTE, AUTH_TOKEN, AdbMessage};
use miracast::{AdbConfig, AdbEvent, AdbEventKind, AdbRegistry, AdbStatus, ErrorKind, PushSource};

const DEVICE_SHELL_ID: u32 = 100;
const DEVICE_SYNC_ID: u32 = 200;

struct FakeDevice {
    socket: TcpStream,
}

impl FakeDevice {
    fn expect(&mut self, command: u32) -> AdbMessage {
        let msg = AdbMessage::read_from(&mut self.socket).expect("message from client");
        assert_eq!(msg.command, command, "got {}", msg.name());
        msg
    }

    fn send(&mut self, msg: AdbMessage) {
        msg.write_to(&mut self.socket).expect("write to client");
    }

    fn accept_connection(&mut self) {
        let cnxn = self.expect(A_CNXN);
        assert_eq!(cnxn.payload, b"host::\0");
        self.send(AdbMessage::connect(4096, "device::"));
    }

    /// Accept an OPEN for `service`, returning the client's local id.
    fn accept_open(&mut self, service: &str, device_id: u32) -> u32 {
        let open = self.expect(A_OPEN);
        assert_eq!(open.payload, format!("{service}\0").as_bytes());
        self.send(AdbMessage::okay(device_id, open.arg0));
        open.arg0
    }

    /// Receive one WRTE and acknowledge it.
    fn receive(&mut self, device_id: u32) -> Vec<u8> {
        let wrte = self.expect(A_WRTE);
        self.send(AdbMessage::okay(device_id, wrte.arg0));
        wrte.payload
    }

    /// Send one WRTE and wait for the client's OKAY.
    fn deliver(&mut self, device_id: u32, local_id: u32, data: &[u8]) {
        self.send(AdbMessage::write(device_id, local_id, data));
        let ack = self.expect(A_OKAY);
        assert_eq!((ack.arg0, ack.arg1), (local_id, device_id));
    }

    /// Take one SYNC push up to `DONE`, accept it and read `QUIT`.
    /// Returns everything written before `QUIT`.
    fn serve_push(&mut self, sync: u32) -> Vec<u8> {
        let mut pushed = Vec::new();
        while pushed.len() < 8 || &pushed[pushed.len() - 8..pushed.len() - 4] != b"DONE" {
            pushed.extend(self.receive(DEVICE_SYNC_ID));
        }
        self.deliver(DEVICE_SYNC_ID, sync, b"OKAY\0\0\0\0");
        assert_eq!(self.receive(DEVICE_SYNC_ID), b"QUIT\0\0\0\0");
        pushed
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn fake_device<F>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(FakeDevice) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (socket, _) = listener.accept().unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        script(FakeDevice { socket });
    });
    (port, handle)
}

/// Skip events until one matches.
fn wait_for(events: &Receiver<AdbEvent>, pred: impl Fn(&AdbEventKind) -> bool) -> AdbEventKind {
    loop {
        let event = events
            .recv_timeout(Duration::from_secs(5))
            .expect("timed out waiting for event");
        if pred(&event.kind) {
            return event.kind;
        }
    }
}

#[test]
fn shell_command_and_push_over_fake_daemon() {
    let (port, device) = fake_device(|mut d| {
        d.accept_connection();
        let shell = d.accept_open("shell:", DEVICE_SHELL_ID);

        assert_eq!(d.receive(DEVICE_SHELL_ID), b"echo hi\n");
        d.deliver(DEVICE_SHELL_ID, shell, b"hi\r\n");
        d.deliver(DEVICE_SHELL_ID, shell, b"device:/ $ ");

        let sync = d.accept_open("sync:", DEVICE_SYNC_ID);
        let mut pushed = Vec::new();
        while pushed.len() < 8 || &pushed[pushed.len() - 8..pushed.len() - 4] != b"DONE" {
            pushed.extend(d.receive(DEVICE_SYNC_ID));
        }
        let target = b"/data/local/tmp/daemon.apk,33206";
        let mut expected = Vec::new();
        expected.extend_from_slice(b"SEND");
        expected.extend_from_slice(&(target.len() as u32).to_le_bytes());
        expected.extend_from_slice(target);
        expected.extend_from_slice(b"DATA");
        expected.extend_from_slice(&5u32.to_le_bytes());
        expected.extend_from_slice(b"hello");
        expected.extend_from_slice(b"DONE");
        assert_eq!(&pushed[..pushed.len() - 4], expected.as_slice());

        d.deliver(DEVICE_SYNC_ID, sync, b"OKAY\0\0\0\0");
        assert_eq!(d.receive(DEVICE_SYNC_ID), b"QUIT\0\0\0\0");
        d.send(AdbMessage::close(DEVICE_SYNC_ID, sync));
    });

    let registry = AdbRegistry::new(AdbConfig::default(), None);
    let events = registry.subscribe();
    registry.connect("127.0.0.1", port).unwrap();

    assert_eq!(
        wait_for(&events, |k| matches!(k, AdbEventKind::Status(_))),
        AdbEventKind::Status(AdbStatus::Connecting)
    );
    assert_eq!(
        wait_for(&events, |k| matches!(k, AdbEventKind::Status(_))),
        AdbEventKind::Status(AdbStatus::Connected)
    );
    assert_eq!(registry.status("127.0.0.1").unwrap(), AdbStatus::Connected);

    registry.send_command("127.0.0.1", "echo hi\n").unwrap();
    assert_eq!(
        wait_for(&events, |k| matches!(k, AdbEventKind::Response(_))),
        AdbEventKind::Response("hi\r\ndevice:/ $ ".to_string())
    );

    registry
        .push_file("127.0.0.1", PushSource::from(b"hello".to_vec()), "/data/local/tmp/daemon.apk")
        .unwrap();
    assert_eq!(
        wait_for(&events, |k| matches!(k, AdbEventKind::FilePushed(_))),
        AdbEventKind::FilePushed(true)
    );

    device.join().unwrap();
    registry.release();
    assert_eq!(
        wait_for(&events, |k| matches!(k, AdbEventKind::Status(_))),
        AdbEventKind::Status(AdbStatus::Disconnected)
    );
}

#[test]
fn dropped_connection_reports_closed_then_disconnects() {
    let (port, device) = fake_device(|mut d| {
        d.accept_connection();
        d.accept_open("shell:", DEVICE_SHELL_ID);
    });

    let registry = AdbRegistry::new(AdbConfig::default(), None);
    let events = registry.subscribe();
    registry.connect("127.0.0.1", port).unwrap();
    device.join().unwrap();

    let error = wait_for(&events, |k| matches!(k, AdbEventKind::Error { .. }));
    assert!(matches!(
        error,
        AdbEventKind::Error {
            kind: ErrorKind::Closed,
            ..
        }
    ));
    assert_eq!(
        wait_for(&events, |k| matches!(k, AdbEventKind::Status(_))),
        AdbEventKind::Status(AdbStatus::Disconnected)
    );
    registry.release();
}

#[test]
fn auth_without_key_pair_is_connect_failed() {
    let (port, device) = fake_device(|mut d| {
        d.expect(A_CNXN);
        d.send(AdbMessage::auth(AUTH_TOKEN, vec![7; 20]));
    });

    let registry = AdbRegistry::new(AdbConfig::default(), None);
    let events = registry.subscribe();
    registry.connect("127.0.0.1", port).unwrap();

    let error = wait_for(&events, |k| matches!(k, AdbEventKind::Error { .. }));
    assert!(matches!(
        error,
        AdbEventKind::Error {
            kind: ErrorKind::ConnectFailed,
            ..
        }
    ));
    assert_eq!(
        wait_for(&events, |k| matches!(k, AdbEventKind::Status(_))),
        AdbEventKind::Status(AdbStatus::Disconnected)
    );
    device.join().unwrap();
    registry.release();
}

#[test]
fn refused_shell_is_connect_failed() {
    let (port, device) = fake_device(|mut d| {
        d.accept_connection();
        let open = d.expect(A_OPEN);
        d.send(AdbMessage::close(0, open.arg0));
    });

    let registry = AdbRegistry::new(AdbConfig::default(), None);
    let events = registry.subscribe();
    registry.connect("127.0.0.1", port).unwrap();

    assert!(matches!(
        wait_for(&events, |k| matches!(k, AdbEventKind::Error { .. })),
        AdbEventKind::Error {
            kind: ErrorKind::ConnectFailed,
            ..
        }
    ));
    device.join().unwrap();
    registry.release();
}

#[test]
fn sync_stream_is_opened_once_and_reused() {
    let (port, device) = fake_device(|mut d| {
        d.accept_connection();
        d.accept_open("shell:", DEVICE_SHELL_ID);

        let sync = d.accept_open("sync:", DEVICE_SYNC_ID);
        assert!(contains(&d.serve_push(sync), b"hello"));
        // The second push arrives as WRTE on the same stream, not a new OPEN.
        assert!(contains(&d.serve_push(sync), b"world"));
    });

    let registry = AdbRegistry::new(AdbConfig::default(), None);
    let events = registry.subscribe();
    registry.connect("127.0.0.1", port).unwrap();
    wait_for(&events, |k| *k == AdbEventKind::Status(AdbStatus::Connected));

    for (data, path) in [(b"hello", "/data/local/tmp/a"), (b"world", "/data/local/tmp/b")] {
        registry
            .push_file("127.0.0.1", PushSource::from(data.to_vec()), path)
            .unwrap();
        assert_eq!(
            wait_for(&events, |k| matches!(k, AdbEventKind::FilePushed(_))),
            AdbEventKind::FilePushed(true)
        );
    }

    device.join().unwrap();
    registry.release();
}

#[test]
fn device_drop_during_push_fails_and_disconnects() {
    let (port, device) = fake_device(|mut d| {
        d.accept_connection();
        d.accept_open("shell:", DEVICE_SHELL_ID);
        d.accept_open("sync:", DEVICE_SYNC_ID);
        d.receive(DEVICE_SYNC_ID);
        // Take the next write without acknowledging it, then hang up.
        d.expect(A_WRTE);
    });

    let registry = AdbRegistry::new(AdbConfig::default(), None);
    let events = registry.subscribe();
    registry.connect("127.0.0.1", port).unwrap();
    wait_for(&events, |k| *k == AdbEventKind::Status(AdbStatus::Connected));

    registry
        .push_file("127.0.0.1", PushSource::from(vec![1u8; 10_000]), "/data/local/tmp/big")
        .unwrap();

    let next = || events.recv_timeout(Duration::from_secs(5)).expect("event").kind;
    assert!(matches!(
        next(),
        AdbEventKind::Error {
            kind: ErrorKind::Closed,
            ..
        }
    ));
    assert_eq!(next(), AdbEventKind::FilePushed(false));
    assert_eq!(next(), AdbEventKind::Status(AdbStatus::Disconnected));
    assert_eq!(registry.status("127.0.0.1").unwrap(), AdbStatus::Disconnected);

    device.join().unwrap();
    registry.release();
}

#[test]
fn broadcasts_reach_connected_clients() {
    let (port, device) = fake_device(|mut d| {
        d.accept_connection();
        let shell = d.accept_open("shell:", DEVICE_SHELL_ID);

        assert_eq!(d.receive(DEVICE_SHELL_ID), b"id\n");
        d.deliver(DEVICE_SHELL_ID, shell, b"uid=2000(shell)\r\n/ $ ");

        let sync = d.accept_open("sync:", DEVICE_SYNC_ID);
        let pushed = d.serve_push(sync);
        assert!(contains(&pushed, b"/sdcard/banner.png,33206"));
        assert!(contains(&pushed, b"png"));
    });

    let registry = AdbRegistry::new(AdbConfig::default(), None);
    let events = registry.subscribe();
    registry.connect("127.0.0.1", port).unwrap();
    wait_for(&events, |k| *k == AdbEventKind::Status(AdbStatus::Connected));

    registry.broadcast_command("id\n").unwrap();
    assert_eq!(
        wait_for(&events, |k| matches!(k, AdbEventKind::Response(_))),
        AdbEventKind::Response("uid=2000(shell)\r\n/ $ ".to_string())
    );

    registry
        .broadcast_push(PushSource::from(b"png".to_vec()), "/sdcard/banner.png")
        .unwrap();
    let pushed = events.recv_timeout(Duration::from_secs(5)).expect("push event");
    assert_eq!(pushed.ip, "127.0.0.1");
    assert_eq!(pushed.kind, AdbEventKind::FilePushed(true));

    device.join().unwrap();
    registry.release();
}
