//! Integration test: WFD negotiation M1..M5, then SETUP -> PLAY -> TEARDOWN.
//!
//! Starts the listener on an ephemeral port, connects as a sink, and
//! verifies each message in both directions.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use miracast::{RtspEventKind, RtspListener, StreamMessage};

struct Sink {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Sink {
    fn connect(listener: &RtspListener) -> Self {
        let addr = listener.local_addr().expect("listener bound");
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to listener");
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Sink {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    fn send(&mut self, message: &str) {
        self.writer.write_all(message.as_bytes()).unwrap();
        self.writer.flush().unwrap();
    }

    /// Read one message: head up to the blank line, then Content-Length bytes.
    fn read(&mut self) -> std::io::Result<String> {
        let mut message = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                break;
            }
            message.push_str(&line);
            if line == "\r\n" || line == "\n" {
                break;
            }
        }

        if let Some(len) = message
            .lines()
            .find(|l| l.to_lowercase().starts_with("content-length:"))
            .and_then(|l| l.split(':').nth(1))
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body)?;
            message.push_str(&String::from_utf8_lossy(&body));
        }

        Ok(message)
    }

    fn expect(&mut self, start: &str) -> String {
        let message = self.read().expect("message");
        assert!(
            message.starts_with(start),
            "expected {start:?}, got: {}",
            message.lines().next().unwrap_or("")
        );
        message
    }
}

fn header<'a>(message: &'a str, name: &str) -> Option<&'a str> {
    message.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn started_listener() -> RtspListener {
    let mut listener = RtspListener::new("127.0.0.1:0");
    listener.start().expect("listener start");
    listener
}

#[test]
fn options_is_answered_then_m3_follows() {
    let listener = started_listener();
    let mut sink = Sink::connect(&listener);

    let m1 = sink.expect("OPTIONS * RTSP/1.0\r\n");
    assert_eq!(header(&m1, "CSeq"), Some("1"));
    assert_eq!(header(&m1, "Require"), Some("org.wfa.wfd1.0"));
    sink.send("RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: org.wfa.wfd1.0, GET_PARAMETER, SET_PARAMETER\r\n\r\n");

    sink.send("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    let reply = sink.expect("RTSP/1.0 200 OK\r\n");
    assert_eq!(header(&reply, "CSeq"), Some("1"));
    assert_eq!(
        header(&reply, "Public"),
        Some("org.wfa.wfd1.0, SETUP, TEARDOWN, PLAY, PAUSE, GET_PARAMETER, SET_PARAMETER")
    );

    let m3 = sink.expect("GET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n");
    assert_eq!(header(&m3, "CSeq"), Some("2"));
    assert!(m3.contains("wfd_video_formats\r\n"));
    assert!(m3.contains("wfd_client_rtp_ports\r\n"));
}

#[test]
fn full_negotiation_setup_play_teardown() {
    let listener = started_listener();
    let events = listener.subscribe();
    let mut sink = Sink::connect(&listener);

    sink.expect("OPTIONS * RTSP/1.0\r\n");
    sink.send("RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n");
    sink.send("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nRequire: org.wfa.wfd1.0\r\n\r\n");
    sink.expect("RTSP/1.0 200 OK\r\n");
    sink.expect("GET_PARAMETER ");

    // M3 response
    let body = "wfd_video_formats: 00 00 02 10 0001ffff 1fffffff 00001fff 00 0000 0000 00 none none\r\n\
                wfd_audio_codecs: LPCM 00000002 00, AAC 00000001 00\r\n\
                wfd_client_rtp_ports: RTP/AVP/UDP;unicast 19000 0 mode=play\r\n";
    sink.send(&format!(
        "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Type: text/parameters\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    ));

    let m4 = sink.expect("SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n");
    assert_eq!(header(&m4, "CSeq"), Some("3"));
    assert!(m4.contains("wfd_audio_codecs: AAC 00000001 00\r\n"));
    assert!(m4.contains("wfd_presentation_URL: rtsp://127.0.0.1/wfd1.0/streamid=0 none\r\n"));
    assert!(m4.contains("wfd_client_rtp_ports: RTP/AVP/UDP;unicast 19000 0 mode=play\r\n"));
    sink.send("RTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\n");

    let m5 = sink.expect("SET_PARAMETER ");
    assert_eq!(header(&m5, "CSeq"), Some("4"));
    assert!(m5.contains("wfd_trigger_method: SETUP\r\n"));
    sink.send("RTSP/1.0 200 OK\r\nCSeq: 4\r\n\r\n");

    // M6 SETUP
    sink.send(
        "SETUP rtsp://127.0.0.1/wfd1.0/streamid=0 RTSP/1.0\r\nCSeq: 2\r\n\
         Transport: RTP/AVP/UDP;unicast;client_port=19000-19001\r\n\r\n",
    );
    let setup = sink.expect("RTSP/1.0 200 OK\r\n");
    assert_eq!(
        header(&setup, "Transport"),
        Some("RTP/AVP/UDP;unicast;client_port=19000-19001;server_port=20000-20001")
    );
    let session = header(&setup, "Session").expect("Session header").to_string();
    assert!(session.ends_with(";timeout=30"), "{session}");
    let id = session.split(';').next().unwrap().to_string();

    // M7 PLAY
    sink.send(&format!(
        "PLAY rtsp://127.0.0.1/wfd1.0/streamid=0 RTSP/1.0\r\nCSeq: 3\r\nSession: {id}\r\n\r\n"
    ));
    let play = sink.expect("RTSP/1.0 200 OK\r\n");
    assert_eq!(header(&play, "Range"), Some("npt=now-"));

    let started = events.recv_timeout(Duration::from_secs(5)).expect("started event");
    assert_eq!(started.kind, RtspEventKind::Message(StreamMessage::StreamingStarted));

    sink.send(&format!(
        "TEARDOWN rtsp://127.0.0.1/wfd1.0/streamid=0 RTSP/1.0\r\nCSeq: 4\r\nSession: {id}\r\n\r\n"
    ));
    sink.expect("RTSP/1.0 200 OK\r\n");
    let stopped = events.recv_timeout(Duration::from_secs(5)).expect("stopped event");
    assert_eq!(stopped.kind, RtspEventKind::Message(StreamMessage::StreamingStopped));

    // The session ends its loop and drops the socket.
    assert_eq!(sink.read().expect("read after teardown"), "");
}

#[test]
fn non_200_is_surfaced_as_error_event() {
    let listener = started_listener();
    let events = listener.subscribe();
    let mut sink = Sink::connect(&listener);

    sink.expect("OPTIONS * RTSP/1.0\r\n");
    sink.send("RTSP/1.0 500 Internal Server Error\r\nCSeq: 1\r\n\r\n");

    let event = events.recv_timeout(Duration::from_secs(5)).expect("error event");
    assert!(matches!(
        event.kind,
        RtspEventKind::Error {
            kind: miracast::ErrorKind::Failed,
            ..
        }
    ));

    // A rejected M1 ends negotiation and the connection.
    assert_eq!(sink.read().expect("read after rejected M1"), "");
}

#[test]
fn stop_closes_live_sessions() {
    let mut listener = started_listener();
    let mut sink = Sink::connect(&listener);
    sink.expect("OPTIONS * RTSP/1.0\r\n");

    listener.stop();
    assert!(!listener.is_running());
    assert_eq!(sink.read().expect("read after stop"), "");
}

#[test]
fn oversized_body_drops_only_that_connection() {
    let listener = started_listener();
    let mut sink = Sink::connect(&listener);
    sink.expect("OPTIONS * RTSP/1.0\r\n");

    sink.send("RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 100000000000000\r\n\r\n");
    assert_eq!(sink.read().expect("read after oversized body"), "");

    assert!(listener.is_running());
    let mut other = Sink::connect(&listener);
    other.expect("OPTIONS * RTSP/1.0\r\n");
}
