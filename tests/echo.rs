//! End-to-end tests against an in-process WebSocket echo peer.
//!
//! The peer is a minimal server-side implementation over `TcpListener`: it
//! answers the upgrade handshake (including the computed
//! `Sec-WebSocket-Accept`), decodes masked client frames and writes unmasked
//! server frames.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use wsjet::{CloseCode, ErrorCode, PingConfig, PingMode, WsConfig, WsSession};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn accept_value(key: &str) -> String {
    use base64::prelude::*;
    use sha1::{Digest, Sha1};
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Reads the upgrade request and answers with a valid 101 response.
fn server_handshake(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "client closed during handshake");
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf).into_owned();
    let key = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("sec-websocket-key")
                .then(|| value.trim().to_string())
        })
        .expect("missing Sec-WebSocket-Key");

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_value(&key)
    );
    stream.write_all(response.as_bytes()).unwrap();
}

struct PeerFrame {
    fin: bool,
    opcode: u8,
    masked: bool,
    payload: Vec<u8>,
}

/// Decodes one client frame, unmasking the payload.
fn read_frame(stream: &mut TcpStream) -> PeerFrame {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();
    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0F;
    let masked = head[1] & 0x80 != 0;

    let mut len = u64::from(head[1] & 0x7F);
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).unwrap();
        len = u64::from(u16::from_be_bytes(ext));
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).unwrap();
        len = u64::from_be_bytes(ext);
    }

    let mut mask = [0u8; 4];
    if masked {
        stream.read_exact(&mut mask).unwrap();
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).unwrap();
    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }
    PeerFrame {
        fin,
        opcode,
        masked,
        payload,
    }
}

/// Writes one unmasked server frame.
fn write_frame(stream: &mut TcpStream, fin: bool, opcode: u8, payload: &[u8]) {
    try_write_frame(stream, fin, opcode, payload).unwrap();
}

/// Like `write_frame`, for replies that may race the client's teardown.
fn try_write_frame(
    stream: &mut TcpStream,
    fin: bool,
    opcode: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(((fin as u8) << 7) | opcode);
    if payload.len() < 126 {
        frame.push(payload.len() as u8);
    } else if payload.len() <= 65535 {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    stream.write_all(&frame)
}

/// Spawns an echo peer for a single connection. Echoes Text/Binary, answers
/// Ping with Pong, echoes Close and stops.
fn spawn_echo_peer(listener: TcpListener) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        server_handshake(&mut stream);
        loop {
            let frame = read_frame(&mut stream);
            assert!(frame.fin, "client frames are never fragmented");
            assert!(frame.masked, "client frames must be masked");
            match frame.opcode {
                0x1 | 0x2 => write_frame(&mut stream, true, frame.opcode, &frame.payload),
                0x8 => {
                    let _ = try_write_frame(&mut stream, true, 0x8, &frame.payload);
                    break;
                }
                0x9 => write_frame(&mut stream, true, 0xA, &frame.payload),
                _ => {}
            }
        }
    })
}

fn bound_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    (listener, url)
}

fn no_heartbeat() -> PingConfig {
    PingConfig {
        mode: PingMode::Disabled,
        ..PingConfig::default()
    }
}

#[test]
fn test_echo_round_trip() {
    let (listener, url) = bound_listener();
    let peer = spawn_echo_peer(listener);

    let session = WsSession::new(
        WsConfig::new(&url)
            .auto_reconnect(false)
            .ping(no_heartbeat()),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    session.on_raw_message(move |bytes| {
        tx.send(bytes.to_vec()).unwrap();
    });

    session.connect().unwrap();
    assert!(session.is_connected());

    session.send("hello").unwrap();
    let echoed = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(echoed, b"hello");

    session.send_binary(&[0xDE, 0xAD]).unwrap();
    let echoed = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(echoed, vec![0xDE, 0xAD]);

    session.disconnect(CloseCode::Normal);
    assert!(!session.is_connected());
    peer.join().unwrap();
}

#[test]
fn test_json_messages_reach_structured_callback() {
    let (listener, url) = bound_listener();
    let peer = spawn_echo_peer(listener);

    let session = WsSession::new(
        WsConfig::new(&url)
            .auto_reconnect(false)
            .ping(no_heartbeat()),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    session.on_message(move |value| {
        tx.send(value).unwrap();
    });

    session.connect().unwrap();
    session.send(r#"{"px":101.5,"qty":3}"#).unwrap();

    let value = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(value["px"], 101.5);
    assert_eq!(value["qty"], 3);

    session.disconnect(CloseCode::Normal);
    peer.join().unwrap();
}

#[test]
fn test_async_burst_arrives_in_order() {
    let (listener, url) = bound_listener();
    let peer = spawn_echo_peer(listener);

    let session = WsSession::new(
        WsConfig::new(&url)
            .auto_reconnect(false)
            .ping(no_heartbeat()),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    session.on_raw_message(move |bytes| {
        tx.send(String::from_utf8(bytes.to_vec()).unwrap()).unwrap();
    });

    session.connect().unwrap();
    for i in 0..100 {
        session.send_async(&format!("m{i}"));
    }

    for i in 0..100 {
        let message = rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(message, format!("m{i}"));
    }

    session.disconnect(CloseCode::Normal);
    peer.join().unwrap();
}

#[test]
fn test_oversized_message_closes_with_1009() {
    let (listener, url) = bound_listener();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        server_handshake(&mut stream);
        write_frame(&mut stream, true, 0x1, &vec![b'x'; 2048]);
        // Hold the socket open so the client drives the teardown.
        let _ = read_frame(&mut stream);
    });

    let session = WsSession::new(
        WsConfig::new(&url)
            .auto_reconnect(false)
            .max_message_size(1024)
            .ping(no_heartbeat()),
    )
    .unwrap();

    let (err_tx, err_rx) = mpsc::channel();
    session.on_error(move |code, _msg| {
        err_tx.send(code).unwrap();
    });
    let (disc_tx, disc_rx) = mpsc::channel();
    session.on_disconnect(move |code| {
        disc_tx.send(code).unwrap();
    });

    session.connect().unwrap();

    assert_eq!(
        err_rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        ErrorCode::MessageTooLarge
    );
    assert_eq!(
        disc_rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        CloseCode::MessageTooBig
    );
    assert!(!session.is_connected());
}

#[test]
fn test_peer_close_1000_suppresses_reconnect() {
    let (listener, url) = bound_listener();
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_peer = Arc::clone(&accepted);
    thread::spawn(move || loop {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        accepted_peer.fetch_add(1, Ordering::SeqCst);
        server_handshake(&mut stream);
        write_frame(&mut stream, true, 0x8, &1000u16.to_be_bytes());
        let _ = read_frame(&mut stream);
    });

    let session = WsSession::new(
        WsConfig::new(&url)
            .auto_reconnect(true)
            .max_reconnect_attempts(2)
            .ping(no_heartbeat()),
    )
    .unwrap();

    let (disc_tx, disc_rx) = mpsc::channel();
    session.on_disconnect(move |code| {
        disc_tx.send(code).unwrap();
    });

    session.connect().unwrap();
    assert_eq!(
        disc_rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        CloseCode::Normal
    );

    // A clean peer close must not trigger the reconnection policy.
    thread::sleep(Duration::from_millis(1500));
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(!session.is_connected());
}

#[test]
fn test_abrupt_drop_reconnects_then_gives_up() {
    let (listener, url) = bound_listener();
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_peer = Arc::clone(&accepted);
    thread::spawn(move || {
        // Serve exactly one connection, then disappear so every
        // reconnection attempt is refused.
        let (mut stream, _) = listener.accept().unwrap();
        accepted_peer.fetch_add(1, Ordering::SeqCst);
        server_handshake(&mut stream);
        drop(stream);
        drop(listener);
    });

    let session = WsSession::new(
        WsConfig::new(&url)
            .auto_reconnect(true)
            .max_reconnect_attempts(2)
            .ping(no_heartbeat()),
    )
    .unwrap();

    let (err_tx, err_rx) = mpsc::channel();
    session.on_error(move |code, _| {
        err_tx.send(code).unwrap();
    });
    let (disc_tx, disc_rx) = mpsc::channel();
    session.on_disconnect(move |code| {
        disc_tx.send(code).unwrap();
    });

    let started = Instant::now();
    session.connect().unwrap();

    // Backoff is 1 s then 2 s before the policy gives up.
    let code = disc_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(code, CloseCode::AbnormalClosure);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    // Both failed attempts surfaced through the error callback.
    assert_eq!(
        err_rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        ErrorCode::ConnectionFailed
    );
    assert_eq!(
        err_rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        ErrorCode::ConnectionFailed
    );
}

#[test]
fn test_auto_pong_echoes_ping_payload() {
    let (listener, url) = bound_listener();
    let (pong_tx, pong_rx) = mpsc::channel();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        server_handshake(&mut stream);
        write_frame(&mut stream, true, 0x9, b"abc");
        loop {
            let frame = read_frame(&mut stream);
            if frame.opcode == 0xA {
                pong_tx.send(frame.payload).unwrap();
            } else if frame.opcode == 0x8 {
                let _ = try_write_frame(&mut stream, true, 0x8, &frame.payload);
                break;
            }
        }
    });

    let session = WsSession::new(
        WsConfig::new(&url)
            .auto_reconnect(false)
            .ping(no_heartbeat()),
    )
    .unwrap();

    let (ping_tx, ping_rx) = mpsc::channel();
    session.on_ping(move |payload| {
        ping_tx.send(payload.to_vec()).unwrap();
    });

    session.connect().unwrap();

    assert_eq!(pong_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"abc");
    assert_eq!(ping_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"abc");

    session.disconnect(CloseCode::Normal);
}

#[test]
fn test_heartbeat_receives_pongs() {
    let (listener, url) = bound_listener();
    let peer = spawn_echo_peer(listener);

    let session = WsSession::new(WsConfig::new(&url).auto_reconnect(false).ping(PingConfig {
        mode: PingMode::ControlPing,
        interval: Duration::from_millis(100),
        timeout: Duration::from_secs(5),
        ..PingConfig::default()
    }))
    .unwrap();

    let (pong_tx, pong_rx) = mpsc::channel();
    session.on_pong(move |payload| {
        pong_tx.send(payload.to_vec()).unwrap();
    });

    session.connect().unwrap();
    assert_eq!(
        pong_rx.recv_timeout(Duration::from_secs(3)).unwrap(),
        Vec::<u8>::new()
    );

    session.disconnect(CloseCode::Normal);
    peer.join().unwrap();
}

#[test]
fn test_ping_timeout_tears_down() {
    let (listener, url) = bound_listener();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        server_handshake(&mut stream);
        // Swallow everything, never answer a ping.
        loop {
            let mut sink = [0u8; 1024];
            match stream.read(&mut sink) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    });

    let session = WsSession::new(WsConfig::new(&url).auto_reconnect(false).ping(PingConfig {
        mode: PingMode::ControlPing,
        interval: Duration::from_millis(200),
        timeout: Duration::from_millis(500),
        ..PingConfig::default()
    }))
    .unwrap();

    let (err_tx, err_rx) = mpsc::channel();
    session.on_error(move |code, _| {
        err_tx.send(code).unwrap();
    });
    let (disc_tx, disc_rx) = mpsc::channel();
    session.on_disconnect(move |code| {
        disc_tx.send(code).unwrap();
    });

    session.connect().unwrap();

    assert_eq!(
        err_rx.recv_timeout(Duration::from_secs(3)).unwrap(),
        ErrorCode::PingTimeout
    );
    assert_eq!(
        disc_rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        CloseCode::AbnormalClosure
    );
    assert!(!session.is_connected());
}

#[test]
fn test_fragmented_message_reassembled() {
    let (listener, url) = bound_listener();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        server_handshake(&mut stream);
        write_frame(&mut stream, false, 0x1, b"hel");
        // Control frames may interleave with a fragmented message.
        write_frame(&mut stream, true, 0x9, b"mid");
        write_frame(&mut stream, false, 0x0, b"lo");
        write_frame(&mut stream, true, 0x0, b"!");
        loop {
            let frame = read_frame(&mut stream);
            if frame.opcode == 0x8 {
                let _ = try_write_frame(&mut stream, true, 0x8, &frame.payload);
                return;
            }
        }
    });

    let session = WsSession::new(
        WsConfig::new(&url)
            .auto_reconnect(false)
            .ping(no_heartbeat()),
    )
    .unwrap();

    let (msg_tx, msg_rx) = mpsc::channel();
    session.on_raw_message(move |bytes| {
        msg_tx.send(bytes.to_vec()).unwrap();
    });
    let (ping_tx, ping_rx) = mpsc::channel();
    session.on_ping(move |payload| {
        ping_tx.send(payload.to_vec()).unwrap();
    });

    session.connect().unwrap();

    assert_eq!(ping_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"mid");
    assert_eq!(msg_rx.recv_timeout(RECV_TIMEOUT).unwrap(), b"hello!");

    session.disconnect(CloseCode::Normal);
}

#[test]
fn test_disconnect_sends_close_frame() {
    let (listener, url) = bound_listener();
    let (close_tx, close_rx) = mpsc::channel();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        server_handshake(&mut stream);
        loop {
            let frame = read_frame(&mut stream);
            if frame.opcode == 0x8 {
                let code = u16::from_be_bytes(frame.payload[..2].try_into().unwrap());
                close_tx.send(code).unwrap();
                return;
            }
        }
    });

    let session = WsSession::new(
        WsConfig::new(&url)
            .auto_reconnect(false)
            .ping(no_heartbeat()),
    )
    .unwrap();
    session.connect().unwrap();
    assert!(session.is_connected());

    session.disconnect(CloseCode::Normal);
    assert!(!session.is_connected());
    assert_eq!(close_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 1000);
}
