//! Connection establishment: DNS, TCP, TLS and the HTTP upgrade exchange.
//!
//! The sequence follows RFC 6455 Section 4.1 from the client side:
//!
//! 1. resolve the host and connect with `TCP_NODELAY` within the configured
//!    connect timeout;
//! 2. when the URL is `wss://`, wrap the socket in a TLS session (SNI,
//!    hostname verification, TLS 1.2 minimum);
//! 3. send the `GET <path> HTTP/1.1` upgrade request carrying a random
//!    base64-encoded 16-byte `Sec-WebSocket-Key`;
//! 4. read the response head and require a `101` status, an `Upgrade`
//!    header, and the matching `Sec-WebSocket-Accept` value.
//!
//! Any bytes the server sends past the end of the response head are early
//! frames; they are returned to the caller for the frame decoder.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use sha1::{Digest, Sha1};

use crate::transport::{self, Transport};
use crate::url::WsUrl;
use crate::WsError;

/// GUID appended to the key when computing `Sec-WebSocket-Accept`
/// (RFC 6455 Section 1.3).
const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the HTTP response head before the handshake is rejected.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// An established connection: the transport plus any bytes received past the
/// HTTP response head.
pub(crate) struct Established {
    pub(crate) transport: Transport,
    pub(crate) residual: BytesMut,
}

/// Runs the full connect sequence against `url`.
pub(crate) fn connect(url: &WsUrl, connect_timeout: Duration) -> crate::Result<Established> {
    let deadline = Instant::now() + connect_timeout;

    let stream = connect_tcp(url, connect_timeout)?;
    stream
        .set_nodelay(true)
        .map_err(|err| WsError::ConnectionFailed(format!("TCP_NODELAY: {err}")))?;
    // Bound every handshake read by the remaining connect budget.
    stream
        .set_read_timeout(Some(connect_timeout))
        .map_err(|err| WsError::ConnectionFailed(err.to_string()))?;

    let mut transport = if url.secure {
        transport::connect_tls(stream, &url.host)?
    } else {
        Transport::Plain(stream)
    };

    let residual = upgrade(&mut transport, url, deadline)?;
    Ok(Established {
        transport,
        residual,
    })
}

/// Resolves the host and connects to the first reachable address.
fn connect_tcp(url: &WsUrl, timeout: Duration) -> crate::Result<TcpStream> {
    let addrs: Vec<_> = (url.host.as_str(), url.port)
        .to_socket_addrs()
        .map_err(|err| WsError::ConnectionFailed(format!("resolving {}: {err}", url.host)))?
        .collect();
    if addrs.is_empty() {
        return Err(WsError::ConnectionFailed(format!(
            "no addresses for {}",
            url.host
        )));
    }

    let mut last_err = None;
    for addr in addrs {
        log::debug!("connecting to {} ({addr})", url.host);
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                return Err(WsError::Timeout("TCP connect"))
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(WsError::ConnectionFailed(format!(
        "connecting to {}: {}",
        url.host,
        last_err.expect("at least one attempt")
    )))
}

/// Performs the HTTP upgrade over an established transport, returning any
/// bytes that followed the response head.
fn upgrade(
    transport: &mut Transport,
    url: &WsUrl,
    deadline: Instant,
) -> crate::Result<BytesMut> {
    let key = generate_key();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        url.path,
        url.authority(),
        key
    );
    transport
        .write_all(request.as_bytes())
        .map_err(|err| WsError::HandshakeFailed(format!("sending upgrade request: {err}")))?;

    let (head, residual) = read_response_head(transport, deadline)?;
    validate_response(&head, &key)?;

    log::debug!(
        "websocket handshake with {} complete ({} residual bytes)",
        url.authority(),
        residual.len()
    );
    Ok(residual)
}

/// Reads until the `\r\n\r\n` terminator, splitting head from early frames.
fn read_response_head(
    transport: &mut Transport,
    deadline: Instant,
) -> crate::Result<(String, BytesMut)> {
    let mut buf = BytesMut::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(pos) = find_terminator(&buf) {
            let head = buf.split_to(pos + 4);
            let head = String::from_utf8_lossy(&head).into_owned();
            return Ok((head, buf));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(WsError::HandshakeFailed(
                "response head exceeds 8 KiB".to_string(),
            ));
        }
        if Instant::now() >= deadline {
            return Err(WsError::Timeout("handshake response"));
        }

        match transport.read(&mut chunk) {
            Ok(0) => {
                return Err(WsError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ))
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(WsError::Timeout("handshake response"))
            }
            Err(err) => {
                return Err(WsError::HandshakeFailed(format!(
                    "reading response: {err}"
                )))
            }
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Checks the status line, the `Upgrade` header and the accept value.
fn validate_response(head: &str, key: &str) -> crate::Result<()> {
    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap_or_default();
    if !status.contains("101") {
        return Err(WsError::HandshakeFailed(format!(
            "server did not switch protocols: {status}"
        )));
    }

    let mut saw_upgrade = false;
    let mut accept = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("upgrade") {
                saw_upgrade = true;
            } else if name.trim().eq_ignore_ascii_case("sec-websocket-accept") {
                accept = Some(value.trim().to_string());
            }
        }
    }
    if !saw_upgrade {
        return Err(WsError::HandshakeFailed(
            "response is missing the Upgrade header".to_string(),
        ));
    }

    let expected = accept_value(key);
    match accept {
        Some(got) if got == expected => Ok(()),
        Some(got) => Err(WsError::HandshakeFailed(format!(
            "Sec-WebSocket-Accept mismatch: expected {expected}, got {got}"
        ))),
        None => Err(WsError::HandshakeFailed(
            "response is missing Sec-WebSocket-Accept".to_string(),
        )),
    }
}

/// Base64 of 16 random bytes, fresh per attempt.
fn generate_key() -> String {
    use base64::prelude::*;
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Computes the expected `Sec-WebSocket-Accept` for `key`.
pub(crate) fn accept_value(key: &str) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(ACCEPT_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_value_rfc_example() {
        // Key and accept value from RFC 6455 Section 1.3.
        assert_eq!(
            accept_value("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_is_base64_of_16_bytes() {
        use base64::prelude::*;
        let key = generate_key();
        let decoded = BASE64_STANDARD.decode(&key).unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn test_validate_response_accepts_101() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_value(key)
        );
        assert!(validate_response(&head, key).is_ok());
    }

    #[test]
    fn test_validate_response_header_names_case_insensitive() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             UPGRADE: websocket\r\n\
             SEC-WEBSOCKET-ACCEPT: {}\r\n\r\n",
            accept_value(key)
        );
        assert!(validate_response(&head, key).is_ok());
    }

    #[test]
    fn test_validate_response_rejects_non_101() {
        let head = "HTTP/1.1 403 Forbidden\r\n\r\n";
        assert!(matches!(
            validate_response(head, "key"),
            Err(WsError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_validate_response_rejects_missing_upgrade() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_value(key)
        );
        assert!(matches!(
            validate_response(&head, key),
            Err(WsError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_validate_response_rejects_wrong_accept() {
        let head = "HTTP/1.1 101 Switching Protocols\r\n\
                    Upgrade: websocket\r\n\
                    Sec-WebSocket-Accept: bm90IHRoZSByaWdodCBvbmU=\r\n\r\n";
        assert!(matches!(
            validate_response(head, "dGhlIHNhbXBsZSBub25jZQ=="),
            Err(WsError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_find_terminator() {
        assert_eq!(find_terminator(b"HTTP/1.1 101\r\n\r\nframe"), Some(12));
        assert_eq!(find_terminator(b"partial\r\n"), None);
    }
}
