//! Uniform byte I/O over the active connection.
//!
//! [`Transport`] hides whether bytes travel over a bare TCP socket or a TLS
//! session. Writes go through [`Transport::write_all`], which loops until
//! every byte is accepted or a fatal error is observed. Reads are performed
//! only by the I/O thread, gated by [`wait_readable`] so the send
//! serialization lock is never held while idling on the wire.
//!
//! TLS uses `rustls` with the `webpki-roots` trust anchors, SNI set to the
//! parsed host and hostname verification enabled; the minimum accepted
//! protocol version is TLS 1.2.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, RootCertStore, StreamOwned};

use crate::WsError;

/// Byte stream over the established connection.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Transport {
    fn stream(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(tls) => &tls.sock,
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream().as_raw_fd()
    }

    /// Writes the whole buffer, flushing any TLS records it produced.
    pub(crate) fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.write_all(buf),
            Transport::Tls(tls) => {
                tls.write_all(buf)?;
                tls.flush()
            }
        }
    }

    /// Reads available bytes into `dst`. `Ok(0)` signals EOF.
    pub(crate) fn read(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(dst),
            Transport::Tls(tls) => tls.read(dst),
        }
    }

    /// Whether decrypted bytes are already buffered inside the TLS session.
    ///
    /// A TLS record can decrypt to more plaintext than one read consumes;
    /// those bytes never show up as socket readability, so the I/O loop asks
    /// here before waiting on the fd.
    pub(crate) fn has_pending(&mut self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(tls) => match tls.conn.process_new_packets() {
                Ok(state) => state.plaintext_bytes_to_read() > 0,
                // Let the next read surface the error.
                Err(_) => true,
            },
        }
    }

    /// Bounds how long a blocking read may stall on a partial record.
    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.stream().set_read_timeout(timeout)
    }

    /// Best-effort full shutdown of the underlying socket.
    pub(crate) fn shutdown(&self) {
        let _ = self.stream().shutdown(std::net::Shutdown::Both);
    }
}

/// Waits up to `timeout` for the fd to become readable.
pub(crate) fn wait_readable(fd: RawFd, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
    rc > 0 && (pfd.revents & libc::POLLIN) != 0
}

/// Shuts down a socket by descriptor, without taking the transport lock.
///
/// Used by `disconnect` and the heartbeat timeout path to unblock the I/O
/// thread promptly.
pub(crate) fn shutdown_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
    }
}

/// Builds the client TLS configuration: webpki roots, TLS 1.2 minimum.
fn tls_client_config() -> Arc<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_root_certificates(roots)
    .with_no_client_auth();

    Arc::new(config)
}

/// Wraps a connected socket in a TLS session and completes the handshake.
///
/// SNI is set to `host`; the certificate chain is verified against the
/// webpki roots including hostname verification.
pub(crate) fn connect_tls(stream: TcpStream, host: &str) -> crate::Result<Transport> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| WsError::Tls(format!("invalid server name `{host}`")))?;

    let conn = ClientConnection::new(tls_client_config(), server_name)
        .map_err(|err| WsError::Tls(err.to_string()))?;
    let mut tls = StreamOwned::new(conn, stream);

    // Drive the handshake to completion so certificate and protocol errors
    // surface before the HTTP upgrade is attempted.
    while tls.conn.is_handshaking() {
        tls.conn
            .complete_io(&mut tls.sock)
            .map_err(|err| WsError::Tls(err.to_string()))?;
    }
    log::debug!("TLS session established with {host}");

    Ok(Transport::Tls(Box::new(tls)))
}
