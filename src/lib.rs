//! # wsjet
//!
//! A thread-based WebSocket client runtime (RFC 6455) for high-throughput,
//! long-lived streaming connections: market data feeds, event buses,
//! telemetry streams.
//!
//! ## Overview
//!
//! A [`WsSession`] opens a TLS or plaintext connection, performs the HTTP
//! upgrade handshake and then exchanges masked WebSocket frames. One I/O
//! thread per session owns the socket for reading and drains an unbounded
//! lock-free queue of asynchronous submissions; any number of producer
//! threads may also send synchronously under the send serialization lock. A
//! heartbeat worker keeps the connection alive with periodic pings and tears
//! it down when a pong misses its deadline, and an abnormal connection loss
//! triggers automatic reconnection with linear backoff.
//!
//! ```no_run
//! use wsjet::{WsConfig, WsSession};
//!
//! # fn main() -> wsjet::Result<()> {
//! let session = WsSession::new(WsConfig::new("wss://echo.example.com/"))?;
//! session.on_raw_message(|bytes| {
//!     println!("<- {}", String::from_utf8_lossy(bytes));
//! });
//! session.on_disconnect(|code| {
//!     println!("closed with {code}");
//! });
//! session.connect()?;
//! session.send("hello")?;
//! session.wait();
//! # Ok(())
//! # }
//! ```
//!
//! ## Module map
//!
//! - [`frame`] / [`codec`]: the wire-level frame types and the incremental
//!   parser and serializer.
//! - [`close`]: RFC 6455 close status codes.
//! - [`url`]: `ws[s]://` URL parsing.
//! - [`heartbeat`]: ping scheduling and the pong watchdog.
//! - [`pool`] / [`queue`]: the buffer pool and the multi-producer send
//!   queue backing the I/O loop.
//! - [`session`]: configuration, callbacks and the [`WsSession`] facade.

pub mod close;
pub mod codec;
pub mod frame;
pub mod heartbeat;
pub mod pool;
pub mod queue;
pub mod session;
pub mod url;

mod handshake;
mod mask;
mod transport;

use thiserror::Error;

pub use close::CloseCode;
pub use frame::{Frame, OpCode};
pub use heartbeat::{PingConfig, PingMode};
pub use session::{SessionState, WsConfig, WsSession};
pub use url::WsUrl;

/// A result type for WebSocket operations, using [`WsError`] as the error
/// type.
pub type Result<T> = std::result::Result<T, WsError>;

/// Errors surfaced by the runtime.
///
/// Setup errors (`InvalidUrl` through `Timeout`) prevent a connection from
/// reaching the open state. Transport errors (`SendFailed`,
/// `ReceiveFailed`) tear an open connection down and may trigger
/// reconnection. Protocol errors (`InvalidFrame`, `InvalidOpCode`,
/// `MessageTooLarge`) tear down with close code 1002 or 1009. `PingTimeout`
/// is a liveness failure detected by the heartbeat watchdog.
///
/// Each error maps to a stable numeric [`ErrorCode`] via [`WsError::code`],
/// which is what the error callback receives.
#[derive(Error, Debug)]
pub enum WsError {
    /// The URL is not a valid `ws://` or `wss://` URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// DNS resolution or the TCP connect failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS negotiation or certificate verification failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// The HTTP upgrade exchange was rejected or malformed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A step exceeded its configured deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A frame could not be written to the transport.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The transport failed while reading.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame violated the protocol (fragmented or oversized control
    /// frame, bad continuation sequence).
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// A frame carried a reserved opcode.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// An inbound message exceeded the configured size limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: u64, limit: usize },

    /// No pong arrived within the heartbeat deadline.
    #[error("pong not received within the configured deadline")]
    PingTimeout,

    /// The operation needs an open connection.
    #[error("connection is closed")]
    Disconnected,
}

impl WsError {
    /// The stable numeric code surfaced through the error callback.
    pub fn code(&self) -> ErrorCode {
        match self {
            WsError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            WsError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            WsError::Tls(_) => ErrorCode::TlsError,
            WsError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,
            WsError::Timeout(_) => ErrorCode::Timeout,
            WsError::SendFailed(_) => ErrorCode::SendFailed,
            WsError::ReceiveFailed(_) => ErrorCode::ReceiveFailed,
            WsError::InvalidFrame(_) | WsError::InvalidOpCode(_) => ErrorCode::InvalidFrame,
            WsError::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            WsError::PingTimeout => ErrorCode::PingTimeout,
            WsError::Disconnected => ErrorCode::Disconnected,
        }
    }
}

/// Numeric error categories delivered to the error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    ConnectionFailed = 1001,
    HandshakeFailed = 1002,
    Timeout = 1003,
    InvalidUrl = 1004,
    TlsError = 1005,
    SendFailed = 1006,
    ReceiveFailed = 1007,
    MessageTooLarge = 1008,
    InvalidFrame = 1009,
    PingTimeout = 1010,
    Disconnected = 1011,
}

impl ErrorCode {
    /// The numeric value of the code.
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}
