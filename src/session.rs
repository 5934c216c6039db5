//! Session lifecycle: configuration, callbacks, the I/O loop and the public
//! facade.
//!
//! A [`WsSession`] owns one connection at a time. `connect` performs the
//! blocking connect sequence on the caller's thread, then hands the
//! transport to a dedicated I/O thread which is the only reader of the
//! socket. Producers write through the send serialization lock, either
//! directly ([`WsSession::send`]) or via the lock-free queue
//! ([`WsSession::send_async`]) that the I/O thread drains between reads.
//!
//! The I/O loop per iteration:
//!
//! 1. drains the async send queue through the synchronous send path;
//! 2. waits up to 100 ms for readable bytes (or buffered TLS plaintext);
//! 3. feeds the frame decoder and dispatches every completed frame;
//! 4. exits on decode errors, EOF, socket errors, user disconnect or a
//!    heartbeat timeout, then runs the reconnection policy.
//!
//! Reconnection happens inside the same I/O thread: attempt N backs off
//! N x 1 s (interruptible by `disconnect`), re-runs the full connect
//! sequence, and resets the attempt counter once a connection opens. A
//! partially assembled fragmented message never survives a reconnect.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use rand::{rngs::SmallRng, SeedableRng};

use crate::close::CloseCode;
use crate::codec::{self, Decoder};
use crate::frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE};
use crate::handshake::{self, Established};
use crate::heartbeat::{Heartbeat, HeartbeatHooks, PingConfig, PingMode};
use crate::pool::{BufferPool, PooledBuf};
use crate::queue::SendQueue;
use crate::transport::{self, Transport};
use crate::url::WsUrl;
use crate::{ErrorCode, WsError};

/// Readability-wait quantum of the I/O loop.
const READ_QUANTUM: Duration = Duration::from_millis(100);

/// Backoff unit: attempt N sleeps N times this long.
const BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Size of each pooled read buffer.
const READ_BUF_SIZE: usize = 8192;

/// Buffers pre-allocated per session.
const READ_BUF_COUNT: usize = 8;

/// Session configuration.
///
/// `url` is required; everything else defaults to values suited for
/// long-lived streaming feeds. `auto_reconnect` and the heartbeat settings
/// can also be changed at runtime through the session.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// `ws://` or `wss://` URL to connect to.
    pub url: String,
    /// Bound on TCP connect, TLS negotiation and the upgrade exchange.
    pub connect_timeout: Duration,
    /// Largest accepted inbound message in bytes.
    pub max_message_size: usize,
    /// Reconnect automatically after an abnormal connection loss.
    pub auto_reconnect: bool,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Heartbeat settings.
    pub ping: PingConfig,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            ping: PingConfig::default(),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn ping(mut self, ping: PingConfig) -> Self {
        self.ping = ping;
        self
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
    Reconnecting = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Open,
            3 => SessionState::Closing,
            4 => SessionState::Closed,
            5 => SessionState::Reconnecting,
            _ => SessionState::Idle,
        }
    }
}

type Slot<T> = Mutex<Option<Arc<T>>>;

/// One mutex-guarded slot per callback. Dispatch clones the `Arc` out of the
/// slot and invokes it without holding the lock, so replacing a callback
/// mid-dispatch never races: the in-flight invocation keeps the old value
/// alive, subsequent dispatches see the new one.
#[derive(Default)]
struct Callbacks {
    connect: Slot<dyn Fn() + Send + Sync>,
    disconnect: Slot<dyn Fn(CloseCode) + Send + Sync>,
    error: Slot<dyn Fn(ErrorCode, &str) + Send + Sync>,
    raw_message: Slot<dyn Fn(&[u8]) + Send + Sync>,
    message: Slot<dyn Fn(serde_json::Value) + Send + Sync>,
    ping: Slot<dyn Fn(&[u8]) + Send + Sync>,
    pong: Slot<dyn Fn(&[u8]) + Send + Sync>,
}

/// The active connection: transport plus the per-session mask PRNG, both
/// living under the send serialization lock.
struct Conn {
    transport: Transport,
    rng: SmallRng,
}

/// Why one connection attempt's loop ended.
enum Exit {
    /// `disconnect` cleared the running flag.
    Stopped,
    /// The peer completed a close handshake.
    PeerClose(CloseCode),
    /// Transport, protocol or liveness failure; carries the effective code.
    Abnormal(CloseCode),
}

/// Outcome of dispatching one frame.
enum Flow {
    Continue,
    Close(CloseCode),
}

/// Accumulates continuation frames of one fragmented message.
struct FragmentAssembly {
    opcode: OpCode,
    buffer: BytesMut,
}

struct Inner {
    url: WsUrl,
    url_raw: String,
    connect_timeout: Duration,
    max_message_size: usize,
    max_reconnect_attempts: u32,
    auto_reconnect: AtomicBool,

    state: AtomicU8,
    running: AtomicBool,
    connected: AtomicBool,
    disconnect_emitted: AtomicBool,
    reconnect_attempts: AtomicU32,
    pinned_core: AtomicIsize,

    /// Raw fd of the live socket, -1 when none. Read by the poll gate and
    /// the out-of-band shutdown paths without taking the send lock.
    conn_fd: AtomicI32,
    /// Send serialization lock. Writers from any thread; the I/O thread
    /// takes it only briefly for reads, gated by `wait_readable`.
    conn: Mutex<Option<Conn>>,

    queue: SendQueue,
    pool: BufferPool,
    callbacks: Callbacks,
    heartbeat: Heartbeat,

    /// Wakes the backoff sleep when `disconnect` is called.
    lifecycle: Mutex<()>,
    lifecycle_cv: Condvar,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Encodes, masks and writes one frame under the send lock.
    fn send_frame(&self, opcode: OpCode, payload: &[u8]) -> crate::Result<()> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(WsError::Disconnected)?;

        let mut frame = Frame::new(true, opcode, None, payload);
        frame.mask_with(&mut conn.rng);
        debug_assert!(frame.is_masked(), "client frames go out masked");

        let mut wire = BytesMut::with_capacity(MAX_HEAD_SIZE + frame.payload.len());
        codec::encode(&frame, &mut wire);
        conn.transport
            .write_all(&wire)
            .map_err(|err| WsError::SendFailed(err.to_string()))
    }

    fn ensure_connected(&self) -> crate::Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(WsError::Disconnected)
        }
    }

    /// Runs the connect sequence and installs the resulting transport.
    fn establish(&self) -> crate::Result<BytesMut> {
        let Established { transport, residual } =
            handshake::connect(&self.url, self.connect_timeout)?;
        // Backstop so a torn TLS record cannot hold the send lock for long.
        transport
            .set_read_timeout(Some(READ_QUANTUM))
            .map_err(|err| WsError::ConnectionFailed(err.to_string()))?;

        let fd = transport.raw_fd();
        *self.conn.lock() = Some(Conn {
            transport,
            rng: SmallRng::from_entropy(),
        });
        self.conn_fd.store(fd, Ordering::Release);
        Ok(residual)
    }

    fn teardown_transport(&self) {
        self.conn_fd.store(-1, Ordering::Release);
        if let Some(conn) = self.conn.lock().take() {
            conn.transport.shutdown();
        }
    }

    /// Flags the connection as dead after a missed pong deadline. The I/O
    /// thread observes the cleared flag and runs the shared teardown path.
    fn on_ping_timeout(&self) {
        self.emit_error(&WsError::PingTimeout);
        self.connected.store(false, Ordering::Release);
        transport::shutdown_fd(self.conn_fd.load(Ordering::Acquire));
    }

    /// Sleeps up to `duration`, returning early when `disconnect` runs.
    fn sleep_interruptible(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut guard = self.lifecycle.lock();
        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let _ = self.lifecycle_cv.wait_for(&mut guard, deadline - now);
        }
    }

    fn emit_connect(&self) {
        let cb = self.callbacks.connect.lock().clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Emits `on_disconnect` at most once per connection.
    fn emit_disconnect_once(&self, code: CloseCode) {
        if !self.disconnect_emitted.swap(true, Ordering::AcqRel) {
            let cb = self.callbacks.disconnect.lock().clone();
            if let Some(cb) = cb {
                cb(code);
            }
        }
    }

    fn emit_error(&self, err: &WsError) {
        log::debug!("session error: {err}");
        let cb = self.callbacks.error.lock().clone();
        if let Some(cb) = cb {
            cb(err.code(), &err.to_string());
        }
    }

    fn emit_ping(&self, payload: &[u8]) {
        let cb = self.callbacks.ping.lock().clone();
        if let Some(cb) = cb {
            cb(payload);
        }
    }

    fn emit_pong(&self, payload: &[u8]) {
        let cb = self.callbacks.pong.lock().clone();
        if let Some(cb) = cb {
            cb(payload);
        }
    }

    /// Hands a completed message to the raw callback, and to the structured
    /// callback when the payload parses as JSON.
    fn deliver_message(&self, opcode: OpCode, payload: &[u8]) {
        log::trace!("delivering {opcode:?} message of {} bytes", payload.len());
        let raw = self.callbacks.raw_message.lock().clone();
        if let Some(cb) = raw {
            cb(payload);
        }

        let structured = self.callbacks.message.lock().clone();
        if let Some(cb) = structured {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
                cb(value);
            }
        }
    }
}

/// A client WebSocket session.
///
/// The handle is an opaque facade over reference-counted internal state:
/// moving it never disturbs the running I/O or heartbeat threads. Dropping
/// the session disconnects with [`CloseCode::GoingAway`].
///
/// # Example
///
/// ```no_run
/// use wsjet::{WsConfig, WsSession};
///
/// # fn main() -> wsjet::Result<()> {
/// let session = WsSession::new(WsConfig::new("wss://feed.example.com/stream"))?;
/// session.on_raw_message(|bytes| {
///     println!("received {} bytes", bytes.len());
/// });
/// session.connect()?;
/// session.send(r#"{"subscribe":"trades"}"#)?;
/// session.wait();
/// # Ok(())
/// # }
/// ```
pub struct WsSession {
    inner: Arc<Inner>,
}

impl WsSession {
    /// Creates a session from `config`. The URL is parsed eagerly so an
    /// invalid one fails here rather than at connect time.
    pub fn new(config: WsConfig) -> crate::Result<Self> {
        let url = WsUrl::parse(&config.url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                url_raw: config.url,
                connect_timeout: config.connect_timeout,
                max_message_size: config.max_message_size,
                max_reconnect_attempts: config.max_reconnect_attempts,
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                state: AtomicU8::new(SessionState::Idle as u8),
                running: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                disconnect_emitted: AtomicBool::new(true),
                reconnect_attempts: AtomicU32::new(0),
                pinned_core: AtomicIsize::new(-1),
                conn_fd: AtomicI32::new(-1),
                conn: Mutex::new(None),
                queue: SendQueue::new(),
                pool: BufferPool::new(READ_BUF_SIZE, READ_BUF_COUNT),
                callbacks: Callbacks::default(),
                heartbeat: Heartbeat::new(config.ping),
                lifecycle: Mutex::new(()),
                lifecycle_cv: Condvar::new(),
                io_thread: Mutex::new(None),
            }),
        })
    }

    /// Connects, performs the upgrade handshake and starts the I/O and
    /// heartbeat threads. `on_connect` fires after the handshake validates.
    ///
    /// An initial connect failure is returned directly; the automatic
    /// reconnection policy applies to established connections that drop.
    pub fn connect(&self) -> crate::Result<()> {
        let inner = &self.inner;
        if inner.running.load(Ordering::Acquire) {
            return Err(WsError::ConnectionFailed("session already running".to_string()));
        }
        // Reap a previous I/O thread when the session is being reused.
        if let Some(handle) = inner.io_thread.lock().take() {
            let _ = handle.join();
        }

        inner.set_state(SessionState::Connecting);
        let residual = match inner.establish() {
            Ok(residual) => residual,
            Err(err) => {
                inner.set_state(SessionState::Closed);
                inner.emit_error(&err);
                inner.teardown_transport();
                return Err(err);
            }
        };

        inner.disconnect_emitted.store(false, Ordering::Release);
        inner.reconnect_attempts.store(0, Ordering::Release);
        inner.running.store(true, Ordering::Release);
        inner.connected.store(true, Ordering::Release);
        inner.set_state(SessionState::Open);

        let io_inner = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name("wsjet-io".to_string())
            .spawn(move || io_thread_main(io_inner, residual));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                inner.running.store(false, Ordering::Release);
                inner.connected.store(false, Ordering::Release);
                inner.teardown_transport();
                inner.set_state(SessionState::Closed);
                return Err(WsError::ConnectionFailed(format!(
                    "spawning I/O thread: {err}"
                )));
            }
        };
        *inner.io_thread.lock() = Some(handle);

        start_heartbeat(inner);
        log::info!("connected to {}", inner.url_raw);
        inner.emit_connect();
        Ok(())
    }

    /// Closes the connection with `code` and joins the worker threads.
    ///
    /// Idempotent. After this returns no callback will be invoked again.
    pub fn disconnect(&self, code: CloseCode) {
        let inner = &self.inner;
        let was_running = inner.running.swap(false, Ordering::AcqRel);
        inner.heartbeat.stop();

        let was_connected = inner.connected.swap(false, Ordering::AcqRel);
        if was_connected {
            inner.set_state(SessionState::Closing);
            let payload = u16::from(code).to_be_bytes();
            if let Err(err) = inner.send_frame(OpCode::Close, &payload) {
                log::debug!("close frame not sent: {err}");
            }
        }

        inner.lifecycle_cv.notify_all();
        transport::shutdown_fd(inner.conn_fd.load(Ordering::Acquire));

        let handle = inner.io_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        inner.teardown_transport();
        inner.set_state(SessionState::Closed);
        if was_connected || was_running {
            inner.emit_disconnect_once(code);
        }
    }

    /// Whether the connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// The configured URL.
    pub fn url(&self) -> &str {
        &self.inner.url_raw
    }

    /// Blocks until the I/O thread exits (peer close, exhausted
    /// reconnection, or `disconnect` from another thread).
    pub fn wait(&self) {
        let handle = self.inner.io_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Sends a text message, blocking until the transport accepts it.
    pub fn send(&self, text: &str) -> crate::Result<()> {
        self.inner.ensure_connected()?;
        self.inner.send_frame(OpCode::Text, text.as_bytes())
    }

    /// Sends a binary message.
    pub fn send_binary(&self, data: &[u8]) -> crate::Result<()> {
        self.inner.ensure_connected()?;
        self.inner.send_frame(OpCode::Binary, data)
    }

    /// Serializes `value` and sends it as a text message.
    pub fn send_json(&self, value: &serde_json::Value) -> crate::Result<()> {
        self.send(&value.to_string())
    }

    /// Queues a text message for the I/O thread to send.
    ///
    /// Never blocks. Messages from one thread are sent in the order they
    /// were queued; no order is promised across threads.
    pub fn send_async(&self, text: &str) {
        self.inner.queue.push(Bytes::copy_from_slice(text.as_bytes()));
    }

    /// Sends an empty Ping frame.
    pub fn send_ping(&self) -> crate::Result<()> {
        self.send_ping_with(b"")
    }

    /// Sends a Ping frame with `payload` (at most 125 bytes).
    pub fn send_ping_with(&self, payload: &[u8]) -> crate::Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::InvalidFrame("control frame payload over 125 bytes"));
        }
        self.inner.ensure_connected()?;
        self.inner.send_frame(OpCode::Ping, payload)
    }

    /// Sends a Pong frame with `payload` (at most 125 bytes).
    pub fn send_pong(&self, payload: &[u8]) -> crate::Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::InvalidFrame("control frame payload over 125 bytes"));
        }
        self.inner.ensure_connected()?;
        self.inner.send_frame(OpCode::Pong, payload)
    }

    /// Pins the I/O thread to `core`, applied when the thread next starts.
    ///
    /// Returns `false` without touching thread state when the index is not
    /// a valid core on this machine.
    pub fn pin_thread(&self, core: usize) -> bool {
        let valid = core_affinity::get_core_ids()
            .map(|ids| ids.iter().any(|id| id.id == core))
            .unwrap_or(false);
        if valid {
            self.inner.pinned_core.store(core as isize, Ordering::Release);
        }
        valid
    }

    /// Number of CPU cores available for pinning.
    pub fn core_count() -> usize {
        core_affinity::get_core_ids().map(|ids| ids.len()).unwrap_or(1)
    }

    pub fn set_ping_mode(&self, mode: PingMode) {
        self.inner.heartbeat.set_mode(mode);
    }

    pub fn set_ping_interval(&self, interval: Duration) {
        self.inner.heartbeat.set_interval(interval);
    }

    pub fn set_ping_timeout(&self, timeout: Duration) {
        self.inner.heartbeat.set_timeout(timeout);
    }

    pub fn set_ping_text_message(&self, message: impl Into<String>) {
        self.inner.heartbeat.set_text_message(message.into());
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.heartbeat.set_auto_pong(enabled);
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::Release);
    }

    /// Replaces the connect callback.
    pub fn on_connect(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.callbacks.connect.lock() = Some(Arc::new(callback));
    }

    /// Replaces the disconnect callback; receives the effective close code.
    pub fn on_disconnect(&self, callback: impl Fn(CloseCode) + Send + Sync + 'static) {
        *self.inner.callbacks.disconnect.lock() = Some(Arc::new(callback));
    }

    /// Replaces the error callback; receives a numeric code and message.
    pub fn on_error(&self, callback: impl Fn(ErrorCode, &str) + Send + Sync + 'static) {
        *self.inner.callbacks.error.lock() = Some(Arc::new(callback));
    }

    /// Replaces the raw message callback; receives every completed message.
    pub fn on_raw_message(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.inner.callbacks.raw_message.lock() = Some(Arc::new(callback));
    }

    /// Replaces the structured message callback; receives messages whose
    /// payload parses as JSON.
    pub fn on_message(&self, callback: impl Fn(serde_json::Value) + Send + Sync + 'static) {
        *self.inner.callbacks.message.lock() = Some(Arc::new(callback));
    }

    /// Replaces the ping callback; fires after any automatic pong reply.
    pub fn on_ping(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.inner.callbacks.ping.lock() = Some(Arc::new(callback));
    }

    /// Replaces the pong callback.
    pub fn on_pong(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.inner.callbacks.pong.lock() = Some(Arc::new(callback));
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.disconnect(CloseCode::GoingAway);
    }
}

/// Wires the heartbeat hooks with weak back-references so the heartbeat
/// never keeps the session alive.
fn start_heartbeat(inner: &Arc<Inner>) {
    let ping_ref = Arc::downgrade(inner);
    let text_ref = Arc::downgrade(inner);
    let timeout_ref = Arc::downgrade(inner);

    inner.heartbeat.start(HeartbeatHooks {
        send_ping: Box::new(move || {
            ping_ref
                .upgrade()
                .map(|inner| {
                    inner.connected.load(Ordering::Acquire)
                        && inner.send_frame(OpCode::Ping, b"").is_ok()
                })
                .unwrap_or(false)
        }),
        send_text: Box::new(move |text| {
            text_ref
                .upgrade()
                .map(|inner| {
                    inner.connected.load(Ordering::Acquire)
                        && inner.send_frame(OpCode::Text, text.as_bytes()).is_ok()
                })
                .unwrap_or(false)
        }),
        on_timeout: Box::new(move || {
            if let Some(inner) = timeout_ref.upgrade() {
                inner.on_ping_timeout();
            }
        }),
    });
}

/// Entry point of the I/O thread: runs connections and the reconnection
/// policy until the session stops or the policy gives up.
fn io_thread_main(inner: Arc<Inner>, mut residual: BytesMut) {
    let pinned = inner.pinned_core.load(Ordering::Acquire);
    if pinned >= 0 {
        let core = core_affinity::CoreId { id: pinned as usize };
        if core_affinity::set_for_current(core) {
            log::debug!("I/O thread pinned to core {pinned}");
        } else {
            log::warn!("failed to pin I/O thread to core {pinned}");
        }
    }

    let mut staging = inner.pool.acquire();
    loop {
        let exit = run_connection(&inner, &mut staging, std::mem::take(&mut residual));

        inner.heartbeat.stop();
        inner.connected.store(false, Ordering::Release);
        inner.teardown_transport();

        match exit {
            // `disconnect` owns state transitions and the final callback.
            Exit::Stopped => return,
            Exit::PeerClose(code) => {
                inner.set_state(SessionState::Closed);
                inner.emit_disconnect_once(code);
                return;
            }
            Exit::Abnormal(code) => {
                let reconnect_allowed = inner.running.load(Ordering::Acquire)
                    && inner.auto_reconnect.load(Ordering::Acquire);
                if !reconnect_allowed {
                    if inner.running.swap(false, Ordering::AcqRel) {
                        inner.set_state(SessionState::Closed);
                        inner.emit_disconnect_once(code);
                    }
                    return;
                }
                match reconnect(&inner) {
                    Some(early) => {
                        residual = early;
                    }
                    None => {
                        if inner.running.swap(false, Ordering::AcqRel) {
                            inner.set_state(SessionState::Closed);
                            inner.emit_disconnect_once(CloseCode::AbnormalClosure);
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Backs off and re-runs the connect sequence until a connection opens, the
/// attempt budget is spent, or the session stops.
fn reconnect(inner: &Arc<Inner>) -> Option<BytesMut> {
    inner.set_state(SessionState::Reconnecting);
    loop {
        let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt > inner.max_reconnect_attempts {
            log::warn!(
                "giving up on {} after {} reconnect attempts",
                inner.url_raw,
                inner.max_reconnect_attempts
            );
            return None;
        }

        let backoff = BACKOFF_UNIT * attempt;
        log::info!(
            "reconnect attempt {attempt}/{} to {} in {backoff:?}",
            inner.max_reconnect_attempts,
            inner.url_raw
        );
        inner.sleep_interruptible(backoff);
        if !inner.running.load(Ordering::Acquire) {
            return None;
        }

        inner.set_state(SessionState::Connecting);
        match inner.establish() {
            Ok(residual) => {
                // `disconnect` may have raced the connect sequence.
                if !inner.running.load(Ordering::Acquire) {
                    inner.teardown_transport();
                    return None;
                }
                inner.reconnect_attempts.store(0, Ordering::Release);
                inner.disconnect_emitted.store(false, Ordering::Release);
                inner.connected.store(true, Ordering::Release);
                inner.set_state(SessionState::Open);
                start_heartbeat(inner);
                log::info!("reconnected to {}", inner.url_raw);
                inner.emit_connect();
                return Some(residual);
            }
            Err(err) => {
                inner.emit_error(&err);
                inner.teardown_transport();
                inner.set_state(SessionState::Reconnecting);
            }
        }
    }
}

/// Runs one connection until it ends, returning why.
fn run_connection(inner: &Inner, staging: &mut PooledBuf<'_>, mut input: BytesMut) -> Exit {
    let mut decoder = Decoder::new(inner.max_message_size);
    let mut fragment: Option<FragmentAssembly> = None;

    loop {
        if !inner.running.load(Ordering::Acquire) {
            return Exit::Stopped;
        }
        if !inner.connected.load(Ordering::Acquire) {
            // Cleared out-of-band by the heartbeat timeout path.
            return Exit::Abnormal(CloseCode::AbnormalClosure);
        }

        // Drain producer submissions through the synchronous send path.
        while let Some(payload) = inner.queue.pop() {
            if let Err(err) = inner.send_frame(OpCode::Text, &payload) {
                log::warn!("async send dropped: {err}");
                break;
            }
        }

        // Dispatch every frame already buffered.
        loop {
            match decoder.decode(&mut input) {
                Ok(Some(frame)) => match dispatch(inner, frame, &mut fragment) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close(code)) => {
                        inner.set_state(SessionState::Closing);
                        return Exit::PeerClose(code);
                    }
                    Err(err) => return protocol_failure(inner, err),
                },
                Ok(None) => break,
                Err(err) => return protocol_failure(inner, err),
            }
        }

        // Wait for wire bytes unless the TLS session already buffered some.
        let fd = inner.conn_fd.load(Ordering::Acquire);
        if fd < 0 {
            return Exit::Abnormal(CloseCode::AbnormalClosure);
        }
        let pending = match inner.conn.lock().as_mut() {
            Some(conn) => conn.transport.has_pending(),
            None => return Exit::Abnormal(CloseCode::AbnormalClosure),
        };
        if !pending && !transport::wait_readable(fd, READ_QUANTUM) {
            continue;
        }

        let read = match inner.conn.lock().as_mut() {
            Some(conn) => conn.transport.read(&mut staging[..]),
            None => return Exit::Abnormal(CloseCode::AbnormalClosure),
        };
        match read {
            Ok(0) => {
                log::debug!("connection closed by peer");
                return Exit::Abnormal(CloseCode::AbnormalClosure);
            }
            Ok(n) => input.extend_from_slice(&staging[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                inner.emit_error(&WsError::ReceiveFailed(err.to_string()));
                return Exit::Abnormal(CloseCode::AbnormalClosure);
            }
        }
    }
}

/// Maps a protocol violation to its close code, reports it and replies with
/// a best-effort Close frame.
fn protocol_failure(inner: &Inner, err: WsError) -> Exit {
    let code = match &err {
        WsError::MessageTooLarge { .. } => CloseCode::MessageTooBig,
        _ => CloseCode::ProtocolError,
    };
    inner.emit_error(&err);
    let payload = u16::from(code).to_be_bytes();
    if let Err(send_err) = inner.send_frame(OpCode::Close, &payload) {
        log::debug!("close frame not sent: {send_err}");
    }
    Exit::Abnormal(code)
}

/// Applies the per-opcode delivery rules to one decoded frame.
fn dispatch(
    inner: &Inner,
    frame: Frame,
    fragment: &mut Option<FragmentAssembly>,
) -> crate::Result<Flow> {
    match frame.opcode {
        OpCode::Text | OpCode::Binary => {
            if fragment.is_some() {
                return Err(WsError::InvalidFrame(
                    "data frame interleaved with a fragmented message",
                ));
            }
            if frame.fin {
                inner.deliver_message(frame.opcode, &frame.payload);
            } else {
                *fragment = Some(FragmentAssembly {
                    opcode: frame.opcode,
                    buffer: frame.payload,
                });
            }
            Ok(Flow::Continue)
        }
        OpCode::Continuation => {
            let Some(assembly) = fragment.as_mut() else {
                return Err(WsError::InvalidFrame("continuation without a started message"));
            };
            let total = assembly.buffer.len() + frame.payload.len();
            if total > inner.max_message_size {
                return Err(WsError::MessageTooLarge {
                    size: total as u64,
                    limit: inner.max_message_size,
                });
            }
            assembly.buffer.extend_from_slice(&frame.payload);
            if frame.fin {
                let assembly = fragment.take().expect("assembly just appended");
                inner.deliver_message(assembly.opcode, &assembly.buffer);
            }
            Ok(Flow::Continue)
        }
        OpCode::Ping => {
            // The pong goes out before the user sees the ping.
            if inner.heartbeat.auto_pong() {
                if let Err(err) = inner.send_frame(OpCode::Pong, &frame.payload) {
                    log::warn!("auto-pong failed: {err}");
                }
            }
            inner.emit_ping(&frame.payload);
            Ok(Flow::Continue)
        }
        OpCode::Pong => {
            inner.heartbeat.pong_received();
            inner.emit_pong(&frame.payload);
            Ok(Flow::Continue)
        }
        OpCode::Close => {
            let code = frame.close_code();
            let reply = match code {
                Some(code) => u16::from(code).to_be_bytes().to_vec(),
                None => Vec::new(),
            };
            if let Err(err) = inner.send_frame(OpCode::Close, &reply) {
                log::debug!("close reply not sent: {err}");
            }
            Ok(Flow::Close(code.unwrap_or(CloseCode::NoStatusReceived)))
        }
    }
}
