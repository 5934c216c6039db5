//! Liveness pings with a pong-deadline watchdog.
//!
//! When enabled, a dedicated worker wakes every `interval` and runs one
//! cycle: if a previous ping is still unanswered past `timeout`, the timeout
//! hook fires (the session maps it to a fatal close); otherwise a ping is
//! sent in the configured flavor, either a real Ping control frame or an
//! application-level text message for servers that expect one.
//!
//! The worker sleeps on a condition variable, so `stop` and interval changes
//! take effect promptly instead of after a full interval. Pong arrivals are
//! reported from the I/O thread through [`Heartbeat::pong_received`] and
//! observed by the worker via a shared flag.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How liveness pings are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMode {
    /// No automatic pings.
    Disabled,
    /// WebSocket Ping control frames (opcode 0x9).
    ControlPing,
    /// A configurable text message; some feeds implement liveness at the
    /// application layer instead of the protocol layer.
    TextPing,
}

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct PingConfig {
    pub mode: PingMode,
    /// Delay between ping cycles.
    pub interval: Duration,
    /// How long an unanswered ping may stay outstanding.
    pub timeout: Duration,
    /// Payload used by [`PingMode::TextPing`].
    pub text_message: String,
    /// Reply to inbound Pings with a matching Pong automatically.
    pub auto_pong: bool,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            mode: PingMode::ControlPing,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            text_message: "ping".to_string(),
            auto_pong: true,
        }
    }
}

/// Send and failure hooks handed to the worker.
///
/// The hooks are plain boxed closures capturing a weak session reference, so
/// the heartbeat never extends the session's lifetime.
pub(crate) struct HeartbeatHooks {
    /// Sends a Ping control frame; returns whether the write succeeded.
    pub(crate) send_ping: Box<dyn Fn() -> bool + Send + Sync>,
    /// Sends the text-mode ping message.
    pub(crate) send_text: Box<dyn Fn(&str) -> bool + Send + Sync>,
    /// Invoked when a pong misses its deadline.
    pub(crate) on_timeout: Box<dyn Fn() + Send + Sync>,
}

struct State {
    config: PingConfig,
    running: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
    /// Set after a ping goes out, cleared by the matching pong.
    awaiting_pong: AtomicBool,
    last_ping: Mutex<Option<Instant>>,
    last_pong: Mutex<Option<Instant>>,
}

/// The heartbeat engine. One per session; started on connect and stopped on
/// every teardown.
pub(crate) struct Heartbeat {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub(crate) fn new(config: PingConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    config,
                    running: false,
                }),
                cv: Condvar::new(),
                awaiting_pong: AtomicBool::new(false),
                last_ping: Mutex::new(None),
                last_pong: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the worker unless the mode is `Disabled` or it already runs.
    pub(crate) fn start(&self, hooks: HeartbeatHooks) {
        {
            let mut state = self.shared.state.lock();
            if state.running || state.config.mode == PingMode::Disabled {
                return;
            }
            state.running = true;
        }
        self.shared.awaiting_pong.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("wsjet-heartbeat".to_string())
            .spawn(move || worker_loop(shared, hooks))
            .expect("spawning heartbeat thread");
        *self.worker.lock() = Some(handle);
    }

    /// Stops the worker and joins it. Idempotent.
    pub(crate) fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.shared.cv.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Called by the I/O thread whenever a Pong arrives.
    pub(crate) fn pong_received(&self) {
        self.shared.awaiting_pong.store(false, Ordering::Release);
        *self.shared.last_pong.lock() = Some(Instant::now());
    }

    /// Snapshot of the current configuration.
    pub(crate) fn config(&self) -> PingConfig {
        self.shared.state.lock().config.clone()
    }

    pub(crate) fn auto_pong(&self) -> bool {
        self.shared.state.lock().config.auto_pong
    }

    /// Changes the mode; `Disabled` stops the worker. Enabling a mode while
    /// stopped takes effect on the next connect.
    pub(crate) fn set_mode(&self, mode: PingMode) {
        self.shared.state.lock().config.mode = mode;
        if mode == PingMode::Disabled {
            self.stop();
        }
    }

    /// Changes the interval; wakes the worker so it applies immediately.
    pub(crate) fn set_interval(&self, interval: Duration) {
        self.shared.state.lock().config.interval = interval;
        self.shared.cv.notify_all();
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        self.shared.state.lock().config.timeout = timeout;
    }

    pub(crate) fn set_text_message(&self, message: String) {
        self.shared.state.lock().config.text_message = message;
    }

    pub(crate) fn set_auto_pong(&self, enabled: bool) {
        self.shared.state.lock().config.auto_pong = enabled;
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>, hooks: HeartbeatHooks) {
    loop {
        let (mode, interval, timeout, text) = {
            let state = shared.state.lock();
            if !state.running {
                break;
            }
            (
                state.config.mode,
                state.config.interval,
                state.config.timeout,
                state.config.text_message.clone(),
            )
        };

        // Sleep for one interval; stop and interval changes wake us early.
        {
            let mut state = shared.state.lock();
            if state.running {
                let _ = shared.cv.wait_for(&mut state, interval);
            }
            if !state.running {
                break;
            }
        }

        // An unanswered ping past its deadline is a dead connection.
        if shared.awaiting_pong.load(Ordering::Acquire) {
            let last_ping = *shared.last_ping.lock();
            let overdue = last_ping.is_some_and(|sent| sent.elapsed() > timeout);
            if overdue {
                log::warn!("pong overdue past {timeout:?}, flagging connection");
                (hooks.on_timeout)();
                shared.awaiting_pong.store(false, Ordering::Release);
                continue;
            }
        }

        let sent = match mode {
            PingMode::Disabled => false,
            PingMode::ControlPing => (hooks.send_ping)(),
            PingMode::TextPing => (hooks.send_text)(&text),
        };
        if sent {
            *shared.last_ping.lock() = Some(Instant::now());
            shared.awaiting_pong.store(true, Ordering::Release);
        }
    }
}
