//! Control surface (spec.md §4.8, §6).
//!
//! Encapsulates all engine state in one instance — running flag, config,
//! session table, hook slots — rather than process-wide statics, so multiple
//! concurrent VPNs can run in-process and tests stay isolable (spec.md §9
//! "global state" redesign flag).

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::error::{GatewayError, Result};
use crate::hook::{HookSlots, ObservationHook, ProtectHook};
use crate::proxy;
use crate::reactor::{Reactor, ReactorConfig};
use crate::session::SessionTable;

/// Log verbosity levels accepted by `set_log_level` (spec.md §4.8, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
}

impl LogLevel {
    /// Maps the ABI's `0..2` integer onto a variant; `None` for anything else.
    pub fn from_i32(level: i32) -> Option<Self> {
        match level {
            0 => Some(Self::Debug),
            1 => Some(Self::Info),
            2 => Some(Self::Warn),
            _ => None,
        }
    }

    fn as_filter(self) -> tracing::level_filters::LevelFilter {
        match self {
            LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
            LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
            LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
        }
    }
}

/// Parameters stored by `init` (spec.md §4.8, §6).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tun_fd: RawFd,
    /// Empty means direct; otherwise `host:port`, used only for TCP
    /// destinations on port 443 (spec.md §6).
    pub proxy: String,
    /// Reserved; the core does not currently interpret it (spec.md §6).
    pub dns: String,
    pub mtu: u16,
}

/// Handle a host installs after setting up the process's global tracing
/// subscriber, so `set_log_level` can retune verbosity at runtime. Optional —
/// without one, `set_log_level` still records the level but has nothing to
/// reload.
pub type LogReloadHandle = tracing_subscriber::reload::Handle<
    tracing::level_filters::LevelFilter,
    tracing_subscriber::Registry,
>;

/// The packet-forwarding engine's control surface (spec.md §4.8).
pub struct Engine {
    config: Option<EngineConfig>,
    running: Arc<AtomicBool>,
    table: Arc<SessionTable>,
    hooks: Arc<HookSlots>,
    thread: Option<JoinHandle<()>>,
    log_reload: Option<LogReloadHandle>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            config: None,
            running: Arc::new(AtomicBool::new(false)),
            table: Arc::new(SessionTable::new()),
            hooks: Arc::new(HookSlots::new()),
            thread: None,
            log_reload: None,
        }
    }

    /// Install the dynamic log-level reload handle. Call after installing
    /// the process's global subscriber (the CLI does this in `main`).
    pub fn install_log_reload(&mut self, handle: LogReloadHandle) {
        self.log_reload = Some(handle);
    }

    /// Store the engine's parameters. Always succeeds; the `Result` return
    /// matches the ABI table (spec.md §6) and leaves room for future
    /// validation (e.g. rejecting a malformed proxy string outright).
    pub fn init(&mut self, tun_fd: RawFd, proxy: &str, dns: &str, mtu: u16) -> Result<()> {
        tracing::info!(tun_fd, proxy, dns, mtu, "engine initialized");
        self.config = Some(EngineConfig {
            tun_fd,
            proxy: proxy.to_string(),
            dns: dns.to_string(),
            mtu,
        });
        Ok(())
    }

    /// Spawn the reactor thread. A no-op if already running (spec.md §4.8:
    /// "repeated start without intervening stop is a no-op after the
    /// first"). Fails with [`GatewayError::NotStarted`] if `init` was never
    /// called.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let config = self.config.as_ref().ok_or(GatewayError::NotStarted)?;
        let proxy = if config.proxy.is_empty() {
            None
        } else {
            proxy::parse_proxy_endpoint(&config.proxy)
        };
        let reactor_config = ReactorConfig {
            tun_fd: config.tun_fd,
            mtu: config.mtu,
            proxy,
        };
        let mut reactor = Reactor::new(reactor_config)?;

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let table = self.table.clone();
        let hooks = self.hooks.clone();

        tracing::info!("engine starting reactor");
        self.thread = Some(std::thread::spawn(move || {
            if let Err(e) = reactor.run(&running, &table, &hooks) {
                tracing::error!(error = %e, "reactor exited with error");
            }
            running.store(false, Ordering::Release);
        }));
        Ok(())
    }

    /// Clear the running flag and join the reactor thread. The reactor
    /// closes every session socket and clears the table before its `run`
    /// returns (spec.md §4.5, §5).
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        tracing::info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_log_level(&self, level: LogLevel) {
        if let Some(handle) = &self.log_reload {
            let _ = handle.modify(|filter| *filter = level.as_filter());
        }
        tracing::info!(?level, "log level changed");
    }

    /// An opaque version string (spec.md §4.8).
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn register_callback(&self, sink: ObservationHook) {
        self.hooks.set_observation(sink);
    }

    pub fn install_protect_callback(&self, protect: ProtectHook) {
        self.hooks.set_protect(protect);
    }

    /// Exposed for tests and the CLI's loopback harness; not part of the
    /// spec.md ABI.
    pub fn session_table(&self) -> &Arc<SessionTable> {
        &self.table
    }
}
