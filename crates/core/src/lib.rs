//! # gateway-core — TUN-to-proxy packet forwarding engine
//!
//! Reads raw IPv4 packets from a point-to-point virtual interface, terminates
//! TCP and UDP flows inside the process, re-originates equivalent flows toward
//! either the original destination or an upstream HTTP CONNECT proxy, and
//! injects synthesized reply packets back onto the TUN.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Adapters (FFI / CLI)                     │
//! ├──────────────────────────────────────────┤
//! │  Engine        — public API, orchestrator │
//! │  SessionTable  — five-tuple → session map │
//! ├──────────────────────────────────────────┤
//! │  Reactor       — mio readiness loop       │
//! │  Proxy         — HTTP CONNECT handshake   │
//! ├──────────────────────────────────────────┤
//! │  Packet        — IPv4/TCP/UDP codec       │
//! │  Session       — TCP/UDP state machines   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use gateway_core::Engine;
//!
//! let mut engine = Engine::new();
//! engine.init(0, "", "", 1500).unwrap();
//! engine.start().unwrap();
//! // ... engine runs its reactor on a background thread until stop() ...
//! engine.stop();
//! ```
//!
//! ## Crate layout
//!
//! - [`engine`] — High-level [`Engine`] orchestrator and [`EngineConfig`].
//! - [`session`] — Five-tuple [`session::SessionTable`], [`session::tcp::TcpSession`],
//!   [`session::udp::UdpSession`].
//! - [`packet`] — IPv4/TCP/UDP parse and emit, manual byte-slice codec.
//! - [`reactor`] — Single-threaded `mio` event loop driving the session machines.
//! - [`proxy`] — HTTP CONNECT handshake client.
//! - [`hook`] — Observation and protect-socket callback slots.
//! - [`error`] — [`GatewayError`] enum and [`Result`] alias.

pub mod engine;
pub mod error;
pub mod hook;
pub mod packet;
pub mod proxy;
pub mod reactor;
pub mod session;

pub use engine::{Engine, EngineConfig, LogLevel};
pub use error::{GatewayError, Result};
pub use hook::{Direction, ObservationHook, Protocol, ProtectHook};
