//! Observation and protect-socket callback slots (spec.md §4.7, §6).
//!
//! Both slots are published once during initialization and read without
//! locking contention thereafter — the same single-assignment pattern
//! `Mount`'s subscriber list uses, just narrowed to a single slot instead of
//! a list.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::RwLock;

/// Flow direction for an observation callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> network.
    Uplink,
    /// network -> client.
    Downlink,
}

/// Transport protocol carried in an observation callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Per-callback payload cap (spec.md §4.7) — callers must tolerate
/// truncation beyond this.
pub const OBSERVATION_PAYLOAD_CAP: usize = 4096;

/// Directional payload callback, invoked from the reactor thread. Must not
/// block; the external collaborator is responsible for handing off work.
pub type ObservationHook =
    Arc<dyn Fn(Direction, Protocol, Ipv4Addr, u16, Ipv4Addr, u16, &[u8]) + Send + Sync>;

/// Exempts an outbound socket from the VPN's own route. Must be invoked
/// after `socket()` and before `connect()` on every outbound socket
/// (spec.md §9 — protect callback races).
pub type ProtectHook = Arc<dyn Fn(RawFd) -> bool + Send + Sync>;

/// Holds the two optional callback slots the control surface publishes.
#[derive(Default)]
pub struct HookSlots {
    observation: RwLock<Option<ObservationHook>>,
    protect: RwLock<Option<ProtectHook>>,
}

impl HookSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_observation(&self, hook: ObservationHook) {
        *self.observation.write() = Some(hook);
    }

    pub fn set_protect(&self, hook: ProtectHook) {
        *self.protect.write() = Some(hook);
    }

    /// Invoke the observation hook if one is installed, truncating the
    /// payload to [`OBSERVATION_PAYLOAD_CAP`] bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &self,
        direction: Direction,
        protocol: Protocol,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) {
        let guard = self.observation.read();
        if let Some(hook) = guard.as_ref() {
            let truncated = &payload[..payload.len().min(OBSERVATION_PAYLOAD_CAP)];
            hook(direction, protocol, src_ip, src_port, dst_ip, dst_port, truncated);
        }
    }

    /// Invoke the protect callback on `fd` if one is installed. Returns
    /// `true` if no callback is installed (nothing to protect against on
    /// this platform/deployment) or if the callback reports success.
    pub fn protect(&self, fd: RawFd) -> bool {
        let guard = self.protect.read();
        match guard.as_ref() {
            Some(hook) => hook(fd),
            None => true,
        }
    }
}
