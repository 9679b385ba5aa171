//! Five-tuple keyed session table.
//!
//! Sessions are owned exclusively by this table; removing one closes its
//! socket (`Drop` on the underlying `mio` socket types does this for free).

pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use parking_lot::Mutex;

pub use tcp::TcpSession;
pub use udp::UdpSession;

/// TCP idle timeout (spec.md §3): 60 seconds since last I/O.
pub const TCP_TTL: std::time::Duration = std::time::Duration::from_secs(60);
/// UDP idle timeout (spec.md §3): 30 seconds since last I/O.
pub const UDP_TTL: std::time::Duration = std::time::Duration::from_secs(30);

/// (src_ip, src_port, dst_ip, dst_port) identity of a transport flow.
///
/// TCP and UDP sessions live in separate maps (see [`SessionTable`]), so
/// protocol never needs folding into this key the way the reference's hashed
/// 64-bit key stole a high bit for it. `Hash + Eq` is derived on the actual
/// tuple fields, so no two distinct flows can ever collide the way an XORed
/// hash could.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

/// Which map a [`FiveTuple`] lives in. The reactor keeps a
/// `Token -> (FiveTuple, SessionKind)` side table so a readiness event can be
/// routed back to its handler without the key itself carrying a type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Tcp,
    Udp,
}

struct Inner {
    tcp: HashMap<FiveTuple, TcpSession>,
    udp: HashMap<FiveTuple, UdpSession>,
}

/// Maps five-tuples to TCP or UDP sessions behind a single mutex.
///
/// All operations serialize through this one lock; critical sections cover
/// only map lookup/mutation — the reactor never holds this lock while doing
/// socket I/O (spec.md §3 invariant 5).
pub struct SessionTable {
    inner: Mutex<Inner>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tcp: HashMap::new(),
                udp: HashMap::new(),
            }),
        }
    }

    /// Insert a TCP session, closing and replacing any prior session on the
    /// same tuple (spec.md §3: a second SYN on an existing tuple closes and
    /// replaces the prior session). The reactor is expected to have already
    /// called [`SessionTable::remove_tcp`] and deregistered the displaced
    /// session's reactor token before calling this — the in-place replace
    /// below is a defensive fallback so a stale entry is never leaked even
    /// if a future caller skips that step.
    pub fn insert_tcp(&self, key: FiveTuple, session: TcpSession) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.tcp.insert(key, session) {
            tracing::debug!(?key, "replacing existing TCP session for tuple");
            drop(old);
        }
    }

    pub fn insert_udp(&self, key: FiveTuple, session: UdpSession) {
        self.inner.lock().udp.insert(key, session);
    }

    pub fn with_tcp_mut<R>(&self, key: &FiveTuple, f: impl FnOnce(&mut TcpSession) -> R) -> Option<R> {
        self.inner.lock().tcp.get_mut(key).map(f)
    }

    pub fn with_udp_mut<R>(&self, key: &FiveTuple, f: impl FnOnce(&mut UdpSession) -> R) -> Option<R> {
        self.inner.lock().udp.get_mut(key).map(f)
    }

    pub fn contains_tcp(&self, key: &FiveTuple) -> bool {
        self.inner.lock().tcp.contains_key(key)
    }

    pub fn remove_tcp(&self, key: &FiveTuple) -> Option<TcpSession> {
        self.inner.lock().tcp.remove(key)
    }

    pub fn remove_udp(&self, key: &FiveTuple) -> Option<UdpSession> {
        self.inner.lock().udp.remove(key)
    }

    /// Remove and return every TCP session whose `last_activity` is older
    /// than [`TCP_TTL`].
    pub fn reap_expired_tcp(&self, now: Instant) -> Vec<(FiveTuple, TcpSession)> {
        let mut inner = self.inner.lock();
        let expired: Vec<FiveTuple> = inner
            .tcp
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) > TCP_TTL)
            .map(|(k, _)| *k)
            .collect();
        expired
            .into_iter()
            .filter_map(|k| inner.tcp.remove(&k).map(|s| (k, s)))
            .collect()
    }

    /// Remove and return every UDP session whose `last_activity` is older
    /// than [`UDP_TTL`].
    pub fn reap_expired_udp(&self, now: Instant) -> Vec<(FiveTuple, UdpSession)> {
        let mut inner = self.inner.lock();
        let expired: Vec<FiveTuple> = inner
            .udp
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) > UDP_TTL)
            .map(|(k, _)| *k)
            .collect();
        expired
            .into_iter()
            .filter_map(|k| inner.udp.remove(&k).map(|s| (k, s)))
            .collect()
    }

    /// Close every session and clear the table. Used on global shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.tcp.clear();
        inner.udp.clear();
    }

    pub fn tcp_len(&self) -> usize {
        self.inner.lock().tcp.len()
    }

    pub fn udp_len(&self) -> usize {
        self.inner.lock().udp.len()
    }
}
