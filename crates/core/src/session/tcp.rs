//! TCP pseudo-termination state machine (spec.md §4.3).

use std::time::Instant;

use mio::net::TcpStream;
use rand::Rng;

use crate::error::GatewayError;
use crate::session::FiveTuple;

/// Reply datagrams use a fixed sequence/acknowledgment pair rather than
/// tracked byte offsets — a deliberate simplification (spec.md §4.3, §9):
/// this engine does not implement RFC-793 sequencing, only enough to
/// traverse a client TCP stack's initial exchange.
pub const REPLY_SEQ: u32 = 1000;
pub const REPLY_ACK: u32 = 2000;

/// Aggregate byte cap on `pending_uplink` across all its entries.
pub const PENDING_UPLINK_MAX_BYTES: usize = 64 * 1024;
/// Entry-count cap on `pending_uplink`.
pub const PENDING_UPLINK_MAX_ENTRIES: usize = 32;

/// TCP session state (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Transient during construction; never observed outside `new`.
    Init,
    /// Outbound socket created, non-blocking `connect` issued.
    Connecting,
    /// Sending the `CONNECT` line to the upstream proxy.
    ProxyConnect,
    /// Awaiting the proxy's response to the `CONNECT` line.
    ProxyResponse,
    /// Byte-stream tunnel; reflecting traffic in both directions.
    Established,
    /// Client sent FIN/RST; draining pending writes before the next reap.
    Closing,
}

/// A single TCP flow's engine-side state, owning its outbound socket.
pub struct TcpSession {
    pub socket: TcpStream,
    pub state: TcpState,
    pub five_tuple: FiveTuple,
    /// `mio` registration token; stored here (rather than only in the
    /// reactor's side table) so deregistration on removal needs no reverse
    /// lookup.
    pub token: mio::Token,
    /// Sequence number observed on the client's SYN; `ack = this + 1` on the
    /// synthesized SYN-ACK.
    pub client_initial_seq: u32,
    /// Randomized initial sequence for the SYN-ACK (spec.md §4.1).
    pub syn_ack_seq: u32,
    /// Whether this flow's target address/proxy decision routes it through
    /// `ProxyConnect`/`ProxyResponse` (dst port 443 with a proxy configured)
    /// rather than straight to `Established`.
    pub via_proxy: bool,
    /// Accumulated bytes read from the proxy while in `ProxyResponse`,
    /// capped at [`crate::proxy::MAX_RESPONSE_BYTES`].
    pub proxy_response_buf: Vec<u8>,
    /// Queued uplink bytes while `state` is `ProxyConnect`/`ProxyResponse`,
    /// flushed in order once `Established` (spec.md §4.3).
    pending_uplink: Vec<Vec<u8>>,
    pending_uplink_bytes: usize,
    pub last_activity: Instant,
    /// True once the SYN-ACK has been emitted to the client, so the reactor
    /// never emits a second one for the same flow.
    pub syn_ack_sent: bool,
}

impl TcpSession {
    pub fn new(
        five_tuple: FiveTuple,
        socket: TcpStream,
        token: mio::Token,
        client_initial_seq: u32,
        via_proxy: bool,
    ) -> Self {
        let syn_ack_seq = rand::rng().random::<u32>();
        tracing::debug!(?five_tuple, client_initial_seq, syn_ack_seq, via_proxy, "TCP session created");
        Self {
            socket,
            state: TcpState::Connecting,
            five_tuple,
            token,
            client_initial_seq,
            syn_ack_seq,
            via_proxy,
            proxy_response_buf: Vec::new(),
            pending_uplink: Vec::new(),
            pending_uplink_bytes: 0,
            last_activity: Instant::now(),
            syn_ack_sent: false,
        }
    }

    pub fn transition(&mut self, new_state: TcpState) {
        tracing::debug!(
            five_tuple = ?self.five_tuple,
            old_state = ?self.state,
            new_state = ?new_state,
            "TCP state transition"
        );
        self.state = new_state;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Append bytes to `pending_uplink`, enforcing the aggregate cap.
    /// Overflow is reported so the caller can destroy the session
    /// (spec.md §4.3: "Overflow closes the session").
    pub fn push_pending_uplink(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        if self.pending_uplink.len() >= PENDING_UPLINK_MAX_ENTRIES
            || self.pending_uplink_bytes + data.len() > PENDING_UPLINK_MAX_BYTES
        {
            return Err(GatewayError::PendingUplinkOverflow);
        }
        self.pending_uplink_bytes += data.len();
        self.pending_uplink.push(data.to_vec());
        Ok(())
    }

    /// Take the buffered uplink entries in arrival order, leaving the buffer
    /// empty. Called on the `ProxyResponse -> Established` transition.
    pub fn drain_pending_uplink(&mut self) -> Vec<Vec<u8>> {
        self.pending_uplink_bytes = 0;
        std::mem::take(&mut self.pending_uplink)
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(five_tuple: FiveTuple) -> Self {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        socket.set_nonblocking(true).unwrap();
        let std_stream: std::net::TcpStream = socket.into();
        Self::new(five_tuple, TcpStream::from_std(std_stream), mio::Token(0), 0, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tuple() -> FiveTuple {
        FiveTuple {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 40001,
            dst_ip: Ipv4Addr::new(93, 184, 216, 34),
            dst_port: 80,
        }
    }

    #[test]
    fn starts_in_connecting() {
        let session = TcpSession::new_for_test(tuple());
        assert_eq!(session.state, TcpState::Connecting);
        assert!(!session.syn_ack_sent);
    }

    #[test]
    fn pending_uplink_drains_in_order() {
        let mut session = TcpSession::new_for_test(tuple());
        session.push_pending_uplink(b"first").unwrap();
        session.push_pending_uplink(b"second").unwrap();
        let drained = session.drain_pending_uplink();
        assert_eq!(drained, vec![b"first".to_vec(), b"second".to_vec()]);
        assert!(session.drain_pending_uplink().is_empty());
    }

    #[test]
    fn pending_uplink_overflow_rejected() {
        let mut session = TcpSession::new_for_test(tuple());
        let chunk = vec![0u8; PENDING_UPLINK_MAX_BYTES];
        session.push_pending_uplink(&chunk).unwrap();
        let result = session.push_pending_uplink(&[1]);
        assert!(result.is_err());
    }

    #[test]
    fn pending_uplink_entry_cap_rejected() {
        let mut session = TcpSession::new_for_test(tuple());
        for _ in 0..PENDING_UPLINK_MAX_ENTRIES {
            session.push_pending_uplink(b"x").unwrap();
        }
        assert!(session.push_pending_uplink(b"x").is_err());
    }

    #[test]
    fn syn_ack_uses_client_seq_plus_one() {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        socket.set_nonblocking(true).unwrap();
        let session = TcpSession::new(
            tuple(),
            TcpStream::from_std(socket.into()),
            mio::Token(1),
            5000,
            false,
        );
        assert_eq!(session.client_initial_seq + 1, 5001);
    }
}
