//! Error types for the packet forwarding engine.

use std::fmt;

/// Errors that can occur across the engine.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io) — socket/reactor failures.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound).
/// - **Proxy**: [`ProxyHandshakeFailed`](Self::ProxyHandshakeFailed).
/// - **Control surface**: [`NotStarted`](Self::NotStarted).
/// - **Packet codec**: [`MalformedPacket`](Self::MalformedPacket).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given five-tuple exists in the session table.
    #[error("session not found")]
    SessionNotFound,

    /// The upstream proxy did not respond with a success status during the
    /// CONNECT handshake, or the response exceeded the 511-byte cap before a
    /// status line appeared.
    #[error("proxy handshake failed: {0}")]
    ProxyHandshakeFailed(String),

    /// [`Engine::start`](crate::Engine::start) was called before [`Engine::init`](crate::Engine::init).
    #[error("engine not started")]
    NotStarted,

    /// Failed to parse an inbound packet.
    #[error("malformed packet: {kind}")]
    MalformedPacket { kind: ParseErrorKind },

    /// `pending_uplink` exceeded its aggregate byte or entry cap while the
    /// session was mid proxy-handshake.
    #[error("pending uplink buffer overflowed")]
    PendingUplinkOverflow,
}

/// Specific kind of packet parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Fewer than 20 bytes, or IHL < 5, or total-length < IHL*4.
    TruncatedIpv4,
    /// IP version field was not 4.
    NotIpv4,
    /// `IP_PROTO` was neither TCP (6) nor UDP (17).
    UnsupportedProtocol(u8),
    /// TCP data offset * 4 exceeded the segment length.
    TruncatedTcp,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedIpv4 => write!(f, "truncated or malformed IPv4 header"),
            Self::NotIpv4 => write!(f, "not an IPv4 packet"),
            Self::UnsupportedProtocol(p) => write!(f, "unsupported IP protocol {p}"),
            Self::TruncatedTcp => write!(f, "TCP data offset exceeds segment length"),
        }
    }
}

/// Convenience alias for `Result<T, GatewayError>`.
pub type Result<T> = std::result::Result<T, GatewayError>;
