//! HTTP CONNECT proxy-handshake client (spec.md §4.6).
//!
//! No authentication, no header parsing beyond a substring check — this is
//! the deliberately simplified handshake spec.md §9 calls out as a known
//! weak point ("implementers should verify the status line begins with
//! `HTTP/1.x 200`"); that stricter parse is left as future work, not
//! implemented here, since the spec treats substring matching as the
//! intended (if imperfect) behavior of this engine.

use std::net::Ipv4Addr;

/// Responses larger than this before a status line is seen are treated as
/// failure (spec.md §4.6).
pub const MAX_RESPONSE_BYTES: usize = 511;

/// Build the literal `CONNECT <ip>:<port> HTTP/1.1\r\n\r\n` request line.
pub fn connect_request(dst_ip: Ipv4Addr, dst_port: u16) -> Vec<u8> {
    format!("CONNECT {dst_ip}:{dst_port} HTTP/1.1\r\n\r\n").into_bytes()
}

/// Declare success if the accumulated response contains the substring
/// `"200"`. Not a conformant status-line parse by design (see module docs).
pub fn is_success(response: &[u8]) -> bool {
    response.windows(3).any(|w| w == b"200")
}

/// Parse a `host:port` proxy configuration string.
///
/// Returns `None` if the input lacks a colon or the port half does not
/// parse as a `u16`, in which case the caller falls back to a direct
/// connection (spec.md §4.3: "must reject inputs lacking a colon and fall
/// back to direct").
pub fn parse_proxy_endpoint(proxy: &str) -> Option<(Ipv4Addr, u16)> {
    let (host, port) = proxy.rsplit_once(':')?;
    let ip: Ipv4Addr = host.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    Some((ip, port))
}
