//! IPv4/TCP/UDP packet codec.
//!
//! Parsing trusts the TUN driver (no checksum verification on ingress).
//! Emission always produces a correct IPv4 header checksum but writes the
//! TCP/UDP transport checksum as zero — accepted by most kernels for
//! locally-injected loopback-style traffic but a protocol violation. A
//! conformant implementation would compute the RFC 793/768 pseudo-header
//! checksum; this engine does not, by design inherited from its reference.

pub mod ipv4;
pub mod tcp;
pub mod udp;

use crate::error::GatewayError;
use crate::session::FiveTuple;

/// A parsed transport-layer segment, still borrowing from the inbound
/// packet buffer.
#[derive(Debug)]
pub enum Segment<'a> {
    Tcp(tcp::TcpSegment<'a>),
    Udp(udp::UdpDatagram<'a>),
}

/// A fully parsed inbound frame: the five-tuple identifying its flow plus
/// the transport segment.
#[derive(Debug)]
pub struct Frame<'a> {
    pub five_tuple: FiveTuple,
    pub segment: Segment<'a>,
}

/// Parse an inbound IPv4 datagram into a [`Frame`].
///
/// Only TCP and UDP are handled; any other IP protocol, or a transport
/// header too short to parse, is reported as
/// [`GatewayError::MalformedPacket`] and the caller drops the packet
/// silently.
pub fn parse(buf: &[u8]) -> Result<Frame<'_>, GatewayError> {
    let ip = ipv4::parse(buf)?;
    match ip.protocol {
        ipv4::PROTO_TCP => {
            let tcp = tcp::parse(ip.payload).ok_or(GatewayError::MalformedPacket {
                kind: crate::error::ParseErrorKind::TruncatedTcp,
            })?;
            let five_tuple = FiveTuple {
                src_ip: ip.src,
                src_port: tcp.src_port,
                dst_ip: ip.dst,
                dst_port: tcp.dst_port,
            };
            Ok(Frame {
                five_tuple,
                segment: Segment::Tcp(tcp),
            })
        }
        ipv4::PROTO_UDP => {
            let udp = udp::parse(ip.payload).ok_or(GatewayError::MalformedPacket {
                kind: crate::error::ParseErrorKind::TruncatedTcp,
            })?;
            let five_tuple = FiveTuple {
                src_ip: ip.src,
                src_port: udp.src_port,
                dst_ip: ip.dst,
                dst_port: udp.dst_port,
            };
            Ok(Frame {
                five_tuple,
                segment: Segment::Udp(udp),
            })
        }
        other => Err(GatewayError::MalformedPacket {
            kind: crate::error::ParseErrorKind::UnsupportedProtocol(other),
        }),
    }
}

/// Synthesize an IPv4+TCP reply datagram, source/destination swapped versus
/// the client-observed five-tuple (the engine impersonates the remote peer
/// toward the client).
pub fn emit_tcp_reply(
    tuple: &FiveTuple,
    seq: u32,
    ack: u32,
    flags: tcp::TcpFlags,
    id: u16,
    payload: &[u8],
) -> Vec<u8> {
    let tcp_bytes = tcp::emit(tuple.dst_port, tuple.src_port, seq, ack, flags, payload);
    ipv4::emit(tuple.dst_ip, tuple.src_ip, ipv4::PROTO_TCP, id, &tcp_bytes)
}

/// Synthesize an IPv4+UDP reply datagram, source/destination swapped versus
/// the client-observed five-tuple.
pub fn emit_udp_reply(tuple: &FiveTuple, id: u16, payload: &[u8]) -> Vec<u8> {
    let udp_bytes = udp::emit(tuple.dst_port, tuple.src_port, payload);
    ipv4::emit(tuple.dst_ip, tuple.src_ip, ipv4::PROTO_UDP, id, &udp_bytes)
}

/// A freshly rolled random 16-bit IPv4 identification value.
pub fn random_id() -> u16 {
    use rand::Rng;
    rand::rng().random::<u16>()
}
