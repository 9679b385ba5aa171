//! TCP header parse and emit (RFC 793 §3.1).
//!
//! This engine terminates flows rather than routing them, so only the fixed
//! 20-byte header (no options) is ever emitted, and the transport checksum
//! is always written as zero — see the module-level known-deficiency note in
//! [`crate::packet`].

/// TCP control bits relevant to this engine's state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl TcpFlags {
    fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
        }
    }

    fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.fin {
            b |= 0x01;
        }
        if self.syn {
            b |= 0x02;
        }
        if self.rst {
            b |= 0x04;
        }
        if self.psh {
            b |= 0x08;
        }
        if self.ack {
            b |= 0x10;
        }
        b
    }
}

/// A parsed TCP segment, borrowing its data payload from the containing IPv4
/// packet buffer.
#[derive(Debug)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: &'a [u8],
}

/// Parse a TCP segment out of `buf` (the IPv4 payload).
///
/// Rejects a data offset (in 32-bit words) whose byte length exceeds `buf`.
pub fn parse(buf: &[u8]) -> Option<TcpSegment<'_>> {
    if buf.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([buf[0], buf[1]]);
    let dst_port = u16::from_be_bytes([buf[2], buf[3]]);
    let seq = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let ack = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let data_offset = ((buf[12] >> 4) as usize) * 4;
    if data_offset > buf.len() || data_offset < 20 {
        return None;
    }
    let flags = TcpFlags::from_byte(buf[13]);
    let window = u16::from_be_bytes([buf[14], buf[15]]);
    let payload = &buf[data_offset..];

    Some(TcpSegment {
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        window,
        payload,
    })
}

/// Fixed advertised window used for every emitted segment (spec'd, not
/// negotiated — this engine does not implement flow control).
pub const ADVERTISED_WINDOW: u16 = 65535;

/// Build a 20-byte TCP header (no options) followed by `payload`.
///
/// The transport checksum is written as zero; see
/// [`crate::packet`]'s module documentation.
#[allow(clippy::too_many_arguments)]
pub fn emit(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = vec![0u8; 20 + payload.len()];

    out[0..2].copy_from_slice(&src_port.to_be_bytes());
    out[2..4].copy_from_slice(&dst_port.to_be_bytes());
    out[4..8].copy_from_slice(&seq.to_be_bytes());
    out[8..12].copy_from_slice(&ack.to_be_bytes());
    out[12] = 5 << 4;
    out[13] = flags.to_byte();
    out[14..16].copy_from_slice(&ADVERTISED_WINDOW.to_be_bytes());
    out[16..18].copy_from_slice(&0u16.to_be_bytes());
    out[18..20].copy_from_slice(&0u16.to_be_bytes());
    out[20..].copy_from_slice(payload);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ports_and_flags() {
        let flags = TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        };
        let bytes = emit(40001, 80, 5000, 0, flags, &[]);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.src_port, 40001);
        assert_eq!(parsed.dst_port, 80);
        assert_eq!(parsed.seq, 5000);
        assert!(parsed.flags.syn && parsed.flags.ack);
        assert!(!parsed.flags.fin && !parsed.flags.rst);
    }

    #[test]
    fn carries_payload_after_header() {
        let bytes = emit(1, 2, 0, 0, TcpFlags::default(), b"hello");
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.payload, b"hello");
    }

    #[test]
    fn rejects_data_offset_beyond_buffer() {
        let mut bytes = emit(1, 2, 0, 0, TcpFlags::default(), &[]);
        bytes[12] = 15 << 4; // claims 60-byte header on a 20-byte buffer
        assert!(parse(&bytes).is_none());
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(parse(&[0u8; 10]).is_none());
    }

    #[test]
    fn checksum_field_is_zero() {
        let bytes = emit(1, 2, 0, 0, TcpFlags::default(), &[]);
        assert_eq!(&bytes[16..18], &[0, 0]);
    }
}
