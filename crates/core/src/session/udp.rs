//! UDP session lifecycle (spec.md §4.4): one datagram socket per flow.

use std::time::Instant;

use mio::net::UdpSocket;

use crate::session::FiveTuple;

/// Maximum bytes read per `recvfrom` (spec.md §4.4).
pub const RECV_BUF_SIZE: usize = 4096;

/// A single UDP flow's engine-side state, owning its datagram socket.
pub struct UdpSession {
    pub socket: UdpSocket,
    pub five_tuple: FiveTuple,
    pub token: mio::Token,
    pub last_activity: Instant,
}

impl UdpSession {
    pub fn new(five_tuple: FiveTuple, socket: UdpSocket, token: mio::Token) -> Self {
        tracing::debug!(?five_tuple, "UDP session created");
        Self {
            socket,
            five_tuple,
            token,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn tuple() -> FiveTuple {
        FiveTuple {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 53001,
            dst_ip: Ipv4Addr::new(8, 8, 8, 8),
            dst_port: 53,
        }
    }

    #[test]
    fn touch_updates_last_activity() {
        let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let socket = UdpSocket::bind(addr).unwrap();
        let mut session = UdpSession::new(tuple(), socket, mio::Token(0));
        let first = session.last_activity;
        std::thread::sleep(std::time::Duration::from_millis(5));
        session.touch();
        assert!(session.last_activity > first);
    }
}
