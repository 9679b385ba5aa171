//! Single-threaded readiness reactor (spec.md §4.5).
//!
//! The idiomatic equivalent of the reference's raw `epoll_create1`/
//! `epoll_wait` loop: a `mio::Poll` over the TUN descriptor and every
//! outbound session socket. Only this thread ever touches a socket or the
//! TUN once the reactor has started.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::{TcpStream, UdpSocket};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::hook::{Direction, HookSlots, Protocol as HookProtocol};
use crate::packet::{self, tcp::TcpFlags};
use crate::proxy;
use crate::session::tcp::{REPLY_ACK, REPLY_SEQ, TcpState};
use crate::session::udp::RECV_BUF_SIZE;
use crate::session::{FiveTuple, SessionKind, SessionTable, TcpSession, UdpSession};

const TUN_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Parameters the reactor needs that don't change across its lifetime.
pub struct ReactorConfig {
    pub tun_fd: RawFd,
    pub mtu: u16,
    pub proxy: Option<(Ipv4Addr, u16)>,
}

/// Drives the event loop until `running` is cleared. Runs on its own
/// thread, spawned by [`crate::Engine::start`].
pub struct Reactor {
    poll: Poll,
    events: Events,
    /// Wrapped in `ManuallyDrop` because `tun_fd` is owned by the host VPN
    /// service (spec.md §1), not by this reactor: the original `tt_stop`
    /// closes session sockets but never `g_tun_fd`. Letting `File`'s drop
    /// glue run here would close the host's descriptor out from under it,
    /// and break `init; start; stop; start; stop` (the second `start` would
    /// `set_nonblocking` an already-closed fd).
    tun: ManuallyDrop<File>,
    mtu: usize,
    proxy: Option<(Ipv4Addr, u16)>,
    next_token: usize,
    token_map: HashMap<Token, (FiveTuple, SessionKind)>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> io::Result<Self> {
        set_nonblocking(config.tun_fd)?;

        let poll = Poll::new()?;
        let mut source = SourceFd(&config.tun_fd);
        poll.registry()
            .register(&mut source, TUN_TOKEN, Interest::READABLE)?;

        // SAFETY: `tun_fd` stays open and valid for the reactor's running
        // lifetime (spec.md §1), but the engine never takes ownership of it
        // — `ManuallyDrop` below suppresses the `close(2)` a plain `File`
        // would otherwise issue when this `Reactor` is dropped.
        let tun = ManuallyDrop::new(unsafe { File::from_raw_fd(config.tun_fd) });

        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            tun,
            mtu: config.mtu as usize,
            proxy: config.proxy,
            next_token: 1,
            token_map: HashMap::new(),
        })
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Run until `running` is cleared. On exit, every session socket is
    /// closed and the table is cleared (spec.md §4.5 cancellation).
    pub fn run(
        &mut self,
        running: &Arc<AtomicBool>,
        table: &Arc<SessionTable>,
        hooks: &Arc<HookSlots>,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; self.mtu.max(1500)];

        while running.load(Ordering::Acquire) {
            match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            let writable: Vec<bool> = self.events.iter().map(|e| e.is_writable()).collect();
            let readable: Vec<bool> = self.events.iter().map(|e| e.is_readable()).collect();

            for ((token, is_writable), is_readable) in
                tokens.into_iter().zip(writable).zip(readable)
            {
                if token == TUN_TOKEN {
                    self.handle_tun_readable(&mut buf, table, hooks);
                    continue;
                }
                let Some((tuple, kind)) = self.token_map.get(&token).copied() else {
                    continue;
                };
                match kind {
                    SessionKind::Tcp => {
                        self.handle_tcp_event(tuple, is_readable, is_writable, table, hooks)
                    }
                    SessionKind::Udp => self.handle_udp_event(tuple, table, hooks),
                }
            }

            self.reap_expired(table);
        }

        self.shutdown(table);
        Ok(())
    }

    fn shutdown(&mut self, table: &Arc<SessionTable>) {
        table.clear();
        self.token_map.clear();
    }

    // ---- TUN ingress -----------------------------------------------------

    fn handle_tun_readable(&mut self, buf: &mut [u8], table: &Arc<SessionTable>, hooks: &Arc<HookSlots>) {
        loop {
            match self.tun.read(buf) {
                Ok(0) => break,
                Ok(n) => self.handle_inbound_packet(&buf[..n], table, hooks),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "TUN read error");
                    break;
                }
            }
        }
    }

    fn handle_inbound_packet(&mut self, buf: &[u8], table: &Arc<SessionTable>, hooks: &Arc<HookSlots>) {
        let frame = match packet::parse(buf) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!(error = %e, "dropping malformed inbound packet");
                return;
            }
        };
        match frame.segment {
            packet::Segment::Tcp(seg) => {
                self.handle_tcp_packet(frame.five_tuple, seg, table, hooks)
            }
            packet::Segment::Udp(seg) => {
                self.handle_udp_packet(frame.five_tuple, seg, table, hooks)
            }
        }
    }

    // ---- TCP ---------------------------------------------------------

    fn handle_tcp_packet(
        &mut self,
        tuple: FiveTuple,
        seg: packet::tcp::TcpSegment<'_>,
        table: &Arc<SessionTable>,
        hooks: &Arc<HookSlots>,
    ) {
        if seg.flags.syn && !seg.flags.ack {
            self.create_tcp_session(tuple, seg.seq, table, hooks);
            return;
        }

        // The observation hook must fire after the session-table lock is
        // released (spec.md §3 invariant 5, §4.7) — the downlink-TCP and
        // both UDP sites already defer it this way, so the uplink path
        // collects a flag here instead of calling `hooks.observe` from
        // inside `with_tcp_mut`'s closure.
        let mut observe_uplink = false;

        let closing = table
            .with_tcp_mut(&tuple, |session| {
                session.touch();
                match session.state {
                    TcpState::Established => {
                        if !seg.payload.is_empty() {
                            match session.socket.write_all(seg.payload) {
                                Ok(()) => observe_uplink = true,
                                Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
                                    tracing::warn!(?tuple, error = %e, "uplink write failed");
                                    session.transition(TcpState::Closing);
                                }
                                Err(_) => {}
                            }
                        }
                    }
                    TcpState::ProxyConnect | TcpState::ProxyResponse => {
                        if session.push_pending_uplink(seg.payload).is_err() {
                            tracing::warn!(?tuple, "pending_uplink overflow, closing session");
                            session.transition(TcpState::Closing);
                        }
                    }
                    TcpState::Connecting | TcpState::Closing => {}
                    TcpState::Init => {}
                }
                if seg.flags.fin || seg.flags.rst {
                    session.transition(TcpState::Closing);
                }
                session.state == TcpState::Closing
            });

        if observe_uplink {
            hooks.observe(
                Direction::Uplink,
                HookProtocol::Tcp,
                tuple.src_ip,
                tuple.src_port,
                tuple.dst_ip,
                tuple.dst_port,
                seg.payload,
            );
        }

        if closing == Some(true) {
            if let Some(session) = table.remove_tcp(&tuple) {
                self.deregister_tcp(&session);
            }
        }
    }

    fn create_tcp_session(
        &mut self,
        tuple: FiveTuple,
        client_seq: u32,
        table: &Arc<SessionTable>,
        hooks: &Arc<HookSlots>,
    ) {
        // A second SYN on an existing tuple closes and replaces the prior
        // session (spec.md §3, §8). `SessionTable::insert_tcp` already drops
        // the displaced session's socket, but its `token` must also come out
        // of `token_map` here, or the stale `Token -> tuple` entry is never
        // reaped and accumulates across SYN retransmits.
        if let Some(old) = table.remove_tcp(&tuple) {
            self.deregister_tcp(&old);
        }

        let via_proxy = self.proxy.is_some() && tuple.dst_port == 443;
        let target = if via_proxy {
            self.proxy.unwrap()
        } else {
            (tuple.dst_ip, tuple.dst_port)
        };

        let stream = match connect_tcp_nonblocking(target, hooks) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(?tuple, error = %e, "outbound TCP connect failed");
                return;
            }
        };

        let token = self.alloc_token();
        let mut stream = stream;
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            tracing::warn!(?tuple, error = %e, "failed to register outbound TCP socket");
            return;
        }

        let session = TcpSession::new(tuple, stream, token, client_seq, via_proxy);
        table.insert_tcp(tuple, session);
        self.token_map.insert(token, (tuple, SessionKind::Tcp));
    }

    fn handle_tcp_event(
        &mut self,
        tuple: FiveTuple,
        readable: bool,
        writable: bool,
        table: &Arc<SessionTable>,
        hooks: &Arc<HookSlots>,
    ) {
        let mut tun_writes: Vec<Vec<u8>> = Vec::new();
        let mut observations: Vec<(Direction, Vec<u8>)> = Vec::new();
        let mut should_close = false;

        table.with_tcp_mut(&tuple, |session| {
            session.touch();

            if writable {
                if session.state == TcpState::Connecting {
                    if session.via_proxy {
                        session.transition(TcpState::ProxyConnect);
                    } else {
                        session.transition(TcpState::Established);
                        session.syn_ack_sent = true;
                        tun_writes.push(packet::emit_tcp_reply(
                            &session.five_tuple,
                            session.syn_ack_seq,
                            session.client_initial_seq.wrapping_add(1),
                            TcpFlags {
                                syn: true,
                                ack: true,
                                ..Default::default()
                            },
                            packet::random_id(),
                            &[],
                        ));
                    }
                }

                // Checked separately, not as an `else` of the branch above:
                // a socket that just finished connecting is typically
                // writable immediately, and `mio`'s edge-triggered readiness
                // won't necessarily fire a second writable event once the
                // send buffer's state stops changing. The CONNECT line must
                // go out in this same pass or a proxied session can stall
                // in `ProxyConnect` forever.
                if session.state == TcpState::ProxyConnect {
                    let line =
                        proxy::connect_request(session.five_tuple.dst_ip, session.five_tuple.dst_port);
                    match session.socket.write_all(&line) {
                        Ok(()) => session.transition(TcpState::ProxyResponse),
                        Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
                            tracing::warn!(?tuple, error = %e, "proxy CONNECT send failed");
                            should_close = true;
                        }
                        Err(_) => {}
                    }
                }
            }

            if readable && !should_close {
                match session.state {
                    TcpState::ProxyResponse => {
                        let mut buf = [0u8; 512];
                        match session.socket.read(&mut buf) {
                            Ok(0) => should_close = true,
                            Ok(n) => {
                                session.proxy_response_buf.extend_from_slice(&buf[..n]);
                                if proxy::is_success(&session.proxy_response_buf) {
                                    session.transition(TcpState::Established);
                                    session.syn_ack_sent = true;
                                    tun_writes.push(packet::emit_tcp_reply(
                                        &session.five_tuple,
                                        session.syn_ack_seq,
                                        session.client_initial_seq.wrapping_add(1),
                                        TcpFlags {
                                            syn: true,
                                            ack: true,
                                            ..Default::default()
                                        },
                                        packet::random_id(),
                                        &[],
                                    ));
                                    for entry in session.drain_pending_uplink() {
                                        if session.socket.write_all(&entry).is_err() {
                                            should_close = true;
                                            break;
                                        }
                                    }
                                } else if session.proxy_response_buf.len() > proxy::MAX_RESPONSE_BYTES {
                                    tracing::warn!(?tuple, "proxy handshake response too large without 200");
                                    should_close = true;
                                }
                            }
                            Err(e) if e.kind() != io::ErrorKind::WouldBlock => should_close = true,
                            Err(_) => {}
                        }
                    }
                    TcpState::Established => {
                        let mut buf = [0u8; 4096];
                        match session.socket.read(&mut buf) {
                            Ok(0) => should_close = true,
                            Ok(n) => {
                                tun_writes.push(packet::emit_tcp_reply(
                                    &session.five_tuple,
                                    REPLY_SEQ,
                                    REPLY_ACK,
                                    TcpFlags {
                                        ack: true,
                                        psh: true,
                                        ..Default::default()
                                    },
                                    packet::random_id(),
                                    &buf[..n],
                                ));
                                observations.push((Direction::Downlink, buf[..n].to_vec()));
                            }
                            Err(e) if e.kind() != io::ErrorKind::WouldBlock => should_close = true,
                            Err(_) => {}
                        }
                    }
                    _ => {}
                }
            }
        });

        for bytes in tun_writes {
            self.write_tun(&bytes);
        }
        for (direction, payload) in observations {
            let tuple = tuple;
            hooks.observe(
                direction,
                HookProtocol::Tcp,
                tuple.dst_ip,
                tuple.dst_port,
                tuple.src_ip,
                tuple.src_port,
                &payload,
            );
        }
        if should_close {
            if let Some(session) = table.remove_tcp(&tuple) {
                self.deregister_tcp(&session);
            }
        }
    }

    fn deregister_tcp(&mut self, session: &TcpSession) {
        self.token_map.remove(&session.token);
    }

    // ---- UDP ---------------------------------------------------------

    fn handle_udp_packet(
        &mut self,
        tuple: FiveTuple,
        seg: packet::udp::UdpDatagram<'_>,
        table: &Arc<SessionTable>,
        hooks: &Arc<HookSlots>,
    ) {
        if self.ensure_udp_session(tuple, table, hooks).is_none() {
            tracing::warn!(?tuple, "failed to create outbound UDP socket");
            return;
        }

        let dst = SocketAddr::V4(SocketAddrV4::new(tuple.dst_ip, tuple.dst_port));
        let sent = table.with_udp_mut(&tuple, |session| {
            session.touch();
            session.socket.send_to(seg.payload, dst)
        });

        match sent {
            Some(Ok(_)) => hooks.observe(
                Direction::Uplink,
                HookProtocol::Udp,
                tuple.src_ip,
                tuple.src_port,
                tuple.dst_ip,
                tuple.dst_port,
                seg.payload,
            ),
            Some(Err(e)) => tracing::warn!(?tuple, error = %e, "UDP sendto failed"),
            None => {}
        }
    }

    /// Ensure a UDP session exists for `tuple`, creating one if necessary.
    /// Returns `Some(())` once a session is present (freshly created or
    /// pre-existing), `None` if creation failed.
    fn ensure_udp_session(
        &mut self,
        tuple: FiveTuple,
        table: &Arc<SessionTable>,
        hooks: &Arc<HookSlots>,
    ) -> Option<()> {
        if table.with_udp_mut(&tuple, |_| ()).is_some() {
            return Some(());
        }

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .ok()?;
        socket.set_nonblocking(true).ok()?;
        if !hooks.protect(socket.as_raw_fd()) {
            tracing::warn!(?tuple, "protect callback rejected outbound UDP socket");
        }
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into()).ok()?;
        let std_socket: std::net::UdpSocket = socket.into();
        let mut mio_socket = UdpSocket::from_std(std_socket);

        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut mio_socket, token, Interest::READABLE)
            .ok()?;

        let session = UdpSession::new(tuple, mio_socket, token);
        table.insert_udp(tuple, session);
        self.token_map.insert(token, (tuple, SessionKind::Udp));
        Some(())
    }

    fn handle_udp_event(&mut self, tuple: FiveTuple, table: &Arc<SessionTable>, hooks: &Arc<HookSlots>) {
        let mut buf = [0u8; RECV_BUF_SIZE];
        let mut reply: Option<Vec<u8>> = None;
        let mut should_close = false;

        table.with_udp_mut(&tuple, |session| {
            session.touch();
            match session.socket.recv_from(&mut buf) {
                Ok((n, _from)) => {
                    reply = Some(packet::emit_udp_reply(&tuple, packet::random_id(), &buf[..n]));
                }
                Err(e) if e.kind() != io::ErrorKind::WouldBlock => should_close = true,
                Err(_) => {}
            }
        });

        if let Some(bytes) = reply {
            let payload_len = bytes.len().saturating_sub(28);
            self.write_tun(&bytes);
            hooks.observe(
                Direction::Downlink,
                HookProtocol::Udp,
                tuple.dst_ip,
                tuple.dst_port,
                tuple.src_ip,
                tuple.src_port,
                &bytes[bytes.len() - payload_len..],
            );
        }

        if should_close {
            if let Some(session) = table.remove_udp(&tuple) {
                self.token_map.remove(&session.token);
            }
        }
    }

    // ---- reaping -------------------------------------------------------

    fn reap_expired(&mut self, table: &Arc<SessionTable>) {
        let now = Instant::now();
        for (_, session) in table.reap_expired_tcp(now) {
            self.deregister_tcp(&session);
        }
        for (_, session) in table.reap_expired_udp(now) {
            self.token_map.remove(&session.token);
        }
    }

    fn write_tun(&mut self, bytes: &[u8]) {
        if let Err(e) = self.tun.write_all(bytes) {
            tracing::warn!(error = %e, "TUN write error");
        }
    }
}

/// Create a non-blocking outbound TCP socket, protect it, and issue a
/// non-blocking `connect`. `protect(fd)` is invoked strictly after
/// `socket()` and before `connect()` (spec.md §9).
fn connect_tcp_nonblocking(target: (Ipv4Addr, u16), hooks: &Arc<HookSlots>) -> io::Result<TcpStream> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_nonblocking(true)?;
    if !hooks.protect(socket.as_raw_fd()) {
        tracing::warn!("protect callback rejected outbound TCP socket");
    }

    let addr = SocketAddr::V4(SocketAddrV4::new(target.0, target.1));
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from_std(std_stream))
}

/// Set `O_NONBLOCK` on a raw TUN descriptor. `socket2`/`mio` cover this for
/// session sockets, but the TUN fd arrives from the host as a bare `RawFd`
/// (spec.md §1), so it needs the `fcntl` path directly.
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is a valid, open descriptor for the lifetime of this call
    // (the host hands it to the engine before `init`/`start`).
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
