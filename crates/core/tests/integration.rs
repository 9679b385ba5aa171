//! End-to-end scenarios from spec.md §8, driven through a connected
//! `UnixDatagram` pair standing in for the TUN descriptor: one end is handed
//! to the engine via `init`, the other is this test's "client" side, reading
//! and writing raw IPv4 frames exactly as the kernel TUN driver would.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gateway_core::packet::tcp::TcpFlags;
use gateway_core::packet::{ipv4, tcp, udp, Segment};
use gateway_core::{Direction, Engine};

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds a fresh engine plus a raw fd/`UnixDatagram` pair standing in for
/// the TUN descriptor: `engine_fd` is handed to `Engine::init`, `client`
/// plays the role of the kernel TUN driver's other end.
fn harness() -> (Engine, RawFd, UnixDatagram) {
    let (engine_sock, client_sock) = UnixDatagram::pair().expect("socketpair");
    client_sock
        .set_read_timeout(Some(READ_TIMEOUT))
        .expect("set read timeout");
    (Engine::new(), engine_sock.into_raw_fd(), client_sock)
}

fn client_syn(src_port: u16, dst: SocketAddrV4, seq: u32) -> Vec<u8> {
    let tcp_bytes = tcp::emit(
        src_port,
        dst.port(),
        seq,
        0,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        &[],
    );
    ipv4::emit(CLIENT_IP, *dst.ip(), ipv4::PROTO_TCP, 1, &tcp_bytes)
}

fn client_data(src_port: u16, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let tcp_bytes = tcp::emit(
        src_port,
        dst.port(),
        1001,
        0,
        TcpFlags {
            ack: true,
            psh: true,
            ..Default::default()
        },
        payload,
    );
    ipv4::emit(CLIENT_IP, *dst.ip(), ipv4::PROTO_TCP, 2, &tcp_bytes)
}

fn client_udp(src_port: u16, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let udp_bytes = udp::emit(src_port, dst.port(), payload);
    ipv4::emit(CLIENT_IP, *dst.ip(), ipv4::PROTO_UDP, 3, &udp_bytes)
}

/// Read one IPv4 frame from `sock` and parse it into a TCP segment,
/// returning `(seq, ack, flags, payload, src_port, dst_port)`.
fn recv_tcp_frame(sock: &UnixDatagram) -> (u32, u32, TcpFlags, Vec<u8>, u16, u16) {
    let mut buf = vec![0u8; 1500];
    let n = sock.recv(&mut buf).expect("recv TUN frame");
    let frame = gateway_core::packet::parse(&buf[..n]).expect("parse IPv4 frame");
    match frame.segment {
        Segment::Tcp(seg) => (
            seg.seq,
            seg.ack,
            seg.flags,
            seg.payload.to_vec(),
            seg.src_port,
            seg.dst_port,
        ),
        Segment::Udp(_) => panic!("expected TCP frame, got UDP"),
    }
}

fn recv_udp_frame(sock: &UnixDatagram) -> (Vec<u8>, u16, u16) {
    let mut buf = vec![0u8; 1500];
    let n = sock.recv(&mut buf).expect("recv TUN frame");
    let frame = gateway_core::packet::parse(&buf[..n]).expect("parse IPv4 frame");
    match frame.segment {
        Segment::Udp(seg) => (seg.payload.to_vec(), seg.src_port, seg.dst_port),
        Segment::Tcp(_) => panic!("expected UDP frame, got TCP"),
    }
}

#[test]
fn direct_tcp_handshake_emits_single_syn_ack() {
    let (mut engine, engine_fd, client) = harness();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let dst = match listener.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };

    engine.init(engine_fd, "", "", 1500).expect("init");
    engine.start().expect("start");

    let _accepted = std::thread::spawn(move || listener.accept().expect("accept"));

    client
        .send(&client_syn(40001, dst, 5000))
        .expect("send SYN");

    let (seq, ack, flags, payload, src_port, dst_port) = recv_tcp_frame(&client);
    assert!(flags.syn && flags.ack, "expected SYN-ACK, got {flags:?}");
    assert_eq!(ack, 5001);
    assert!(payload.is_empty());
    assert_eq!(src_port, dst.port());
    assert_eq!(dst_port, 40001);
    let _ = seq; // randomized; only ack is spec'd

    engine.stop();
}

#[test]
fn downlink_bytes_are_reflected_and_observed() {
    let (mut engine, engine_fd, client) = harness();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let dst = match listener.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };

    let expected_payload: Vec<u8> = (0u16..128).map(|b| (b % 256) as u8).collect();

    let downlink_calls = Arc::new(AtomicUsize::new(0));
    let downlink_calls2 = downlink_calls.clone();
    let expected_for_hook = expected_payload.clone();
    engine.register_callback(Arc::new(move |direction, _proto, _sip, _sport, _dip, _dport, payload: &[u8]| {
        if direction == Direction::Downlink {
            assert_eq!(payload, expected_for_hook.as_slice());
            downlink_calls2.fetch_add(1, Ordering::SeqCst);
        }
    }));

    engine.init(engine_fd, "", "", 1500).expect("init");
    engine.start().expect("start");

    let accept_handle = std::thread::spawn(move || listener.accept().expect("accept").0);

    client
        .send(&client_syn(40001, dst, 5000))
        .expect("send SYN");
    let (_, ack, flags, _, _, _) = recv_tcp_frame(&client);
    assert!(flags.syn && flags.ack);
    assert_eq!(ack, 5001);

    let mut accepted = accept_handle.join().expect("accept thread");
    let payload = expected_payload.clone();
    accepted.write_all(&payload).expect("write downlink bytes");

    let (_, _, flags, recv_payload, src_port, dst_port) = recv_tcp_frame(&client);
    assert!(flags.psh && flags.ack);
    assert_eq!(recv_payload, payload);
    assert_eq!(src_port, dst.port());
    assert_eq!(dst_port, 40001);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(downlink_calls.load(Ordering::SeqCst), 1);

    engine.stop();
}

#[test]
fn proxied_handshake_buffers_uplink_until_200_then_flushes_in_order() {
    let (mut engine, engine_fd, client) = harness();
    let proxy_listener = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
    let proxy_addr = match proxy_listener.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };

    let proxy_thread = std::thread::spawn(move || {
        let (mut stream, _) = proxy_listener.accept().expect("proxy accept");
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("set timeout");

        let mut connect_line = Vec::new();
        let mut byte = [0u8; 1];
        while !connect_line.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).expect("read CONNECT byte");
            connect_line.push(byte[0]);
        }
        let connect_text = String::from_utf8(connect_line).unwrap();
        assert_eq!(connect_text, "CONNECT 1.1.1.1:443 HTTP/1.1\r\n\r\n");

        // The client's buffered TLS ClientHello bytes must not have reached
        // the proxy yet — only after the 200 response is the session
        // established and pending_uplink flushed (spec.md §4.3, scenario 3).
        stream.set_nonblocking(true).unwrap();
        let mut probe = [0u8; 1];
        let premature = stream.read(&mut probe);
        assert!(
            matches!(premature, Err(e) if e.kind() == std::io::ErrorKind::WouldBlock),
            "uplink bytes leaked to the proxy before the 200 response"
        );
        stream.set_nonblocking(false).unwrap();
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("set timeout");

        stream
            .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
            .expect("write 200");

        let mut flushed = vec![0u8; 300];
        stream.read_exact(&mut flushed).expect("read flushed uplink");
        flushed
    });

    engine
        .init(engine_fd, &proxy_addr.to_string(), "", 1500)
        .expect("init");
    engine.start().expect("start");

    let https_dst = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443);
    client
        .send(&client_syn(40002, https_dst, 7000))
        .expect("send SYN");

    // Give the reactor a moment to dial the proxy and send the CONNECT line
    // before we push the buffered application data.
    std::thread::sleep(Duration::from_millis(150));

    let client_hello: Vec<u8> = (0u16..300).map(|b| (b % 256) as u8).collect();
    client
        .send(&client_data(40002, https_dst, &client_hello))
        .expect("send buffered ClientHello");

    let (_, ack, flags, payload, src_port, dst_port) = recv_tcp_frame(&client);
    assert!(flags.syn && flags.ack, "SYN-ACK only after proxy 200");
    assert_eq!(ack, 7001);
    assert!(payload.is_empty());
    assert_eq!(src_port, 443);
    assert_eq!(dst_port, 40002);

    let flushed = proxy_thread.join().expect("proxy thread");
    assert_eq!(flushed, client_hello, "buffered bytes must flush in order");

    engine.stop();
}

#[test]
fn udp_round_trip_reflects_response() {
    let (mut engine, engine_fd, client) = harness();
    let dns = UdpSocket::bind("127.0.0.1:0").expect("bind dns stub");
    let dns_addr = match dns.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };

    let dns_thread = std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        let (n, from) = dns.recv_from(&mut buf).expect("recv query");
        assert_eq!(&buf[..n], b"dns query bytes");
        dns.send_to(b"dns response bytes", from).expect("send response");
    });

    engine.init(engine_fd, "", "", 1500).expect("init");
    engine.start().expect("start");

    client
        .send(&client_udp(53001, dns_addr, b"dns query bytes"))
        .expect("send UDP query");

    dns_thread.join().expect("dns thread");

    let (payload, src_port, dst_port) = recv_udp_frame(&client);
    assert_eq!(payload, b"dns response bytes");
    assert_eq!(src_port, dns_addr.port());
    assert_eq!(dst_port, 53001);

    engine.stop();
}

#[test]
fn repeated_start_without_stop_is_a_noop_then_stop_clears_state() {
    let (mut engine, engine_fd, _client) = harness();
    engine.init(engine_fd, "", "", 1500).expect("init");
    engine.start().expect("first start");
    assert!(engine.is_running());

    // Repeated start without an intervening stop is a no-op, not an error
    // (spec.md §8) — it must short-circuit before spawning a second reactor
    // over the same fd.
    assert!(
        engine.start().is_ok(),
        "repeated start must be a no-op, not an error"
    );
    assert!(engine.is_running());

    engine.stop();
    assert!(!engine.is_running());
    assert_eq!(engine.session_table().tcp_len(), 0);
    assert_eq!(engine.session_table().udp_len(), 0);
}

#[test]
fn stop_then_start_again_reuses_the_host_owned_tun_fd() {
    let (mut engine, engine_fd, client) = harness();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let dst = match listener.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };

    engine.init(engine_fd, "", "", 1500).expect("init");

    engine.start().expect("first start");
    engine.stop();
    assert!(!engine.is_running());

    // The TUN fd is owned by the host VPN service (spec.md §1), not by the
    // reactor, so it must still be open after `stop` — a second `start`
    // reuses the same fd and must not fail with EBADF in `set_nonblocking`.
    engine.start().expect("second start must not fail with EBADF");

    let _accepted = std::thread::spawn(move || listener.accept().expect("accept"));
    client
        .send(&client_syn(40003, dst, 9000))
        .expect("send SYN after restart");

    let (_, ack, flags, payload, _src_port, dst_port) = recv_tcp_frame(&client);
    assert!(flags.syn && flags.ack, "expected SYN-ACK after restart");
    assert_eq!(ack, 9001);
    assert!(payload.is_empty());
    assert_eq!(dst_port, 40003);

    engine.stop();
}

#[test]
fn second_syn_on_same_tuple_replaces_prior_session_without_leaking_token() {
    let (mut engine, engine_fd, client) = harness();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let dst = match listener.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };

    // Accept twice on the same address: the original connection from the
    // first SYN, and the replacement connection the second SYN provokes.
    let accept_thread = std::thread::spawn(move || {
        let first = listener.accept().expect("accept one");
        let second = listener.accept().expect("accept two");
        (first, second)
    });

    engine.init(engine_fd, "", "", 1500).expect("init");
    engine.start().expect("start");

    client
        .send(&client_syn(40004, dst, 1000))
        .expect("send first SYN");
    let (_, ack, flags, _, _, _) = recv_tcp_frame(&client);
    assert!(flags.syn && flags.ack);
    assert_eq!(ack, 1001);
    assert_eq!(engine.session_table().tcp_len(), 1);

    // A second SYN on the exact same five-tuple closes and replaces the
    // prior session (spec.md §3, §8) rather than accumulating a second
    // table entry or leaking the replaced session's reactor token.
    client
        .send(&client_syn(40004, dst, 2000))
        .expect("send second SYN");
    let (_, ack, flags, _, _, dst_port) = recv_tcp_frame(&client);
    assert!(flags.syn && flags.ack);
    assert_eq!(ack, 2001);
    assert_eq!(dst_port, 40004);
    assert_eq!(
        engine.session_table().tcp_len(),
        1,
        "replacement must not leak a second entry"
    );

    accept_thread.join().expect("accept thread");
    engine.stop();
}
