use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixDatagram;

use clap::Parser;
use gateway_core::{Engine, LogLevel};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "gateway-engine",
    about = "Standalone TUN-to-proxy packet forwarding engine"
)]
struct Args {
    /// Upstream HTTP CONNECT proxy as host:port; empty connects directly.
    #[arg(long, default_value = "")]
    proxy: String,
    /// DNS endpoint; reserved, the core does not currently interpret it.
    #[arg(long, default_value = "")]
    dns: String,
    /// MTU in bytes, bounding the read buffer and emitted packet size.
    #[arg(long, default_value_t = 1500)]
    mtu: u16,
    /// Initial log verbosity: 0=debug, 1=info, 2=warn.
    #[arg(long, default_value_t = 1)]
    log_level: i32,
}

fn main() {
    let args = Args::parse();

    let (filter, reload_handle) = reload::Layer::new(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut engine = Engine::new();
    engine.install_log_reload(reload_handle);
    if let Some(level) = LogLevel::from_i32(args.log_level) {
        engine.set_log_level(level);
    } else {
        eprintln!("ignoring out-of-range --log-level {}", args.log_level);
    }

    // This binary has no kernel TUN device available to it (that belongs to
    // the host VPN service, out of scope per spec.md §1, and opening one
    // needs root/capabilities this exercise cannot assume). A connected
    // SOCK_DGRAM pair stands in as a local loopback harness: like a TUN fd
    // in IFF_TUN mode, each send/recv carries exactly one packet.
    let (engine_sock, peer) = match UnixDatagram::pair() {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("failed to create loopback TUN harness: {e}");
            return;
        }
    };
    // Keeps the peer end open for the process lifetime; dropping it would
    // make every TUN read on the engine side observe EOF.
    let _peer = peer;
    let engine_fd = engine_sock.into_raw_fd();

    if let Err(e) = engine.init(engine_fd, &args.proxy, &args.dns, args.mtu) {
        eprintln!("init failed: {e}");
        return;
    }
    if let Err(e) = engine.start() {
        eprintln!("failed to start engine: {e}");
        return;
    }

    println!(
        "engine running (proxy={:?}, mtu={}) — press Enter to stop",
        args.proxy, args.mtu
    );
    let mut input = String::new();
    let _ = io::stdin().read_line(&mut input);

    engine.stop();
}
