//! `extern "C"` ABI exposing the engine under the symbol names a host JNI
//! shim `dlsym`s (grounded in `tun2socks_bridge.cpp`'s `dlsym(core_handle,
//! "tt_init")` table): `tt_init`, `tt_start`, `tt_stop`, `tt_set_log_level`,
//! `tt_version`, `tt_register_callback`, `tt_set_protect_callback`.
//!
//! Holds one `Mutex<Option<Engine>>` rather than a bare `static Engine` (the
//! mutex is what's unavoidable at a C ABI boundary with no instance
//! parameter; the `Option` keeps a future multi-instance ABI a drop-in
//! change, per the engine's own "no process-wide state" design). Every
//! exported function catches unwinds — a panic must never cross an
//! `extern "C"` boundary.

use std::ffi::{CStr, CString, c_char, c_int};
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use gateway_core::{Direction, Engine, LogLevel, Protocol};

static ENGINE: Mutex<Option<Engine>> = Mutex::new(None);

type PacketCallback = unsafe extern "C" fn(
    direction: c_int,
    protocol: c_int,
    src_ip: *const c_char,
    src_port: c_int,
    dst_ip: *const c_char,
    dst_port: c_int,
    payload: *const u8,
    length: c_int,
);

type ProtectCallback = unsafe extern "C" fn(fd: c_int) -> c_int;

fn catch<F: FnOnce() -> R + panic::UnwindSafe, R>(default: R, f: F) -> R {
    panic::catch_unwind(f).unwrap_or_else(|_| {
        tracing::error!("panic caught at FFI boundary");
        default
    })
}

unsafe fn str_from_ptr<'a>(ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        return "";
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().unwrap_or("")
}

/// `int tt_init(int tun_fd, const char* socks_server, const char* dns_server, int mtu)`
///
/// Returns 0 on success, -1 otherwise.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tt_init(
    tun_fd: c_int,
    socks_server: *const c_char,
    dns_server: *const c_char,
    mtu: c_int,
) -> c_int {
    catch(-1, AssertUnwindSafe(|| {
        let proxy = unsafe { str_from_ptr(socks_server) };
        let dns = unsafe { str_from_ptr(dns_server) };
        let mut guard = ENGINE.lock();
        let engine = guard.get_or_insert_with(Engine::new);
        match engine.init(tun_fd as RawFd, proxy, dns, mtu as u16) {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "tt_init failed");
                -1
            }
        }
    }))
}

/// `int tt_start()`
///
/// Returns 0 on success, -1 if `tt_init` was never called or the reactor
/// failed to start.
#[unsafe(no_mangle)]
pub extern "C" fn tt_start() -> c_int {
    catch(-1, AssertUnwindSafe(|| {
        let mut guard = ENGINE.lock();
        match guard.as_mut() {
            Some(engine) => match engine.start() {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "tt_start failed");
                    -1
                }
            },
            None => -1,
        }
    }))
}

/// `void tt_stop()`
#[unsafe(no_mangle)]
pub extern "C" fn tt_stop() {
    catch((), AssertUnwindSafe(|| {
        if let Some(engine) = ENGINE.lock().as_mut() {
            engine.stop();
        }
    }));
}

/// `void tt_set_log_level(int level)` — 0=debug, 1=info, 2=warn.
#[unsafe(no_mangle)]
pub extern "C" fn tt_set_log_level(level: c_int) {
    catch((), AssertUnwindSafe(|| {
        let Some(level) = LogLevel::from_i32(level) else {
            tracing::warn!(level, "tt_set_log_level: out-of-range level ignored");
            return;
        };
        if let Some(engine) = ENGINE.lock().as_ref() {
            engine.set_log_level(level);
        }
    }));
}

/// `const char* tt_version()`
///
/// Returns a pointer valid until the next call into this library (the
/// backing `CString` is leaked for `'static`-equivalent lifetime, matching
/// the one-shot nature of a version string).
#[unsafe(no_mangle)]
pub extern "C" fn tt_version() -> *const c_char {
    catch(std::ptr::null(), AssertUnwindSafe(|| {
        let version = ENGINE
            .lock()
            .as_ref()
            .map(Engine::version)
            .unwrap_or(env!("CARGO_PKG_VERSION"));
        match CString::new(version) {
            Ok(c) => c.into_raw(),
            Err(_) => std::ptr::null(),
        }
    }))
}

/// `void tt_register_callback(void (*cb)(int,int,const char*,int,const char*,int,const uint8_t*,int))`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tt_register_callback(cb: PacketCallback) {
    catch((), AssertUnwindSafe(|| {
        let sink: gateway_core::ObservationHook = Arc::new(
            move |direction: Direction, protocol: Protocol, src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16, payload: &[u8]| {
                let Ok(src) = CString::new(src_ip.to_string()) else { return };
                let Ok(dst) = CString::new(dst_ip.to_string()) else { return };
                let direction = match direction {
                    Direction::Uplink => 0,
                    Direction::Downlink => 1,
                };
                let protocol = match protocol {
                    Protocol::Tcp => 6,
                    Protocol::Udp => 17,
                };
                unsafe {
                    cb(
                        direction,
                        protocol,
                        src.as_ptr(),
                        src_port as c_int,
                        dst.as_ptr(),
                        dst_port as c_int,
                        payload.as_ptr(),
                        payload.len() as c_int,
                    );
                }
            },
        );
        if let Some(engine) = ENGINE.lock().as_ref() {
            engine.register_callback(sink);
        }
    }));
}

/// `void tt_set_protect_callback(int (*protect)(int fd))`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tt_set_protect_callback(protect: ProtectCallback) {
    catch((), AssertUnwindSafe(|| {
        let hook: gateway_core::ProtectHook =
            Arc::new(move |fd: RawFd| unsafe { protect(fd as c_int) == 1 });
        if let Some(engine) = ENGINE.lock().as_ref() {
            engine.install_protect_callback(hook);
        }
    }));
}
