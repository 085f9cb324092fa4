//! `LD_PRELOAD` interception shim.
//!
//! Loaded into an unmodified application via `LD_PRELOAD=libktsn_shim.so`,
//! this library shadows four libc symbols (`socket`, `setsockopt`, `close`,
//! `sendmsg`) so a normal UDP `sendmsg` carrying an `SO_TXTIME` deadline is
//! diverted into the fabric instead of reaching the kernel. Every other
//! call — sockets without `SO_TXTIME`, TCP, multi-iov sends, destinations
//! outside a known local subnet — passes through to the real libc
//! implementation unchanged.
//!
//! The source hooks in by overriding `__libc_start_main` so initialisation
//! runs before the application's own `main`. A `cdylib` has no equivalent
//! hook into that handoff; `ctor` gives the same "run once before `main`"
//! guarantee by placing the initialiser in a `.init_array` entry, which is
//! what the loader already runs for every shared object pulled in via
//! `LD_PRELOAD`.

use std::collections::BTreeMap;
use std::ffi::{c_int, c_void};
use std::mem::size_of;
use std::net::Ipv4Addr;
use std::sync::{Mutex, OnceLock};

use ktsn_core::{BROADCAST_MAC, Metadata, ShmLayout, Transport};
use ktsn_fabric::{Arena, Behavior};
use ktsn_iface::{Interface, InterfaceSource, LinuxInterfaceSource, find_by_net};
use ktsn_mmap::SharedMemory;
use ktsn_perf::PerfRecorder;
#[cfg(feature = "record-perf")]
use ktsn_perf::PerfStage;

// Not yet exposed by the `libc` crate: SO_TXTIME and SCM_TXTIME share the
// same numeric value (61) on Linux (see `include/uapi/asm-generic/socket.h`
// and `include/uapi/linux/net_tstamp.h`).
const SO_TXTIME: c_int = 61;
const SCM_TXTIME: c_int = 61;

#[derive(Debug, thiserror::Error)]
enum ShimInitError {
    #[error("required symbol '{0}' could not be resolved via dlsym(RTLD_NEXT, ..)")]
    MissingSymbol(&'static str),

    #[error(transparent)]
    Shm(#[from] ktsn_mmap::ShmError),

    #[error(transparent)]
    Fabric(#[from] ktsn_fabric::ArenaError),

    #[error(transparent)]
    Iface(#[from] ktsn_iface::IfaceError),

    #[error("already initialised")]
    AlreadyInitialized,
}

/// Per-fd record: the subset of socket state the sending path cares about.
///
/// A `BTreeMap<i32, SocketRecord>` stands in for the source's linked list
/// of `kt_socket` nodes — small, rarely scanned, naturally keyed by fd
/// (§9 Design Notes).
struct SocketRecord {
    priority: i32,
    txtime: bool,
}

impl Default for SocketRecord {
    fn default() -> Self {
        SocketRecord { priority: -1, txtime: false }
    }
}

#[derive(Clone, Copy)]
struct RealFns {
    socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, libc::socklen_t) -> c_int,
    close: unsafe extern "C" fn(c_int) -> c_int,
    sendmsg: unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> isize,
}

/// Process-wide shim state, initialised once at load time and read-mostly
/// thereafter (§9 Design Notes: "Global mutable state in the shim").
struct ShimState {
    arena: Arena,
    // Kept alive for the life of the process: the arena's raw pointers are
    // only valid while these mappings stay in place.
    _data_shm: SharedMemory,
    _ctrl_shm: SharedMemory,
    interfaces: Vec<Interface>,
    sockets: Mutex<BTreeMap<i32, SocketRecord>>,
    /// Hot-path stage timing (§ ambient perf stack). A `Mutex` rather than
    /// a thread-local: the shim is single-threaded per process in the
    /// common case (§9 Design Notes) but must stay correct if an
    /// application calls `sendmsg` from more than one thread.
    perf: Mutex<PerfRecorder>,
}

static STATE: OnceLock<ShimState> = OnceLock::new();

/// The four real libc symbols this shim shadows, resolved once via
/// `dlsym(RTLD_NEXT, …)` regardless of whether the fabric is reachable.
///
/// `STATE` (the arena attach) and `REAL` (the underlying libc functions)
/// are deliberately independent: a process with no sender running must
/// still be able to pass every intercepted call straight through to libc,
/// and that fallback can never go through the plain `libc::socket`/etc.
/// free functions — under `LD_PRELOAD` those names resolve back to this
/// crate's own `#[no_mangle]` exports, so calling them here would recurse
/// into this same function forever.
static REAL: OnceLock<RealFns> = OnceLock::new();

#[ctor::ctor]
fn ktsn_shim_init() {
    init_logging();
    match resolve_real_fns() {
        Ok(real) => {
            let _ = REAL.set(real);
        }
        Err(err) => {
            // There is no libc fallback without these pointers: calling
            // `libc::socket`/etc. here would resolve back to this crate's
            // own export and recurse. Every process this shim is preloaded
            // into would otherwise hang or overflow its stack on the very
            // first socket call, so this is a true init failure (§7).
            tracing::error!(%err, "ktsn shim could not resolve real libc symbols, aborting");
            std::process::abort();
        }
    }
    if let Err(err) = attach() {
        tracing::error!(%err, "ktsn shim failed to attach to the fabric; every call will pass through to libc");
    }
}

fn resolve_real_fns() -> Result<RealFns, ShimInitError> {
    // SAFETY: each name is resolved once at load time and the pointers
    // outlive `REAL`, which is never cleared.
    unsafe {
        Ok(RealFns {
            socket: resolve(c"socket")?,
            setsockopt: resolve(c"setsockopt")?,
            close: resolve(c"close")?,
            sendmsg: resolve(c"sendmsg")?,
        })
    }
}

/// The real libc functions, resolved in the ctor before any intercepted
/// call can run. Panics only if the ctor's own resolution failed, in which
/// case the process already aborted before reaching here.
fn real() -> &'static RealFns {
    REAL.get().expect("ktsn shim ctor must resolve REAL before any intercepted call runs")
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("KTSN_SHIM_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Stderr only: the shim must never write to the fd the intercepted
    // application is itself writing its own stdout through.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn attach() -> Result<(), ShimInitError> {
    let config = ktsn_config::ShimConfig::from_env();

    let mut data_shm = SharedMemory::attach(&config.data_memory_name, ktsn_core::DEFAULT_DATA_MEMORY_SIZE)?;
    let ctrl_shm = SharedMemory::attach(&config.ctrl_memory_name, ShmLayout::SIZE)?;

    // SAFETY: ctrl_shm is mapped read-write for at least ShmLayout::SIZE
    // bytes, written once by the sender before the shim ever attaches.
    let layout = unsafe { *(ctrl_shm.as_ptr() as *const ShmLayout) };
    // SAFETY: data_shm is mapped for DEFAULT_DATA_MEMORY_SIZE bytes, the
    // same region `layout` was carved from.
    let arena = unsafe { Arena::attach(data_shm.as_mut_ptr(), &layout) };

    let interfaces = LinuxInterfaceSource.discover()?;

    STATE
        .set(ShimState {
            arena,
            _data_shm: data_shm,
            _ctrl_shm: ctrl_shm,
            interfaces,
            sockets: Mutex::new(BTreeMap::new()),
            perf: Mutex::new(PerfRecorder::new()),
        })
        .map_err(|_| ShimInitError::AlreadyInitialized)?;

    tracing::info!(interfaces = STATE.get().unwrap().interfaces.len(), "attached to fabric");
    Ok(())
}

/// # Safety
/// `name` must be the name of a libc symbol with the exact ABI of `F`.
unsafe fn resolve<F: Copy>(name: &'static std::ffi::CStr) -> Result<F, ShimInitError> {
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if sym.is_null() {
        return Err(ShimInitError::MissingSymbol(
            name.to_str().unwrap_or("<non-utf8 symbol name>"),
        ));
    }
    Ok(unsafe { std::mem::transmute_copy(&sym) })
}

fn set_errno(errno: c_int) {
    unsafe { *libc::__errno_location() = errno };
}

#[unsafe(no_mangle)]
pub extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    // SAFETY: `real()` points at the genuine libc `socket`, resolved via
    // dlsym(RTLD_NEXT, ..) in the ctor; calling the plain `libc::socket`
    // free function here would resolve back to this very export under
    // `LD_PRELOAD` and recurse forever.
    let fd = unsafe { (real().socket)(domain, ty, protocol) };
    let Some(state) = STATE.get() else {
        return fd;
    };
    // The source conditionally inserts a record on this branch with no
    // explicit return on the taken path (§9 Open Questions); the intended
    // return is the underlying libc return value regardless of whether a
    // record gets inserted.
    if fd >= 0 {
        state.sockets.lock().unwrap().entry(fd).or_default();
    }
    fd
}

#[unsafe(no_mangle)]
pub extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> c_int {
    // SAFETY: `real()` is the genuine libc `setsockopt`; see `socket` above.
    let forward = || unsafe { (real().setsockopt)(fd, level, optname, optval, optlen) };

    let Some(state) = STATE.get() else {
        return forward();
    };

    if level == libc::SOL_SOCKET && optname == SO_TXTIME {
        if optlen as usize != size_of::<u64>() {
            set_errno(libc::EINVAL);
            return -1;
        }
        state.sockets.lock().unwrap().entry(fd).or_default().txtime = true;
        // Marks the record only; the kernel must never learn about this
        // option or it will try to own the deadline itself.
        return 0;
    }

    if level == libc::SOL_SOCKET && optname == libc::SO_PRIORITY {
        if optlen as usize != size_of::<c_int>() {
            set_errno(libc::EINVAL);
            return -1;
        }
        // SAFETY: optlen was just checked against size_of::<c_int>().
        let priority = unsafe { *(optval as *const c_int) };
        state.sockets.lock().unwrap().entry(fd).or_default().priority = priority;
    }

    forward()
}

#[unsafe(no_mangle)]
pub extern "C" fn close(fd: c_int) -> c_int {
    // SAFETY: `real()` is the genuine libc `close`; see `socket` above.
    let forward = || unsafe { (real().close)(fd) };
    let Some(state) = STATE.get() else {
        return forward();
    };
    state.sockets.lock().unwrap().remove(&fd);
    forward()
}

#[unsafe(no_mangle)]
pub extern "C" fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> isize {
    let Some(state) = STATE.get() else {
        // SAFETY: `real()` is the genuine libc `sendmsg`; see `socket` above.
        return unsafe { (real().sendmsg)(fd, msg, flags) };
    };
    #[cfg(feature = "record-perf")]
    state.perf.lock().unwrap().begin(PerfStage::ShimTotal);
    let result = sendmsg_inner(state, fd, msg, flags);
    #[cfg(feature = "record-perf")]
    state.perf.lock().unwrap().end(PerfStage::ShimTotal);
    result
}

fn sendmsg_inner(state: &ShimState, fd: c_int, msg: *const libc::msghdr, flags: c_int) -> isize {
    // SAFETY: `real()` is the genuine libc `sendmsg`; see `socket` above.
    let forward = || unsafe { (real().sendmsg)(fd, msg, flags) };

    let txtime_enabled = {
        let sockets = state.sockets.lock().unwrap();
        sockets.get(&fd).map(|r| r.txtime).unwrap_or(false)
    };
    if !txtime_enabled {
        return forward();
    }

    // SAFETY: `msg` is a valid `msghdr` pointer for the duration of this call
    // (the libc `sendmsg` contract every caller already relies on).
    let msg_ref = unsafe { &*msg };

    #[cfg(feature = "record-perf")]
    state.perf.lock().unwrap().begin(PerfStage::ShimCmsgScan);
    let found = scan_txtime_cmsg(msg_ref);
    #[cfg(feature = "record-perf")]
    state.perf.lock().unwrap().end(PerfStage::ShimCmsgScan);
    let Some(txtime) = found else {
        return forward();
    };

    if msg_ref.msg_name.is_null() || (msg_ref.msg_namelen as usize) < size_of::<libc::sockaddr_in>() {
        return forward();
    }
    // SAFETY: just checked msg_namelen covers a sockaddr_in.
    let peer = unsafe { &*(msg_ref.msg_name as *const libc::sockaddr_in) };
    if peer.sin_family as c_int != libc::AF_INET {
        return forward();
    }
    let dst_ip = Ipv4Addr::from(u32::from_be(peer.sin_addr.s_addr));

    let Some(iface) = find_by_net(&state.interfaces, dst_ip) else {
        return forward();
    };

    if msg_ref.msg_iovlen != 1 {
        return forward();
    }
    // SAFETY: msg_iovlen == 1 was just checked; msg_iov points at that one
    // iovec for the duration of this call.
    let iov = unsafe { &*msg_ref.msg_iov };
    let payload_len = iov.iov_len;
    if payload_len > ktsn_core::MBUF_SIZE {
        return forward();
    }

    #[cfg(feature = "record-perf")]
    state.perf.lock().unwrap().begin(PerfStage::ShimSendmsg);

    let mut claimed = [0u64; 1];
    if state.arena.free_ring().dequeue_burst(&mut claimed, Behavior::Fixed) == 0 {
        #[cfg(feature = "record-perf")]
        state.perf.lock().unwrap().end(PerfStage::ShimSendmsg);
        set_errno(libc::ENOBUFS);
        return -1;
    }
    let index = claimed[0] as u32;

    // SAFETY: index was just dequeued from the free-ring, so this call
    // holds the only live reference to the slot.
    unsafe {
        let mbuf = state.arena.mbuf_mut(index);
        std::ptr::copy_nonoverlapping(iov.iov_base as *const u8, mbuf.data.as_mut_ptr(), payload_len);

        let metadata = state.arena.metadata_mut(index);
        metadata.txtime = txtime as i64;
        metadata.size = payload_len as u32;
        metadata.transport = Transport::Udp;
        metadata.eth_src = iface.mac;
        metadata.eth_dst = BROADCAST_MAC;
        metadata.ip_src = u32::from(iface.addr);
        metadata.ip_dst = u32::from(dst_ip);
        metadata.udp_dport = u16::from_be(peer.sin_port);
    }

    if state.arena.tx_ring().enqueue_burst(&claimed, Behavior::Fixed) == 0 {
        // The claimed slot must go back to the free-ring before returning
        // the error, or it leaks forever (diverges from the source, which
        // does not return it here).
        state.arena.free_ring().enqueue_burst(&claimed, Behavior::Variable);
        #[cfg(feature = "record-perf")]
        state.perf.lock().unwrap().end(PerfStage::ShimSendmsg);
        set_errno(libc::ENOBUFS);
        return -1;
    }
    #[cfg(feature = "record-perf")]
    state.perf.lock().unwrap().end(PerfStage::ShimSendmsg);

    payload_len as isize
}

/// Scans a `msghdr`'s ancillary data for an `SCM_TXTIME` cmsg at
/// `SOL_SOCKET`, returning the nanosecond deadline it carries.
///
/// `libc::CMSG_FIRSTHDR`/`CMSG_NXTHDR` are the same macros-turned-functions
/// the source's cmsg walk expands to; there is no safe cmsg iterator in the
/// `libc` crate.
fn scan_txtime_cmsg(msg: &libc::msghdr) -> Option<u64> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg as *const libc::msghdr);
        while !cmsg.is_null() {
            let header = &*cmsg;
            if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == SCM_TXTIME {
                let data = libc::CMSG_DATA(cmsg) as *const u64;
                return Some(std::ptr::read_unaligned(data));
            }
            cmsg = libc::CMSG_NXTHDR(msg as *const libc::msghdr, cmsg);
        }
    }
    None
}
