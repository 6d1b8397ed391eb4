/*!
The syscall interceptor: ABI-shaped replacements for the blocking POSIX
calls, driven by the per-descriptor state machines.

One parameterized template covers every data call. An `Op` names the
syscall, the side of the descriptor it belongs to, how the non-blocking
flag reaches the kernel, and which errno means "would block" for it. The
call path is always the same: make sure the fd is registered, then run
the state protocol - attempt the raw syscall in the attempting states,
park on the wait list in the parked state, and translate the result into
the next state.

Calls from non-fiber threads (the event loop, the blocking pool, any
plain user thread) fall straight through to the kernel.
*/

use crate::event::Timer;
use crate::fdtable::{
    FdEntry, Side, WaitNode, INFLIGHT, INITIALIZING, NONBLOCKING, PARKED, READY, THREADPOOL,
    UNCERTAIN,
};
use crate::fiber::{self, FiberRecord, WAKE_NONE, WAKE_RUNNING};
use crate::{offload, Runtime};
use libc::{c_int, c_long, c_void, nfds_t, size_t, socklen_t, ssize_t};
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::Ordering::SeqCst;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Accept,
    Read,
    Write,
    /// Runs the writer machine like Write, but carries no buffer: the
    /// retry-after-park loop is about connection establishment, not
    /// byte counts.
    Connect,
}

#[derive(Clone, Copy, PartialEq)]
enum Nb {
    /// O_NONBLOCK on the descriptor (set once at registration).
    Fcntl,
    /// MSG_DONTWAIT folded into the flags argument on every call.
    Msg,
}

struct Op {
    nr: c_long,
    kind: Kind,
    nb: Nb,
    wouldblock: c_int,
}

const OP_READ: Op = Op {
    nr: libc::SYS_read,
    kind: Kind::Read,
    nb: Nb::Fcntl,
    wouldblock: libc::EWOULDBLOCK,
};
const OP_WRITE: Op = Op {
    nr: libc::SYS_write,
    kind: Kind::Write,
    nb: Nb::Fcntl,
    wouldblock: libc::EWOULDBLOCK,
};
const OP_ACCEPT: Op = Op {
    nr: libc::SYS_accept,
    kind: Kind::Accept,
    nb: Nb::Fcntl,
    wouldblock: libc::EWOULDBLOCK,
};
const OP_ACCEPT4: Op = Op {
    nr: libc::SYS_accept4,
    kind: Kind::Accept,
    nb: Nb::Fcntl,
    wouldblock: libc::EWOULDBLOCK,
};
const OP_CONNECT: Op = Op {
    nr: libc::SYS_connect,
    kind: Kind::Connect,
    nb: Nb::Fcntl,
    wouldblock: libc::EINPROGRESS,
};
const OP_SENDTO: Op = Op {
    nr: libc::SYS_sendto,
    kind: Kind::Write,
    nb: Nb::Msg,
    wouldblock: libc::EWOULDBLOCK,
};
const OP_RECVFROM: Op = Op {
    nr: libc::SYS_recvfrom,
    kind: Kind::Read,
    nb: Nb::Msg,
    wouldblock: libc::EWOULDBLOCK,
};

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e };
}

unsafe fn raw(nr: c_long, a: &[usize; 6]) -> c_long {
    libc::syscall(nr, a[0], a[1], a[2], a[3], a[4], a[5])
}

/// Register `fd` in the table and the epoll set, once. Returns the
/// lifecycle the fd ended up in. Concurrent callers spin out the
/// INITIALIZING window; later callers see NONBLOCKING immediately, so a
/// second registration of the same fd is a no-op.
pub(crate) unsafe fn intercept_fd(rt: &Runtime, entry: &FdEntry, fd: c_int) -> Result<u32, c_int> {
    loop {
        match entry.lifecycle() {
            NONBLOCKING => return Ok(NONBLOCKING),
            THREADPOOL => return Ok(THREADPOOL),
            INITIALIZING => {
                std::hint::spin_loop();
                continue;
            }
            _ => {}
        }
        if !entry.try_begin_init() {
            continue;
        }
        // The raw syscalls must report rather than block.
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            let e = errno();
            entry.abort_init();
            return Err(e);
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let e = errno();
            entry.abort_init();
            return Err(e);
        }
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        if libc::epoll_ctl(rt.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) < 0 {
            let e = errno();
            if e == libc::EPERM {
                // Not pollable (regular file, block device): these never
                // would-block anyway, so route them to the blocking pool.
                entry.finish_init(THREADPOOL);
                return Ok(THREADPOOL);
            }
            entry.abort_init();
            return Err(e);
        }
        entry.finish_init(NONBLOCKING);
        return Ok(NONBLOCKING);
    }
}

/// Enqueue the current fiber on `side` and suspend until an edge (or a
/// close) schedules it. Returns false if the enqueue CAS lost and the
/// whole attempt should be retried.
unsafe fn park_on(side: &Side, cur: *mut FiberRecord, fd: c_int) -> bool {
    let rec = &*cur;
    let mut node = WaitNode::new(cur);
    rec.wake_fd.store(WAKE_NONE, SeqCst);
    if !side.try_enqueue(&mut node) {
        // Never published, so nobody can have claimed us.
        rec.wake_fd.store(WAKE_RUNNING, SeqCst);
        return false;
    }
    // No lost wakeup: either the state is still parked and the next
    // edge's schedule will find our node, or it moved underneath us and
    // we drain the list ourselves.
    if side.state.load(SeqCst) != PARKED {
        side.schedule(fd);
    }
    fiber::suspend_current(rec);
    // Our node was consumed (and released) by whoever woke us; its
    // storage dies with this frame.
    true
}

/// The template every data call goes through. `args` are the raw syscall
/// arguments, fd first.
unsafe fn intercepted(op: &Op, mut args: [usize; 6]) -> ssize_t {
    let cur = fiber::current();
    if cur.is_null() {
        return raw(op.nr, &args) as ssize_t;
    }
    let fd = args[0] as c_int;
    let rt = crate::runtime();
    let entry = match rt.table.entry(fd) {
        Some(e) => e,
        None => return raw(op.nr, &args) as ssize_t,
    };
    match intercept_fd(rt, entry, fd) {
        Ok(NONBLOCKING) => {}
        Ok(_) => return offload::run_on_pool(op.nr, args),
        Err(e) => {
            set_errno(e);
            return -1;
        }
    }
    if op.nb == Nb::Msg {
        args[3] |= libc::MSG_DONTWAIT as usize;
    }

    let side = match op.kind {
        Kind::Read | Kind::Accept => &entry.reader,
        Kind::Write | Kind::Connect => &entry.writer,
    };
    // Write calls keep going until the whole buffer is accepted, the way
    // a blocking descriptor behaves; reads return as soon as anything
    // arrived.
    let requested: usize = match op.kind {
        Kind::Read | Kind::Write => args[2],
        Kind::Accept | Kind::Connect => 0,
    };
    let mut done: usize = 0;
    let mut parked = false;

    loop {
        match side.state.load(SeqCst) {
            PARKED => {
                if park_on(side, cur, fd) {
                    parked = true;
                }
                continue;
            }
            UNCERTAIN => {
                // May already be READY or INFLIGHT; either way attempt.
                let _ = side.state.compare_exchange(UNCERTAIN, INFLIGHT, SeqCst, SeqCst);
            }
            READY => {
                let _ = side.state.compare_exchange(READY, INFLIGHT, SeqCst, SeqCst);
            }
            INFLIGHT => {
                // Someone else is mid-syscall; an edge can cover both of
                // us, so attempt anyway.
            }
            s => panic!("bad side state ({}). Please report this error.", s),
        }

        let ret = {
            let mut a = args;
            if op.kind == Kind::Write && done > 0 {
                a[1] += done;
                a[2] -= done;
            }
            raw(op.nr, &a)
        };

        if ret >= 0 {
            match op.kind {
                Kind::Accept => {
                    // The backlog may hold more connections.
                    let _ = side.state.compare_exchange(INFLIGHT, UNCERTAIN, SeqCst, SeqCst);
                    return ret as ssize_t;
                }
                Kind::Connect => {
                    let _ = side.state.compare_exchange(INFLIGHT, UNCERTAIN, SeqCst, SeqCst);
                    return 0;
                }
                Kind::Read => {
                    if ret as usize == requested {
                        // Filled the caller's buffer: the kernel may
                        // hold more, so nobody gets to park yet.
                        let _ = side.state.compare_exchange(INFLIGHT, UNCERTAIN, SeqCst, SeqCst);
                    } else {
                        // Partial: we drained the kernel. The next edge
                        // reopens the side.
                        let _ = side.state.compare_exchange(INFLIGHT, PARKED, SeqCst, SeqCst);
                    }
                    return ret as ssize_t;
                }
                Kind::Write => {
                    done += ret as usize;
                    if done >= requested {
                        let _ = side.state.compare_exchange(INFLIGHT, UNCERTAIN, SeqCst, SeqCst);
                        return done as ssize_t;
                    }
                    // Short write: the kernel buffer filled up. Park
                    // until the peer drains it, then continue.
                    let _ = side.state.compare_exchange(INFLIGHT, PARKED, SeqCst, SeqCst);
                    continue;
                }
            }
        }

        let err = errno();
        if err == libc::EINTR {
            continue;
        }
        if err == op.wouldblock {
            // If the CAS fails an edge arrived mid-syscall and moved us
            // to UNCERTAIN/READY; the next round retries instead of
            // parking.
            let _ = side.state.compare_exchange(INFLIGHT, PARKED, SeqCst, SeqCst);
            continue;
        }
        if op.kind == Kind::Connect && err == libc::EISCONN && parked {
            // The connect that parked us completed while we slept; the
            // retry's EISCONN is this call's success.
            let _ = side.state.compare_exchange(INFLIGHT, UNCERTAIN, SeqCst, SeqCst);
            return 0;
        }
        if op.kind == Kind::Write && done > 0 {
            // Bytes already left; report them like a blocking short
            // write would.
            return done as ssize_t;
        }
        set_errno(err);
        return -1;
    }
}

// ── The intercepted POSIX surface ──

#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    intercepted(&OP_READ, [fd as usize, buf as usize, count, 0, 0, 0])
}

#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    intercepted(&OP_WRITE, [fd as usize, buf as usize, count, 0, 0, 0])
}

#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut libc::sockaddr, len: *mut socklen_t) -> c_int {
    intercepted(&OP_ACCEPT, [fd as usize, addr as usize, len as usize, 0, 0, 0]) as c_int
}

#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn accept4(
    fd: c_int,
    addr: *mut libc::sockaddr,
    len: *mut socklen_t,
    flags: c_int,
) -> c_int {
    intercepted(
        &OP_ACCEPT4,
        [fd as usize, addr as usize, len as usize, flags as usize, 0, 0],
    ) as c_int
}

#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const libc::sockaddr, len: socklen_t) -> c_int {
    intercepted(&OP_CONNECT, [fd as usize, addr as usize, len as usize, 0, 0, 0]) as c_int
}

#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    intercepted(
        &OP_SENDTO,
        [
            fd as usize,
            buf as usize,
            len,
            flags as usize,
            addr as usize,
            addrlen as usize,
        ],
    )
}

#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    intercepted(
        &OP_RECVFROM,
        [
            fd as usize,
            buf as usize,
            len,
            flags as usize,
            addr as usize,
            addrlen as usize,
        ],
    )
}

#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    recvfrom(fd, buf, len, flags, ptr::null_mut(), ptr::null_mut())
}

/// Close an fd the runtime may be tracking. The entry leaves the table
/// before the kernel close (so a reused fd number registers afresh), and
/// every fiber still parked on it is woken afterwards to retry and
/// observe the dead descriptor.
#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let rt = crate::runtime();
    match rt.table.entry(fd) {
        Some(entry) if entry.lifecycle() == NONBLOCKING || entry.lifecycle() == THREADPOOL => {
            entry.begin_close();
            // The kernel drops the fd from the epoll set on this close.
            let ret = libc::syscall(libc::SYS_close, fd as usize) as c_int;
            entry.wake_all_on_close(fd);
            ret
        }
        _ => libc::syscall(libc::SYS_close, fd as usize) as c_int,
    }
}

// ── poll ──

enum PollWake {
    Timeout,
    Io,
}

/// A pending (pollfd direction, wait node) pair for the slow path.
struct ParkSlot {
    node: WaitNode,
    side: &'static Side,
    fd: RawFd,
}

unsafe fn raw_poll(fds: *mut libc::pollfd, nfds: nfds_t, timeout: c_int) -> c_int {
    // ppoll rather than poll: present on every architecture, and the
    // kernel keeps the remaining time up to date across restarts.
    let mut ts = libc::timespec {
        tv_sec: (timeout.max(0) / 1000) as libc::time_t,
        tv_nsec: ((timeout.max(0) % 1000) as i64 * 1_000_000) as libc::c_long,
    };
    let tsp: *mut libc::timespec = if timeout >= 0 { &mut ts } else { ptr::null_mut() };
    loop {
        let rc = libc::syscall(
            libc::SYS_ppoll,
            fds as usize,
            nfds as usize,
            tsp as usize,
            0usize,
            8usize, // sizeof(sigset_t) as the kernel counts it
        ) as c_int;
        if rc >= 0 || errno() != libc::EINTR {
            return rc;
        }
    }
}

/// One lock-free pass over the pollfds: fill in what the descriptor
/// table already knows. Returns the ready count and whether every
/// consulted state was conclusive (READY or parked, nothing in flight).
unsafe fn scan(rt: &Runtime, fds: &mut [libc::pollfd]) -> (c_int, bool) {
    let mut count = 0;
    let mut conclusive = true;
    for p in fds.iter_mut() {
        p.revents = 0;
        if p.fd < 0 {
            continue;
        }
        let entry = match rt.table.entry(p.fd) {
            Some(e) => e,
            None => {
                conclusive = false;
                continue;
            }
        };
        match intercept_fd(rt, entry, p.fd) {
            Ok(NONBLOCKING) => {
                if p.events & libc::POLLIN != 0 {
                    match entry.reader.state.load(SeqCst) {
                        READY => p.revents |= libc::POLLIN,
                        PARKED => {}
                        _ => conclusive = false,
                    }
                }
                if p.events & libc::POLLOUT != 0 {
                    match entry.writer.state.load(SeqCst) {
                        READY => p.revents |= libc::POLLOUT,
                        PARKED => {}
                        _ => conclusive = false,
                    }
                }
            }
            Ok(_) => {
                // Regular files never block.
                p.revents = p.events & (libc::POLLIN | libc::POLLOUT);
            }
            Err(_) => p.revents = libc::POLLNVAL,
        }
        if p.revents != 0 {
            count += 1;
        }
    }
    (count, conclusive)
}

/// The slow path: one wait node per requested direction, plus a timer
/// node when there is a deadline, then suspend. On return every node is
/// reclaimed and the timer is gone.
unsafe fn park_poll(
    rt: &'static Runtime,
    cur: *mut FiberRecord,
    fds: &[libc::pollfd],
    timeout_ms: Option<u64>,
) -> PollWake {
    let rec = &*cur;
    let mut slots: Vec<ParkSlot> = Vec::with_capacity(fds.len() * 2 + 1);
    for p in fds {
        if p.fd < 0 {
            continue;
        }
        let entry = match rt.table.entry(p.fd) {
            Some(e) => e,
            None => continue,
        };
        if entry.lifecycle() != NONBLOCKING {
            continue;
        }
        if p.events & libc::POLLIN != 0 {
            slots.push(ParkSlot {
                node: WaitNode::new(cur),
                side: &entry.reader,
                fd: p.fd,
            });
        }
        if p.events & libc::POLLOUT != 0 {
            slots.push(ParkSlot {
                node: WaitNode::new(cur),
                side: &entry.writer,
                fd: p.fd,
            });
        }
    }
    let timer = match timeout_ms {
        Some(ms) => {
            let t = Timer::new().expect("timerfd creation failed");
            let entry = rt
                .table
                .entry(t.fd())
                .expect("timer fd beyond the descriptor table");
            intercept_fd(rt, entry, t.fd()).expect("timer registration failed");
            slots.push(ParkSlot {
                node: WaitNode::new(cur),
                side: &entry.reader,
                fd: t.fd(),
            });
            Some((t, ms))
        }
        None => None,
    };

    rec.wake_fd.store(WAKE_NONE, SeqCst);
    // The vec stops growing here, so node addresses are stable for the
    // whole park.
    for i in 0..slots.len() {
        let node = &mut slots[i].node as *mut WaitNode;
        while !slots[i].side.try_enqueue(node) {}
        // Enqueue-then-recheck: a direction that turned ready while we
        // linked in will never deliver another edge for it, so claim
        // the wake ourselves.
        if slots[i].side.state.load(SeqCst) == READY {
            crate::fdtable::wake(cur, slots[i].fd);
        }
    }
    if let Some((t, ms)) = &timer {
        t.arm(*ms);
    }
    fiber::suspend_current(rec);
    let woke = rec.wake_fd.load(SeqCst);

    if let Some((t, _)) = &timer {
        t.disarm();
    }
    // Take every un-consumed node off its list before this frame dies.
    for slot in slots.iter() {
        slot.side
            .reclaim(&slot.node as *const WaitNode as *mut WaitNode, slot.fd);
    }
    if let Some((t, _)) = &timer {
        // Pull the timer out of the table before its fd number can be
        // reused.
        let tfd = t.fd();
        if let Some(entry) = rt.table.entry(tfd) {
            entry.begin_close();
            t.dispose();
            entry.wake_all_on_close(tfd);
        }
        if woke == tfd {
            return PollWake::Timeout;
        }
    }
    PollWake::Io
}

#[cfg_attr(feature = "interpose", no_mangle)]
pub unsafe extern "C" fn poll(fds: *mut libc::pollfd, nfds: nfds_t, timeout: c_int) -> c_int {
    let cur = fiber::current();
    if cur.is_null() || timeout == 0 {
        return raw_poll(fds, nfds, timeout);
    }
    let rt = crate::runtime();
    let fds: &mut [libc::pollfd] = if nfds == 0 {
        &mut []
    } else {
        slice::from_raw_parts_mut(fds, nfds as usize)
    };

    if fds.is_empty() {
        // A pure sleep: park as the sole reader of a one-shot timer.
        let ms = if timeout > 0 { Some(timeout as u64) } else { None };
        park_poll(rt, cur, fds, ms);
        return 0;
    }

    let deadline = if timeout > 0 {
        Some(Instant::now() + Duration::from_millis(timeout as u64))
    } else {
        None
    };
    loop {
        let (count, conclusive) = scan(rt, fds);
        if count > 0 {
            return count;
        }
        if !conclusive {
            // Some side is mid-syscall; ask the kernel directly, once.
            let n = raw_poll(fds.as_mut_ptr(), fds.len() as nfds_t, 0);
            if n != 0 {
                return n;
            }
        }
        let remaining = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return 0;
                }
                Some(((d - now).as_millis() as u64).max(1))
            }
            None => None,
        };
        match park_poll(rt, cur, fds, remaining) {
            PollWake::Timeout => return 0,
            PollWake::Io => continue, // rescan; re-park on a spurious wake
        }
    }
}
