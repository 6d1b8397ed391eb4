/*!
An M:N fiber runtime which turns blocking POSIX I/O into cooperative,
non-blocking I/O.

Fibers are stackful coroutines scheduled over one pinned worker thread
per logical CPU. User code inside a fiber issues ordinary `read`/
`write`/`accept`/`connect`/`poll` calls (through this crate's
ABI-compatible entry points); the runtime drives the descriptors through
an edge-triggered epoll set on a dedicated event-loop thread, parking
the calling fiber until the kernel reports readiness. A fiber that would
have blocked costs its worker nothing: the worker just runs the next
runnable fiber.

The moving parts:

* a process-wide descriptor table holding, per fd, two independent
  four-state readiness machines (reader and writer side) and two
  lock-free intrusive wait lists;
* per-worker run queues, each gated by an eventfd used as a semaphore,
  fed by spawners and the event loop;
* choice-of-two spawn balancing: two loads, pick the lighter worker,
  bind the fiber there for life;
* a signalfd bridge that turns kernel AIO completion signals into fiber
  wakeups, and a small blocking pool for descriptors epoll cannot watch.

Linux only: the implementation is epoll + eventfd + timerfd + signalfd,
with no fallback backend.

## Usage

```
fiber_pool::spawn(|| {
    // Sleeps 10 ms without holding its worker hostage.
    unsafe { fiber_pool::poll(std::ptr::null_mut(), 0, 10) };
});
fiber_pool::start_loop();
fiber_pool::stop_loop(); // returns once every fiber has finished
```

Spawn at least one fiber before `start_loop`: the pool shuts itself
down when the live-fiber count reaches zero.
*/

#[cfg(not(target_os = "linux"))]
compile_error!("fiber-pool relies on epoll, eventfd, timerfd and signalfd");

mod event;
mod eventloop;
mod fdtable;
mod fiber;
mod offload;
mod pool;
mod syscall;

pub use crate::eventloop::AIO_SIGNAL;
pub use crate::fiber::{park, park_prepare};
pub use crate::pool::{spawn, yield_now};
pub use crate::syscall::{
    accept, accept4, close, connect, poll, read, recv, recvfrom, sendto, write,
};

use crate::event::Event;
use crate::fdtable::FdTable;
use crate::pool::Worker;
use lazy_static::lazy_static;
use log::debug;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

/// Everything with process-wide lifecycle, bundled. Built on first
/// touch; the threads only exist between `start_loop` and `stop_loop`.
pub(crate) struct Runtime {
    pub table: FdTable,
    pub workers: Vec<Worker>,
    /// Spawned minus terminated. The pool shuts down when it hits zero.
    pub alive: AtomicUsize,
    /// Tells the event loop the last fiber is gone.
    pub terminate: Event,
    pub epoll_fd: RawFd,
    pub signal_fd: RawFd,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    fn new() -> Runtime {
        // Block the AIO signal before any thread exists so every later
        // thread inherits the mask; the signal is only ever consumed
        // through the signalfd.
        let signal_fd = unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, eventloop::AIO_SIGNAL);
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut());
            assert_eq!(rc, 0, "pthread_sigmask failed");
            let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK);
            assert!(
                fd >= 0,
                "signalfd creation failed: {}",
                io::Error::last_os_error()
            );
            fd
        };
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        assert!(
            epoll_fd >= 0,
            "epoll_create1 failed: {}",
            io::Error::last_os_error()
        );
        let terminate = Event::new();
        // The two runtime-internal fds stay level-triggered: the event
        // loop never reads the termination event at all, and only
        // drains the signalfd in bounded batches.
        for fd in [terminate.fd(), signal_fd] {
            let mut ev = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: fd as u64,
            };
            let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
            assert_eq!(rc, 0, "epoll_ctl(ADD) failed on a runtime fd");
        }
        let workers = (0..num_cpus::get()).map(|_| Worker::new()).collect();
        Runtime {
            table: FdTable::new(),
            workers,
            alive: AtomicUsize::new(0),
            terminate,
            epoll_fd,
            signal_fd,
            threads: Mutex::new(Vec::new()),
        }
    }
}

lazy_static! {
    static ref RUNTIME: Runtime = Runtime::new();
}

pub(crate) fn runtime() -> &'static Runtime {
    &RUNTIME
}

extern "C" fn on_sigterm(_: libc::c_int) {
    // Hard exit: no unwinding, no destructors, status 9.
    unsafe { libc::_exit(9) };
}

fn install_sigterm() {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = on_sigterm;
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        let rc = libc::sigaction(libc::SIGTERM, &sa, ptr::null_mut());
        assert_eq!(rc, 0, "sigaction(SIGTERM) failed");
    }
}

/// Start the pool: one pinned worker per logical CPU plus the event-loop
/// thread. Call once, after the first `spawn`.
pub fn start_loop() {
    let rt = runtime();
    install_sigterm();
    let mut threads = rt.threads.lock().unwrap();
    assert!(threads.is_empty(), "start_loop called twice");
    for i in 0..rt.workers.len() {
        threads.push(
            thread::Builder::new()
                .name(format!("fiber-worker-{}", i))
                .spawn(move || pool::worker_main(i))
                .expect("worker thread spawn failed"),
        );
    }
    threads.push(
        thread::Builder::new()
            .name("fiber-events".to_string())
            .spawn(eventloop::event_loop_main)
            .expect("event loop thread spawn failed"),
    );
    debug!("started {} workers", rt.workers.len());
}

/// Join the event-loop thread and the workers. Returns once the last
/// fiber has terminated and the pool has wound down.
pub fn stop_loop() {
    let rt = runtime();
    let mut threads = rt.threads.lock().unwrap();
    for t in threads.drain(..) {
        let _ = t.join();
    }
}

/// Live fibers right now: spawned minus terminated.
pub fn alive() -> usize {
    runtime().alive.load(SeqCst)
}

/// The current fiber as an opaque pointer, in the shape kernel AIO wants
/// for `sigev_value.sival_ptr`. Submit the request with `sigev_signo =
/// AIO_SIGNAL`, call `park_prepare` before submitting and `park` after,
/// and the completion signal will wake this fiber.
pub fn fiber_handle() -> *mut libc::c_void {
    fiber::current() as *mut libc::c_void
}
