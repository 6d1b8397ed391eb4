/*!
The event-loop thread: the sole consumer of the epoll set. It never runs
user fibers and never issues user syscalls; all it does is translate
readiness edges into descriptor-table transitions and queue pushes, and
drain the two runtime-internal fds (the termination event and the
signalfd that carries AIO completions).
*/

use crate::fdtable::NONBLOCKING;
use crate::fiber::FiberRecord;
use crate::Runtime;
use log::debug;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

const MAX_EVENTS: usize = 500;
/// signalfd_siginfo records consumed per wakeup; the signalfd stays
/// level-triggered in the epoll set, so any backlog re-notifies.
const SIGNAL_BATCH: usize = 20;

/// The real-time signal reserved for kernel AIO completion routing.
/// Callers submit aio requests with `sigev_signo = AIO_SIGNAL` and
/// `sigev_value.sival_ptr` set to their fiber handle.
pub const AIO_SIGNAL: libc::c_int = 42;

pub fn event_loop_main() {
    let rt = crate::runtime();
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
    debug!("event loop running");
    'outer: loop {
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(rt.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, -1)
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            panic!("epoll_wait failed: {}", err);
        };
        for ev in &events[..n] {
            let fd = ev.u64 as RawFd;
            if fd == rt.terminate.fd() {
                // Shutdown: every worker gets a wake so it can observe
                // the zero live count and exit.
                for w in &rt.workers {
                    w.queue.event.trigger();
                }
                break 'outer;
            }
            if fd == rt.signal_fd {
                drain_signals(rt);
                continue;
            }
            let entry = match rt.table.entry(fd) {
                Some(e) => e,
                None => continue,
            };
            if entry.lifecycle() != NONBLOCKING {
                continue;
            }
            // Error and hangup conditions wake both sides: a parked
            // fiber has to retry its syscall to see the errno.
            let bits = ev.events;
            let err = bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            if err || bits & libc::EPOLLIN as u32 != 0 {
                entry.reader.on_event(fd);
            }
            if err || bits & libc::EPOLLOUT as u32 != 0 {
                entry.writer.on_event(fd);
            }
        }
    }
    debug!("event loop exiting");
}

/// Pull a batch of queued signals off the signalfd and schedule the
/// fibers named in their payloads.
fn drain_signals(rt: &Runtime) {
    let mut buf: [libc::signalfd_siginfo; SIGNAL_BATCH] = unsafe { mem::zeroed() };
    let n = unsafe {
        libc::read(
            rt.signal_fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            SIGNAL_BATCH * mem::size_of::<libc::signalfd_siginfo>(),
        )
    };
    if n <= 0 {
        return; // EAGAIN: raced with a previous drain
    }
    let count = n as usize / mem::size_of::<libc::signalfd_siginfo>();
    for si in &buf[..count] {
        if si.ssi_signo != AIO_SIGNAL as u32 {
            continue;
        }
        let fiber = si.ssi_ptr as usize as *mut FiberRecord;
        if !fiber.is_null() {
            crate::fdtable::wake(fiber, rt.signal_fd);
        }
    }
}
