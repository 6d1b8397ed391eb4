/*!
Raw wakeables: a binary event backed by an eventfd, and a one-shot timer
backed by a timerfd.

The event is the only blocking primitive the workers ever sleep on. The
timer never delivers a callback of its own; its fd sits in the descriptor
table like any other fd, and expiry surfaces as ordinary read-readiness.
*/

use byteorder::{ByteOrder, NativeEndian};
use nix::errno::Errno;
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

/// A binary event: `trigger` makes the next (or current) `wait_and_reset`
/// return. The eventfd counter is read in full, so any number of triggers
/// collapse into one wakeup and the reset is atomic with the observation.
/// No spurious wakes.
pub struct Event {
    fd: RawFd,
}

impl Event {
    pub fn new() -> Event {
        Event {
            fd: eventfd(0, EfdFlags::empty()).expect("eventfd creation failed"),
        }
    }

    /// Wake whoever is (or will next be) blocked in `wait_and_reset`.
    pub fn trigger(&self) {
        let mut buf = [0u8; 8];
        NativeEndian::write_i64(&mut buf, 1);
        loop {
            match unistd::write(self.fd, &buf) {
                Err(Errno::EINTR) => continue,
                r => {
                    r.expect("eventfd write failed");
                    return;
                }
            }
        }
    }

    /// Block until triggered. The read consumes the whole counter.
    pub fn wait_and_reset(&self) {
        let mut buf = [0u8; 8];
        loop {
            match unistd::read(self.fd, &mut buf) {
                Err(Errno::EINTR) => continue,
                r => {
                    r.expect("eventfd read failed");
                    return;
                }
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn dispose(&self) {
        let _ = unistd::close(self.fd);
    }
}

/// A one-shot monotonic timer. Arming it makes the fd readable `ms`
/// milliseconds later; whoever is parked on the fd's reader list gets
/// woken through the normal readiness machinery, with this fd as the
/// wake fd.
pub struct Timer {
    fd: RawFd,
}

impl Timer {
    pub fn new() -> io::Result<Timer> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Timer { fd })
    }

    /// Fire once, `ms` milliseconds from now. `ms` must be non-zero (a
    /// zero `it_value` is the kernel's disarm encoding).
    pub fn arm(&self, ms: u64) {
        debug_assert!(ms > 0);
        self.settime(ms);
    }

    pub fn disarm(&self) {
        self.settime(0);
    }

    fn settime(&self, ms: u64) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (ms / 1000) as libc::time_t,
                tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
            },
        };
        let rc = unsafe { libc::timerfd_settime(self.fd, 0, &spec, ptr::null_mut()) };
        assert_eq!(rc, 0, "timerfd_settime failed: {}", io::Error::last_os_error());
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn dispose(&self) {
        let _ = unistd::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{poll, PollFd, PollFlags};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn trigger_then_wait_does_not_block() {
        let ev = Event::new();
        ev.trigger();
        ev.trigger();
        ev.wait_and_reset(); // both triggers collapse into this one wake
        ev.dispose();
    }

    #[test]
    fn wait_blocks_until_triggered() {
        let ev = Event::new();
        let fd = ev.fd();
        let th = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let other = Event { fd };
            other.trigger();
        });
        ev.wait_and_reset();
        th.join().unwrap();
        ev.dispose();
    }

    #[test]
    fn timer_becomes_readable_after_expiry() {
        let timer = Timer::new().unwrap();
        timer.arm(10);
        let mut fds = [PollFd::new(timer.fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, 1000).unwrap();
        assert_eq!(n, 1);
        timer.dispose();
    }

    #[test]
    fn disarmed_timer_stays_silent() {
        let timer = Timer::new().unwrap();
        timer.arm(10);
        timer.disarm();
        let mut fds = [PollFd::new(timer.fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, 50).unwrap();
        assert_eq!(n, 0);
        timer.dispose();
    }
}
