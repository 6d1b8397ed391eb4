/*!
The blocking fallback: descriptors epoll refuses to watch (regular
files, block devices) get their syscalls executed verbatim on a small
pool of plain OS threads, while the calling fiber parks. The pool thread
writes the result into a slot on the fiber's stack and schedules the
fiber through the normal wake path.
*/

use crate::fiber::{self, WAKE_NONE};
use lazy_static::lazy_static;
use libc::{c_long, ssize_t};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering::SeqCst};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

const POOL_THREADS: usize = 4;

struct Job {
    nr: c_long,
    args: [usize; 6],
    slot: *mut Slot,
}

// The slot outlives the job: the submitting fiber stays suspended until
// the pool thread has stored the result and scheduled it.
unsafe impl Send for Job {}

struct Slot {
    result: AtomicI64,
    err: AtomicI32,
    fiber: *mut fiber::FiberRecord,
}

lazy_static! {
    static ref QUEUE: Mutex<mpsc::Sender<Job>> = {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..POOL_THREADS {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("fiber-blocking-{}", i))
                .spawn(move || loop {
                    let job = match rx.lock().unwrap().recv() {
                        Ok(j) => j,
                        Err(_) => return,
                    };
                    let ret = unsafe {
                        libc::syscall(
                            job.nr,
                            job.args[0],
                            job.args[1],
                            job.args[2],
                            job.args[3],
                            job.args[4],
                            job.args[5],
                        )
                    };
                    let err = if ret < 0 {
                        unsafe { *libc::__errno_location() }
                    } else {
                        0
                    };
                    unsafe {
                        (*job.slot).result.store(ret as i64, SeqCst);
                        (*job.slot).err.store(err, SeqCst);
                        // Store before wake: the slot dies with the
                        // fiber's frame once it runs.
                        let f = (*job.slot).fiber;
                        crate::fdtable::wake(f, job.args[0] as RawFd);
                    }
                })
                .expect("blocking pool thread spawn failed");
        }
        Mutex::new(tx)
    };
}

/// Perform the syscall on a pool thread and hand its result (and errno)
/// back to the calling fiber. Caller must be a fiber.
pub(crate) unsafe fn run_on_pool(nr: c_long, args: [usize; 6]) -> ssize_t {
    let cur = fiber::current();
    debug_assert!(!cur.is_null());
    let slot = Slot {
        result: AtomicI64::new(0),
        err: AtomicI32::new(0),
        fiber: cur,
    };
    (*cur).wake_fd.store(WAKE_NONE, SeqCst);
    QUEUE
        .lock()
        .unwrap()
        .send(Job {
            nr,
            args,
            slot: &slot as *const Slot as *mut Slot,
        })
        .expect("blocking pool is gone");
    fiber::suspend_current(&*cur);
    let ret = slot.result.load(SeqCst);
    if ret < 0 {
        *libc::__errno_location() = slot.err.load(SeqCst);
        return -1;
    }
    ret as ssize_t
}
