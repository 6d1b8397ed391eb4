/*!
The fiber record and the suspendable-execution glue.

A fiber is a stackful coroutine bound for life to one worker. The record
carries the pieces the rest of the runtime pokes at from other threads:
the run-queue link, the owner index, and the `wake_fd` slot, which doubles
as the once-per-park wake guard.
*/

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering::SeqCst};
use wasmtime_fiber::{Fiber, FiberStack, Suspend};

/// Stack for each fiber, including the guard page the allocator adds.
pub const STACK_SIZE: usize = 256 * 1024;

/// `wake_fd` while parked and unclaimed. A waker takes ownership of the
/// fiber by CASing this to the fd that became ready; losing the race
/// means someone else already scheduled it.
pub const WAKE_NONE: i32 = -1;
/// `wake_fd` while the fiber is running or queued, i.e. not claimable.
pub const WAKE_RUNNING: i32 = -2;

type Entry = Box<dyn FnOnce() + Send + 'static>;
type FiberImpl = Fiber<'static, (), (), ()>;
type SuspendImpl = Suspend<(), (), ()>;

pub struct FiberRecord {
    /// Link used while sitting in the owner worker's run queue.
    pub qnext: AtomicPtr<FiberRecord>,
    /// Owning worker index; fixed at spawn, the fiber never migrates.
    pub worker: usize,
    /// Written by whoever wakes the fiber: the fd that became ready, or
    /// the timer fd on a timeout. See `WAKE_NONE` for the guard protocol.
    pub wake_fd: AtomicI32,
    fiber: Option<FiberImpl>,
    /// Set by the fiber itself on first entry; how the interceptor gives
    /// the thread back to the worker.
    suspend: Cell<*mut SuspendImpl>,
}

// The record is handed around as a raw pointer: producers touch only the
// atomics, and `fiber`/`suspend` are touched only by the owner worker
// (or by the fiber running on it).
unsafe impl Send for FiberRecord {}
unsafe impl Sync for FiberRecord {}

impl FiberRecord {
    pub fn new(worker: usize, entry: Entry) -> std::io::Result<Box<FiberRecord>> {
        let mut rec = Box::new(FiberRecord {
            qnext: AtomicPtr::new(ptr::null_mut()),
            worker,
            wake_fd: AtomicI32::new(WAKE_RUNNING),
            fiber: None,
            suspend: Cell::new(ptr::null_mut()),
        });
        let me: *mut FiberRecord = &mut *rec;
        let stack = FiberStack::new(STACK_SIZE, false).map_err(std::io::Error::other)?;
        let fiber = Fiber::new(stack, move |(), suspend: &mut SuspendImpl| {
            // Runs on the fiber's own stack. The suspend handle lives in
            // this frame, so its address is stable until the entry
            // returns.
            unsafe { (*me).suspend.set(suspend as *mut SuspendImpl) };
            entry();
        })
        .map_err(std::io::Error::other)?;
        rec.fiber = Some(fiber);
        Ok(rec)
    }

    /// Run the fiber until it suspends (`Err`) or its entry returns
    /// (`Ok`). Must only be called by the owner worker, with the
    /// thread-local current fiber pointing at this record.
    pub fn resume(&self) -> Result<(), ()> {
        self.fiber.as_ref().unwrap().resume(())
    }
}

/// Give the thread back to the worker. Returns when the fiber is next
/// resumed.
pub fn suspend_current(rec: &FiberRecord) {
    let s = rec.suspend.get();
    debug_assert!(!s.is_null(), "fiber suspended before first entry");
    unsafe { (*s).suspend(()) };
}

thread_local! {
    static CURRENT: Cell<*mut FiberRecord> = Cell::new(ptr::null_mut());
}

pub fn set_current(rec: *mut FiberRecord) {
    CURRENT.with(|c| c.set(rec));
}

/// The fiber this worker thread is currently running, or null on
/// non-fiber threads (the event loop, the blocking pool, user threads).
pub fn current() -> *mut FiberRecord {
    CURRENT.with(|c| c.get())
}

/// Open the park window: after this, a waker may claim the fiber at any
/// moment. Callers publish whatever the waker needs (a wait node, an AIO
/// submission) after preparing and before `park`.
pub fn park_prepare() {
    let rec = current();
    assert!(!rec.is_null(), "park_prepare called outside a fiber");
    unsafe { (*rec).wake_fd.store(WAKE_NONE, SeqCst) };
}

/// Suspend until a waker schedules the fiber; returns the fd the waker
/// stored. `park_prepare` must have been called first.
pub fn park() -> RawFd {
    let rec = current();
    assert!(!rec.is_null(), "park called outside a fiber");
    let rec = unsafe { &*rec };
    suspend_current(rec);
    rec.wake_fd.load(SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_and_resume_roundtrip() {
        let rec = FiberRecord::new(
            0,
            Box::new(|| {
                let me = current();
                assert!(!me.is_null());
                suspend_current(unsafe { &*me });
            }),
        )
        .unwrap();
        let p = Box::into_raw(rec);
        set_current(p);
        assert_eq!(unsafe { (*p).resume() }, Err(())); // suspended mid-entry
        assert_eq!(unsafe { (*p).resume() }, Ok(())); // ran to completion
        set_current(ptr::null_mut());
        drop(unsafe { Box::from_raw(p) });
    }

    #[test]
    fn entry_runs_on_resume_not_spawn() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;
        let hit = Arc::new(AtomicBool::new(false));
        let hit2 = hit.clone();
        let rec = FiberRecord::new(0, Box::new(move || hit2.store(true, SeqCst))).unwrap();
        assert!(!hit.load(SeqCst));
        let p = Box::into_raw(rec);
        set_current(p);
        assert_eq!(unsafe { (*p).resume() }, Ok(()));
        set_current(ptr::null_mut());
        assert!(hit.load(SeqCst));
        drop(unsafe { Box::from_raw(p) });
    }
}
