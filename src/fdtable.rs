/*!
The descriptor table: one entry per fd, allocated once for the whole
process, holding two independent readiness state machines (reader side
and writer side), two lock-free wait lists, and the fd's lifecycle word.

Edge-triggered epoll tells us once per not-ready -> ready transition, so
each side keeps a four-state belief about the kernel:

- `PARKED`   - the kernel has nothing for this side (reader: no bytes,
               writer: buffer full). Arrivals enqueue a wait node and
               suspend; the next edge wakes them.
- `READY`    - an edge has been seen and not yet consumed. The next
               arrival attempts the syscall.
- `INFLIGHT` - some fiber is in the syscall right now. Other arrivals
               attempt anyway; an edge may cover more than one of them.
- `UNCERTAIN`- a syscall came back ambiguous (full-length read, mid-call
               edge). Nobody can prove the kernel is drained: try once
               and find out.

Every transition is a CAS and every wait-list hand-off is a steal (swap
to null), so the table takes no locks anywhere.
*/

use crate::fiber::{FiberRecord, WAKE_NONE};
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering::SeqCst};

// Per-side states. For the reader, PARKED means the kernel has no bytes;
// for the writer it means the kernel buffer is full. The other three mean
// the same thing on both sides.
pub const PARKED: u32 = 0;
pub const UNCERTAIN: u32 = 1;
pub const INFLIGHT: u32 = 2;
pub const READY: u32 = 3;

// Lifecycle of a table entry. Advances NOT_INITED -> INITIALIZING ->
// {NONBLOCKING, THREADPOOL}; only close() takes it back to NOT_INITED.
pub const NOT_INITED: u32 = 0;
pub const INITIALIZING: u32 = 1;
pub const NONBLOCKING: u32 = 2;
pub const THREADPOOL: u32 = 3;

/// A record linked into one side's wait list. It lives on the parked
/// fiber's stack: the moment that fiber is scheduled the node is dead,
/// so a stealer copies everything out of a node before marking it
/// `released`, and never touches it again afterwards.
pub struct WaitNode {
    pub fiber: AtomicPtr<FiberRecord>,
    next: AtomicPtr<WaitNode>,
    released: AtomicBool,
}

impl WaitNode {
    pub fn new(fiber: *mut FiberRecord) -> WaitNode {
        WaitNode {
            fiber: AtomicPtr::new(fiber),
            next: AtomicPtr::new(ptr::null_mut()),
            released: AtomicBool::new(false),
        }
    }

    /// True once no stealer will touch this node again. A parker that
    /// wants its stack back without having been woken through this node
    /// spins on this.
    pub fn is_released(&self) -> bool {
        self.released.load(SeqCst)
    }
}

/// One side (reader or writer) of a descriptor entry.
pub struct Side {
    pub state: AtomicU32,
    waiters: AtomicPtr<WaitNode>,
}

impl Side {
    /// Link `node` at the head of the wait list. Fails if the head moved
    /// under us; the caller retries its whole attempt.
    pub fn try_enqueue(&self, node: *mut WaitNode) -> bool {
        let head = self.waiters.load(SeqCst);
        unsafe { (*node).next.store(head, SeqCst) };
        self.waiters
            .compare_exchange(head, node, SeqCst, SeqCst)
            .is_ok()
    }

    /// Take the whole wait list. Whoever steals it owns every node in it
    /// until it marks them released.
    pub fn steal_waiters(&self) -> *mut WaitNode {
        self.waiters.swap(ptr::null_mut(), SeqCst)
    }

    /// Steal the list and wake every fiber on it, handing `wake_fd` to
    /// each.
    pub fn schedule(&self, wake_fd: RawFd) {
        let mut node = self.steal_waiters();
        while !node.is_null() {
            // Copy out next and fiber before releasing: the node dies
            // with the wakened fiber's stack frame.
            let next = unsafe { (*node).next.load(SeqCst) };
            let fiber = unsafe { (*node).fiber.swap(ptr::null_mut(), SeqCst) };
            unsafe { (*node).released.store(true, SeqCst) };
            if !fiber.is_null() {
                wake(fiber, wake_fd);
            }
            node = next;
        }
    }

    /// Unlink `mine` after its parker was woken through some other node
    /// (or timed out). The list is stolen wholesale: every other fiber
    /// found on it gets a spurious wake and re-parks, and if a
    /// concurrent stealer already holds `mine` we wait for it to let
    /// go. On return the node's storage may be reused.
    pub fn reclaim(&self, mine: *mut WaitNode, wake_fd: RawFd) {
        let mut node = self.steal_waiters();
        let mut found = false;
        while !node.is_null() {
            let next = unsafe { (*node).next.load(SeqCst) };
            if node == mine {
                found = true;
            } else {
                let fiber = unsafe { (*node).fiber.swap(ptr::null_mut(), SeqCst) };
                unsafe { (*node).released.store(true, SeqCst) };
                if !fiber.is_null() {
                    wake(fiber, wake_fd);
                }
            }
            node = next;
        }
        if !found {
            while !unsafe { &*mine }.is_released() {
                std::hint::spin_loop();
            }
        }
    }

    /// Apply one edge-triggered readiness event to this side. Runs on
    /// the event-loop thread only, but races with fibers moving the
    /// state from inside the syscall protocol.
    pub fn on_event(&self, fd: RawFd) {
        loop {
            match self.state.load(SeqCst) {
                PARKED => {
                    if self
                        .state
                        .compare_exchange(PARKED, READY, SeqCst, SeqCst)
                        .is_ok()
                    {
                        self.schedule(fd);
                        return;
                    }
                }
                UNCERTAIN => {
                    if self
                        .state
                        .compare_exchange(UNCERTAIN, READY, SeqCst, SeqCst)
                        .is_ok()
                    {
                        return;
                    }
                }
                INFLIGHT => {
                    if self
                        .state
                        .compare_exchange(INFLIGHT, UNCERTAIN, SeqCst, SeqCst)
                        .is_ok()
                    {
                        return;
                    }
                    // The fiber in the syscall concluded the kernel was
                    // drained and parked the side just before our edge.
                    if self
                        .state
                        .compare_exchange(PARKED, UNCERTAIN, SeqCst, SeqCst)
                        .is_ok()
                    {
                        self.schedule(fd);
                        return;
                    }
                }
                READY => {
                    // A previous edge was never consumed; re-wake anyone
                    // who queued since. Idempotent.
                    self.schedule(fd);
                    return;
                }
                s => panic!("bad side state ({}). Please report this error.", s),
            }
        }
    }
}

/// Claim the fiber's park guard and hand it to its owner worker. A fiber
/// parked behind several wait nodes (poll over many fds plus a timer) is
/// pushed exactly once: only the CAS winner gets to schedule it.
pub fn wake(fiber: *mut FiberRecord, wake_fd: RawFd) {
    let rec = unsafe { &*fiber };
    if rec
        .wake_fd
        .compare_exchange(WAKE_NONE, wake_fd, SeqCst, SeqCst)
        .is_ok()
    {
        crate::pool::push_to_owner(fiber);
    }
}

#[repr(C)]
pub struct FdEntry {
    lifecycle: AtomicU32,
    pub reader: Side,
    pub writer: Side,
}

impl FdEntry {
    pub fn lifecycle(&self) -> u32 {
        self.lifecycle.load(SeqCst)
    }

    /// First toucher wins the right to register the fd.
    pub fn try_begin_init(&self) -> bool {
        self.lifecycle
            .compare_exchange(NOT_INITED, INITIALIZING, SeqCst, SeqCst)
            .is_ok()
    }

    /// Publish the entry. The reader starts parked (registration itself
    /// delivers an edge if the fd is already readable); the writer
    /// starts ready (a fresh fd almost always has buffer space, and the
    /// first write finds out).
    pub fn finish_init(&self, which: u32) {
        debug_assert!(which == NONBLOCKING || which == THREADPOOL);
        self.reader.state.store(PARKED, SeqCst);
        self.writer.state.store(READY, SeqCst);
        self.lifecycle.store(which, SeqCst);
    }

    /// Registration failed; let someone else retry from scratch.
    pub fn abort_init(&self) {
        self.lifecycle.store(NOT_INITED, SeqCst);
    }

    /// First half of close: take the entry out of the table before the
    /// real close, so a reused fd number re-registers from scratch.
    pub fn begin_close(&self) {
        self.lifecycle.store(NOT_INITED, SeqCst);
    }

    /// Second half of close, after the real close. Both sides go to
    /// READY so that every parked fiber we wake retries its syscall and
    /// observes the dead fd.
    pub fn wake_all_on_close(&self, fd: RawFd) {
        self.reader.state.store(READY, SeqCst);
        self.writer.state.store(READY, SeqCst);
        self.reader.schedule(fd);
        self.writer.schedule(fd);
    }
}

/// The process-wide table: a single anonymous mapping indexed by fd,
/// sized to RLIMIT_NOFILE up front and never resized. Zeroed pages are a
/// valid table (every entry NOT_INITED).
pub struct FdTable {
    base: *mut FdEntry,
    len: usize,
}

unsafe impl Send for FdTable {}
unsafe impl Sync for FdTable {}

// Backstop for absurd RLIMIT_NOFILE settings (or RLIM_INFINITY).
const MAX_ENTRIES: usize = 1 << 20;

impl FdTable {
    pub fn new() -> FdTable {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) };
        assert_eq!(rc, 0, "getrlimit(RLIMIT_NOFILE) failed");
        let len = (lim.rlim_cur as usize).min(MAX_ENTRIES).max(64);
        let bytes = len * mem::size_of::<FdEntry>();
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(base != libc::MAP_FAILED, "descriptor table mmap failed");
        FdTable {
            base: base as *mut FdEntry,
            len,
        }
    }

    /// The entry for `fd`, or None for fds the table cannot track
    /// (negative, or beyond the mapping).
    pub fn entry(&self, fd: RawFd) -> Option<&FdEntry> {
        if fd < 0 || fd as usize >= self.len {
            return None;
        }
        Some(unsafe { &*self.base.add(fd as usize) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberRecord;
    use crate::test_util::QUEUE_LOCK;

    fn side(state: u32) -> Side {
        Side {
            state: AtomicU32::new(state),
            waiters: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn parked_fiber(worker: usize) -> *mut FiberRecord {
        let rec = FiberRecord::new(worker, Box::new(|| {})).unwrap();
        rec.wake_fd.store(WAKE_NONE, SeqCst);
        Box::into_raw(rec)
    }

    // Run the (empty) entry so the record can be dropped.
    fn finish(f: *mut FiberRecord) {
        crate::fiber::set_current(f);
        assert_eq!(unsafe { (*f).resume() }, Ok(()));
        crate::fiber::set_current(ptr::null_mut());
        drop(unsafe { Box::from_raw(f) });
    }

    #[test]
    fn edge_on_parked_side_becomes_ready() {
        let s = side(PARKED);
        s.on_event(7);
        assert_eq!(s.state.load(SeqCst), READY);
    }

    #[test]
    fn edge_on_uncertain_side_becomes_ready() {
        let s = side(UNCERTAIN);
        s.on_event(7);
        assert_eq!(s.state.load(SeqCst), READY);
    }

    #[test]
    fn edge_during_syscall_leaves_uncertainty() {
        let s = side(INFLIGHT);
        s.on_event(7);
        assert_eq!(s.state.load(SeqCst), UNCERTAIN);
    }

    #[test]
    fn edge_on_ready_side_is_idempotent() {
        let s = side(READY);
        s.on_event(7);
        assert_eq!(s.state.load(SeqCst), READY);
    }

    #[test]
    fn enqueue_steal_preserves_all_nodes() {
        let _g = QUEUE_LOCK.lock().unwrap();
        let s = side(PARKED);
        let f1 = parked_fiber(0);
        let f2 = parked_fiber(0);
        let mut n1 = WaitNode::new(f1);
        let mut n2 = WaitNode::new(f2);
        assert!(s.try_enqueue(&mut n1));
        assert!(s.try_enqueue(&mut n2));
        let mut seen = vec![];
        let mut head = s.steal_waiters();
        while !head.is_null() {
            seen.push(unsafe { (*head).fiber.load(SeqCst) });
            head = unsafe { (*head).next.load(SeqCst) };
        }
        assert_eq!(seen, vec![f2, f1]); // LIFO
        assert!(s.steal_waiters().is_null()); // steal took everything
        finish(f1);
        finish(f2);
    }

    #[test]
    fn schedule_claims_each_fiber_once_and_releases_nodes() {
        let _g = QUEUE_LOCK.lock().unwrap();
        let s = side(PARKED);
        let f = parked_fiber(0);
        // Two nodes for one fiber, the shape poll() creates.
        let mut n1 = WaitNode::new(f);
        let mut n2 = WaitNode::new(f);
        assert!(s.try_enqueue(&mut n1));
        assert!(s.try_enqueue(&mut n2));
        s.schedule(9);
        assert!(n1.is_released());
        assert!(n2.is_released());
        // Only one claim went through.
        assert_eq!(unsafe { (*f).wake_fd.load(SeqCst) }, 9);
        // Exactly one queue push happened.
        let rt = crate::runtime();
        let drained = rt.workers[0].queue.steal_all_for_test();
        assert_eq!(drained, vec![f]);
        finish(f);
    }

    #[test]
    fn table_rejects_untrackable_fds() {
        let t = FdTable::new();
        assert!(t.entry(-1).is_none());
        assert!(t.entry(i32::MAX).is_none());
        assert!(t.entry(0).is_some());
    }
}
