/*!
The worker pool: one pinned OS thread per logical CPU, each owning an
intrusive run queue gated by an eventfd, plus the spawn-side load
balancing.

A queue is a lock-free LIFO of fiber records linked through `qnext`;
producers (spawners, the event loop, offload threads) push with a head
CAS and trigger the worker's event, and the single consumer steals the
whole list and replays it in arrival order. Same steal discipline as the
descriptor wait lists, one level up.
*/

use crate::event::Event;
use crate::fiber::{self, FiberRecord};
use log::{debug, error};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use rand::Rng;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::SeqCst};

pub struct RunQueue {
    head: AtomicPtr<FiberRecord>,
    pub event: Event,
}

impl RunQueue {
    fn new() -> RunQueue {
        RunQueue {
            head: AtomicPtr::new(ptr::null_mut()),
            event: Event::new(),
        }
    }

    /// Many producers; the eventfd trigger after the push is what wakes
    /// the sleeping consumer.
    pub fn push(&self, f: *mut FiberRecord) {
        loop {
            let head = self.head.load(SeqCst);
            unsafe { (*f).qnext.store(head, SeqCst) };
            if self.head.compare_exchange(head, f, SeqCst, SeqCst).is_ok() {
                break;
            }
        }
        self.event.trigger();
    }

    /// Steal everything pushed so far and hand it back in push order.
    /// Single consumer: only the owning worker calls this.
    fn steal_all(&self) -> *mut FiberRecord {
        let mut head = self.head.swap(ptr::null_mut(), SeqCst);
        let mut out: *mut FiberRecord = ptr::null_mut();
        while !head.is_null() {
            let next = unsafe { (*head).qnext.load(SeqCst) };
            unsafe { (*head).qnext.store(out, SeqCst) };
            out = head;
            head = next;
        }
        out
    }

    #[cfg(test)]
    pub fn steal_all_for_test(&self) -> Vec<*mut FiberRecord> {
        let mut v = vec![];
        let mut f = self.steal_all();
        while !f.is_null() {
            v.push(f);
            f = unsafe { (*f).qnext.load(SeqCst) };
        }
        v
    }
}

pub struct Worker {
    pub queue: RunQueue,
    /// Fibers ever assigned here by spawn. Read (racily, that is fine)
    /// by the choice-of-two balancer. Never decremented.
    pub assigned: AtomicUsize,
}

impl Worker {
    pub fn new() -> Worker {
        Worker {
            queue: RunQueue::new(),
            assigned: AtomicUsize::new(0),
        }
    }
}

/// Two distinct uniform indices, two loads, take the lighter one. Two
/// atomic loads per spawn buy O(log log n) expected imbalance.
pub fn pick_worker(workers: &[Worker]) -> usize {
    if workers.len() == 1 {
        return 0;
    }
    let mut rng = rand::thread_rng();
    let a = rng.gen_range(0..workers.len());
    let mut b = rng.gen_range(0..workers.len() - 1);
    if b >= a {
        b += 1;
    }
    if workers[a].assigned.load(SeqCst) <= workers[b].assigned.load(SeqCst) {
        a
    } else {
        b
    }
}

/// Create a fiber and hand it to a worker. The fiber belongs to that
/// worker until it terminates.
pub fn spawn<F>(entry: F)
where
    F: FnOnce() + Send + 'static,
{
    let rt = crate::runtime();
    let w = pick_worker(&rt.workers);
    rt.workers[w].assigned.fetch_add(1, SeqCst);
    rt.alive.fetch_add(1, SeqCst);
    let rec = FiberRecord::new(w, Box::new(entry)).expect("fiber stack allocation failed");
    rt.workers[w].queue.push(Box::into_raw(rec));
}

/// Requeue the current fiber behind whatever else is runnable and give
/// the worker its thread back.
pub fn yield_now() {
    let cur = fiber::current();
    if cur.is_null() {
        std::thread::yield_now();
        return;
    }
    push_to_owner(cur);
    fiber::suspend_current(unsafe { &*cur });
}

/// The single wake funnel: every scheduler (event loop, close, signal
/// bridge, offload completion, poll cleanup) lands fibers here.
pub fn push_to_owner(f: *mut FiberRecord) {
    let rt = crate::runtime();
    let w = unsafe { (*f).worker };
    rt.workers[w].queue.push(f);
}

fn pin_to_cpu(idx: usize) {
    let mut set = CpuSet::new();
    if set.set(idx).is_err() {
        return;
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        // Not fatal: containers and cpusets may forbid it.
        debug!("worker {}: sched_setaffinity failed: {}", idx, e);
    }
}

/// Body of worker thread `idx`. Runs until the last fiber in the process
/// has terminated.
pub fn worker_main(idx: usize) {
    pin_to_cpu(idx);
    let rt = crate::runtime();
    let me = &rt.workers[idx];
    while rt.alive.load(SeqCst) > 0 {
        me.queue.event.wait_and_reset();
        loop {
            let mut f = me.queue.steal_all();
            if f.is_null() {
                break;
            }
            while !f.is_null() {
                // Read the link before resuming: a fiber that parks can
                // be woken and re-pushed (relinking qnext) at any moment.
                let next = unsafe { (*f).qnext.load(SeqCst) };
                run_fiber(f);
                f = next;
            }
        }
    }
    // Chain the shutdown along in case some workers are still asleep.
    rt.terminate.trigger();
    debug!("worker {} exiting", idx);
}

fn run_fiber(f: *mut FiberRecord) {
    fiber::set_current(f);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { (*f).resume() }));
    fiber::set_current(ptr::null_mut());
    match outcome {
        Ok(Err(())) => {} // suspended; whoever wakes it owns it now
        Ok(Ok(())) => retire(f),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!("fiber terminated by panic: {}", msg);
            retire(f);
        }
    }
}

/// The entry returned (or panicked): reclaim the record and, if this was
/// the last live fiber, start the shutdown chain.
fn retire(f: *mut FiberRecord) {
    let rt = crate::runtime();
    drop(unsafe { Box::from_raw(f) });
    if rt.alive.fetch_sub(1, SeqCst) == 1 {
        rt.terminate.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steal_replays_in_push_order() {
        let q = RunQueue::new();
        let f1 = Box::into_raw(FiberRecord::new(0, Box::new(|| {})).unwrap());
        let f2 = Box::into_raw(FiberRecord::new(0, Box::new(|| {})).unwrap());
        let f3 = Box::into_raw(FiberRecord::new(0, Box::new(|| {})).unwrap());
        q.push(f1);
        q.push(f2);
        q.push(f3);
        assert_eq!(q.steal_all_for_test(), vec![f1, f2, f3]);
        assert!(q.steal_all_for_test().is_empty());
        for f in [f1, f2, f3] {
            // Never resumed: run each to completion before dropping.
            fiber::set_current(f);
            let _ = unsafe { (*f).resume() };
            fiber::set_current(ptr::null_mut());
            drop(unsafe { Box::from_raw(f) });
        }
    }

    #[test]
    fn choice_of_two_prefers_the_lighter_worker() {
        let workers = vec![Worker::new(), Worker::new()];
        workers[1].assigned.store(1000, SeqCst);
        for _ in 0..100 {
            assert_eq!(pick_worker(&workers), 0);
        }
    }

    #[test]
    fn choice_of_two_picks_two_distinct_indices() {
        // With equal loads the tie goes to `a`; over many rounds every
        // index must show up, which fails if b could collide with a.
        let workers = vec![Worker::new(), Worker::new(), Worker::new()];
        let mut seen = [false; 3];
        for _ in 0..500 {
            seen[pick_worker(&workers)] = true;
        }
        assert_eq!(seen, [true, true, true]);
    }
}
