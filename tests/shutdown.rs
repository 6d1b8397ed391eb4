//! Graceful shutdown: the pool winds itself down when the last fiber
//! exits, and `stop_loop` joins everything.

use std::ptr;
use std::time::{Duration, Instant};

#[test]
fn start_stop_joins_once_all_fibers_exit() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t0 = Instant::now();
    for _ in 0..8 {
        fiber_pool::spawn(|| {
            unsafe { fiber_pool::poll(ptr::null_mut(), 0, 10) };
        });
    }
    fiber_pool::start_loop();
    fiber_pool::stop_loop();
    assert_eq!(fiber_pool::alive(), 0);
    assert!(
        t0.elapsed() < Duration::from_secs(10),
        "shutdown took {:?}",
        t0.elapsed()
    );
}
