//! Runs in its own process so the claim layout is exactly what is set up
//! here: raw-index posts that collide with a claim keep working, they are
//! only surfaced as a configuration warning.

use std::sync::atomic::{AtomicUsize, Ordering};

use drogue_taskq::{init_taskq, task};
use simple_logger::SimpleLogger;

#[test]
fn raw_posts_into_a_claimed_slot_still_land() {
    SimpleLogger::new().init().unwrap();

    init_taskq!(slots: 4, payload: 64);

    let uart = task::claim("uart").unwrap();
    let index = uart.index();
    assert_eq!(index, 3);

    static HITS: AtomicUsize = AtomicUsize::new(0);

    // a hand-numbered call site colliding with the claim still posts
    task::post(
        || {
            HITS.fetch_add(1, Ordering::Relaxed);
        },
        index,
    )
    .unwrap();
    assert!(uart.is_pending());

    task::run_taskq();
    assert_eq!(HITS.load(Ordering::Relaxed), 1);
    assert!(!uart.is_pending());

    // the strict flavor takes the same path once the slot is free again
    task::post_once(
        || {
            HITS.fetch_add(10, Ordering::Relaxed);
        },
        index,
    )
    .unwrap();

    task::run_taskq();
    assert_eq!(HITS.load(Ordering::Relaxed), 11);
}
