//! Basic scheduler example
//!
//! Spawns a batch of coroutines on an IO manager, shows yielding,
//! coroutine-aware sleep and a repeating timer.
//!
//! # Environment Variables
//!
//! - `WEFT_FLUSH_EPRINT=1` - Flush debug output immediately
//! - `WEFT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft::{hook, init_logging, kinfo, IoManager, ScheduleExt};

// WEFT_LOG_LEVEL=debug WEFT_FLUSH_EPRINT=1 cargo run -p weft-basic
fn main() {
    println!("=== weft basic example ===\n");

    init_logging();

    // Caller participates, plus one background worker.
    let iom = IoManager::new("basic", true, 2);

    let completed = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let c = completed.clone();
        iom.schedule(move || {
            kinfo!("[task {}] started", i);
            for j in 0..3 {
                kinfo!("[task {}] step {}", i, j);
                weft::yield_now();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    let c = completed.clone();
    iom.schedule(move || {
        kinfo!("[sleeper] going down for 200ms");
        hook::sleep(Duration::from_millis(200));
        kinfo!("[sleeper] awake");
        c.fetch_add(1, Ordering::SeqCst);
    });

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let timer = iom.add_timer(
        Duration::from_millis(50),
        move || {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            kinfo!("[timer] tick {}", n);
        },
        true,
    );

    // Stop once everything has finished.
    {
        let iom2 = iom.clone();
        let c = completed.clone();
        iom.add_timer(
            Duration::from_millis(400),
            move || {
                kinfo!("[main] {} tasks completed, stopping", c.load(Ordering::SeqCst));
                iom2.stop();
            },
            false,
        );
    }

    iom.start();
    iom.cancel_timer(&timer);
    iom.join();

    println!(
        "\ncompleted {} tasks, {} timer ticks",
        completed.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst)
    );
}
