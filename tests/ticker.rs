//! The on_tick timer: handler-scheduled intervals and shutdown via tick
//! action.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gyre::{Action, EventHandler, Options};

use common::{get_available_port, wait_for_engine};

/// Ticks every 20ms; asks for shutdown on the fifth tick.
#[derive(Default)]
struct FiveTicks {
    ticks: AtomicUsize,
}

impl EventHandler for FiveTicks {
    fn on_tick(&self) -> (Duration, Action) {
        let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= 5 {
            (Duration::from_millis(20), Action::Shutdown)
        } else {
            (Duration::from_millis(20), Action::None)
        }
    }
}

#[test]
fn tick_shutdown_stops_the_engine() {
    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let handler = Arc::new(FiveTicks::default());
    let server_handler = handler.clone();

    let addr_clone = addr.clone();
    let server = thread::spawn(move || {
        gyre::run(
            server_handler,
            &[&addr_clone],
            Options::default().with_num_event_loop(1).with_ticker(true),
        )
    });

    wait_for_engine(&addr);

    // The fifth tick requests shutdown; run() must return on its own.
    server.join().unwrap().unwrap();
    assert!(handler.ticks.load(Ordering::SeqCst) >= 5);
    assert!(gyre::find(&addr).is_none());
}
