//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::net::TcpListener;
use std::time::{Duration, Instant};

/// Install a subscriber so `RUST_LOG=gyre=debug cargo test` shows engine
/// logs. Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Grab a free port by binding port 0 and letting the listener drop.
pub fn get_available_port() -> u16 {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Spin until `cond` holds or the deadline passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Block until the engine registered under `proto_addr` is up.
pub fn wait_for_engine(proto_addr: &str) -> gyre::Engine {
    assert!(
        wait_for(Duration::from_secs(5), || gyre::find(proto_addr).is_some()),
        "engine at {proto_addr} did not come up"
    );
    gyre::find(proto_addr).unwrap()
}
