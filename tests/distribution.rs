//! Load-balancing distribution across event loops.

mod common;

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gyre::{Action, Conn, Error, EventHandler, LoadBalancing, Options};

use common::{get_available_port, wait_for, wait_for_engine};

const MAX_LOOPS: usize = 8;

/// Counts `on_open` per event-loop index.
#[derive(Default)]
struct PerLoopCounter {
    opened: [AtomicUsize; MAX_LOOPS],
    closed: AtomicUsize,
}

impl EventHandler for PerLoopCounter {
    fn on_open(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        let idx = conn.event_loop_index();
        assert!(idx >= 0 && (idx as usize) < MAX_LOOPS);
        self.opened[idx as usize].fetch_add(1, Ordering::SeqCst);
        (None, Action::None)
    }

    fn on_close(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }
}

#[test]
fn round_robin_spreads_accepts_evenly() {
    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let handler = Arc::new(PerLoopCounter::default());
    let server_handler = handler.clone();

    const LOOPS: usize = 4;
    const CONNS: usize = 32;

    let addr_clone = addr.clone();
    let server = thread::spawn(move || {
        gyre::run(
            server_handler,
            &[&addr_clone],
            Options::default()
                .with_num_event_loop(LOOPS)
                .with_load_balancing(LoadBalancing::RoundRobin),
        )
    });

    let engine = wait_for_engine(&addr);

    let mut clients = Vec::with_capacity(CONNS);
    for _ in 0..CONNS {
        clients.push(TcpStream::connect(("127.0.0.1", port)).unwrap());
    }
    let total = || -> usize {
        (0..LOOPS)
            .map(|i| handler.opened[i].load(Ordering::SeqCst))
            .sum()
    };
    assert!(wait_for(Duration::from_secs(5), || total() == CONNS));

    // With a round-robin cursor, per-loop counts differ by at most one.
    let counts: Vec<usize> = (0..LOOPS)
        .map(|i| handler.opened[i].load(Ordering::SeqCst))
        .collect();
    let min = counts.iter().min().unwrap();
    let max = counts.iter().max().unwrap();
    assert!(
        max - min <= 1,
        "uneven round-robin distribution: {counts:?}"
    );

    drop(clients);
    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn reuse_port_distributes_across_loops() {
    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let handler = Arc::new(PerLoopCounter::default());
    let server_handler = handler.clone();

    const LOOPS: usize = 4;
    const CONNS: usize = 400;

    let addr_clone = addr.clone();
    let server = thread::spawn(move || {
        gyre::run(
            server_handler,
            &[&addr_clone],
            Options::default()
                .with_num_event_loop(LOOPS)
                .with_reuse_port(true),
        )
    });

    let engine = wait_for_engine(&addr);

    let mut clients = Vec::with_capacity(CONNS);
    for _ in 0..CONNS {
        clients.push(TcpStream::connect(("127.0.0.1", port)).unwrap());
    }
    let total = || -> usize {
        (0..LOOPS)
            .map(|i| handler.opened[i].load(Ordering::SeqCst))
            .sum()
    };
    assert!(wait_for(Duration::from_secs(10), || total() == CONNS));

    // The kernel hashes the 4-tuple across the SO_REUSEPORT group; every
    // loop should see a meaningful share.
    let counts: Vec<usize> = (0..LOOPS)
        .map(|i| handler.opened[i].load(Ordering::SeqCst))
        .collect();
    for (i, &count) in counts.iter().enumerate() {
        assert!(
            count > 0,
            "loop {i} accepted nothing with SO_REUSEPORT: {counts:?}"
        );
    }

    drop(clients);
    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn source_addr_hash_pins_a_peer_to_one_loop() {
    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let handler = Arc::new(PerLoopCounter::default());
    let server_handler = handler.clone();

    const LOOPS: usize = 4;
    const CONNS: usize = 16;

    let addr_clone = addr.clone();
    let server = thread::spawn(move || {
        gyre::run(
            server_handler,
            &[&addr_clone],
            Options::default()
                .with_num_event_loop(LOOPS)
                .with_load_balancing(LoadBalancing::SourceAddrHash),
        )
    });

    let engine = wait_for_engine(&addr);

    // All connections share 127.0.0.1, so all land on the same loop.
    let mut clients = Vec::with_capacity(CONNS);
    for _ in 0..CONNS {
        clients.push(TcpStream::connect(("127.0.0.1", port)).unwrap());
    }
    let total = || -> usize {
        (0..LOOPS)
            .map(|i| handler.opened[i].load(Ordering::SeqCst))
            .sum()
    };
    assert!(wait_for(Duration::from_secs(5), || total() == CONNS));

    let busy: Vec<usize> = (0..LOOPS)
        .filter(|&i| handler.opened[i].load(Ordering::SeqCst) > 0)
        .collect();
    assert_eq!(busy.len(), 1, "source-hash should pin one loop");
    assert_eq!(
        handler.opened[busy[0]].load(Ordering::SeqCst),
        CONNS
    );

    drop(clients);
    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}
