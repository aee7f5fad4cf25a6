//! End-to-end echo over the multi-reactor topology, plus half-close
//! draining.

mod common;

use std::io::{Read, Write};
use std::net::{Shutdown as SockShutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gyre::{Action, Conn, Error, EventHandler, LoadBalancing, Options};

use common::{get_available_port, wait_for, wait_for_engine};

#[derive(Default)]
struct EchoHandler {
    opened: AtomicUsize,
    closed: AtomicUsize,
    received: AtomicUsize,
}

impl EventHandler for EchoHandler {
    fn on_open(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        (None, Action::None)
    }

    fn on_traffic(&self, conn: &mut Conn) -> Action {
        let data = conn.next(conn.inbound_len());
        self.received.fetch_add(data.len(), Ordering::SeqCst);
        let _ = conn.write(&data);
        Action::None
    }

    fn on_close(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }
}

#[test]
fn echo_round_robin_two_loops_four_clients() {
    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let handler = Arc::new(EchoHandler::default());
    let server_handler = handler.clone();

    let addr_clone = addr.clone();
    let server = thread::spawn(move || {
        gyre::run(
            server_handler,
            &[&addr_clone],
            Options::default()
                .with_num_event_loop(2)
                .with_load_balancing(LoadBalancing::RoundRobin),
        )
    });

    let engine = wait_for_engine(&addr);

    let mut clients = Vec::new();
    for _ in 0..4 {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(b"hello\n").unwrap();
        clients.push(stream);
    }

    for stream in &mut clients {
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello\n");
    }
    assert_eq!(handler.opened.load(Ordering::SeqCst), 4);

    drop(clients);
    assert!(wait_for(Duration::from_secs(5), || {
        handler.closed.load(Ordering::SeqCst) == 4
    }));

    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn half_close_delivers_all_bytes_before_on_close() {
    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let handler = Arc::new(EchoHandler::default());
    let server_handler = handler.clone();

    let addr_clone = addr.clone();
    let server = thread::spawn(move || {
        gyre::run(
            server_handler,
            &[&addr_clone],
            Options::default().with_num_event_loop(1),
        )
    });

    let engine = wait_for_engine(&addr);

    let payload = vec![0x5au8; 10 * 1024];
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(&payload).unwrap();
    stream.shutdown(SockShutdown::Write).unwrap();

    // The engine must observe every byte, then exactly one close.
    assert!(wait_for(Duration::from_secs(5), || {
        handler.closed.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(handler.received.load(Ordering::SeqCst), payload.len());

    // The echo kept flowing back on the intact read half.
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut echoed = Vec::new();
    let _ = stream.read_to_end(&mut echoed);
    assert_eq!(echoed.len(), payload.len());

    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn on_open_greeting_is_delivered() {
    struct Greeter;
    impl EventHandler for Greeter {
        fn on_open(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            (Some(b"welcome".to_vec()), Action::None)
        }
    }

    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let addr_clone = addr.clone();
    let server = thread::spawn(move || {
        gyre::run(
            Greeter,
            &[&addr_clone],
            Options::default().with_num_event_loop(1),
        )
    });

    let engine = wait_for_engine(&addr);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 7];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"welcome");

    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}
