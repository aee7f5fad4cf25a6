//! Edge-triggered I/O and the UDP datagram path.

mod common;

use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gyre::{Action, Conn, Error, EventHandler, Options};

use common::{get_available_port, wait_for_engine};

#[derive(Default)]
struct Echo {
    closed: AtomicUsize,
}

impl EventHandler for Echo {
    fn on_traffic(&self, conn: &mut Conn) -> Action {
        let data = conn.next(conn.inbound_len());
        let _ = conn.write(&data);
        Action::None
    }

    fn on_close(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }
}

#[test]
fn edge_triggered_echo_bulk() {
    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let handler = Arc::new(Echo::default());
    let server_handler = handler.clone();

    let addr_clone = addr.clone();
    let server = thread::spawn(move || {
        gyre::run(
            server_handler,
            &[&addr_clone],
            Options::default()
                .with_num_event_loop(2)
                .with_edge_triggered_io(true),
        )
    });

    let engine = wait_for_engine(&addr);

    // Big enough to span many reads within one edge notification.
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 241) as u8).collect();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let writer_payload = payload.clone();
    let mut writer = stream.try_clone().unwrap();
    let producer = thread::spawn(move || {
        writer.write_all(&writer_payload).unwrap();
    });

    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed).unwrap();
    producer.join().unwrap();
    assert_eq!(echoed, payload);

    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn udp_echo_datagrams() {
    let port = get_available_port();
    let addr = format!("udp://127.0.0.1:{port}");
    let handler = Arc::new(Echo::default());
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

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    socket.connect(("127.0.0.1", port)).unwrap();

    for i in 0..10u32 {
        let msg = format!("datagram-{i}");
        socket.send(msg.as_bytes()).unwrap();
        let mut buf = [0u8; 64];
        let n = socket.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], msg.as_bytes());
    }

    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn callback_panic_closes_only_that_connection() {
    struct Panicky;
    impl EventHandler for Panicky {
        fn on_traffic(&self, conn: &mut Conn) -> Action {
            let data = conn.next(conn.inbound_len());
            if data.starts_with(b"boom") {
                panic!("handler exploded");
            }
            let _ = conn.write(&data);
            Action::None
        }
    }

    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let addr_clone = addr.clone();
    let server = thread::spawn(move || {
        gyre::run(
            Panicky,
            &[&addr_clone],
            Options::default().with_num_event_loop(1),
        )
    });

    let engine = wait_for_engine(&addr);

    // First connection panics the handler; the loop must survive.
    let mut bad = TcpStream::connect(("127.0.0.1", port)).unwrap();
    bad.write_all(b"boom").unwrap();
    bad.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(bad.read(&mut buf).unwrap_or(0), 0, "panicking conn closes");

    // A second connection still echoes.
    let mut good = TcpStream::connect(("127.0.0.1", port)).unwrap();
    good.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    good.write_all(b"fine").unwrap();
    let mut buf = [0u8; 4];
    good.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"fine");

    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}
