//! The client engine: dial, enroll, traffic on client-side loops, stop.

mod common;

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gyre::{Action, Client, Conn, Error, EventHandler, Options};
use parking_lot::Mutex;

use common::wait_for;

/// Records everything the client-side loops receive.
#[derive(Default)]
struct Recorder {
    opened: AtomicUsize,
    closed: AtomicUsize,
    received: Mutex<Vec<u8>>,
}

impl EventHandler for Recorder {
    fn on_open(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        (None, Action::None)
    }

    fn on_traffic(&self, conn: &mut Conn) -> Action {
        let data = conn.next(conn.inbound_len());
        self.received.lock().extend_from_slice(&data);
        Action::None
    }

    fn on_close(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }
}

/// A plain std echo server on its own thread.
fn spawn_echo_server() -> (std::net::SocketAddr, thread::JoinHandle<()>) {
    common::init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let jh = thread::spawn(move || {
        while let Ok((mut stream, _)) = listener.accept() {
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, jh)
}

#[test]
fn dial_echo_round_trip() {
    let (server_addr, _server) = spawn_echo_server();

    let handler = Arc::new(Recorder::default());
    let mut client = Client::new(handler.clone(), Options::default().with_num_event_loop(2));
    client.start().unwrap();

    let sender = client
        .dial("tcp", &server_addr.to_string())
        .expect("dial failed");
    assert_eq!(handler.opened.load(Ordering::SeqCst), 1);

    sender.send(b"ping over gyre".to_vec()).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        handler.received.lock().as_slice() == b"ping over gyre"
    }));

    sender.close().unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        handler.closed.load(Ordering::SeqCst) == 1
    }));

    client.stop().unwrap();
}

#[test]
fn enroll_existing_stream() {
    let (server_addr, _server) = spawn_echo_server();

    let handler = Arc::new(Recorder::default());
    let mut client = Client::new(handler.clone(), Options::default().with_num_event_loop(1));
    client.start().unwrap();

    let stream = std::net::TcpStream::connect(server_addr).unwrap();
    let sender = client.enroll_tcp(stream).expect("enroll failed");
    assert_eq!(handler.opened.load(Ordering::SeqCst), 1);

    sender.send(b"enrolled".to_vec()).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        handler.received.lock().as_slice() == b"enrolled"
    }));

    client.stop().unwrap();
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn dial_before_start_is_refused() {
    let client = Client::new(Recorder::default(), Options::default());
    assert!(matches!(
        client.dial("tcp", "127.0.0.1:1"),
        Err(Error::EmptyEngine)
    ));
}

#[test]
fn stop_without_start_is_refused() {
    let mut client = Client::new(Recorder::default(), Options::default());
    assert!(matches!(client.stop(), Err(Error::EmptyEngine)));
}

#[test]
fn dial_rejects_unknown_network() {
    let handler = Arc::new(Recorder::default());
    let mut client = Client::new(handler, Options::default().with_num_event_loop(1));
    client.start().unwrap();
    assert!(matches!(
        client.dial("sctp", "127.0.0.1:1"),
        Err(Error::UnsupportedProtocol)
    ));
    client.stop().unwrap();
}
