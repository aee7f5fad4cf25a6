//! Back-pressured bulk write: the outbound queue drains across many
//! writable events and no byte is lost or reordered.

mod common;

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gyre::{Action, Conn, Error, EventHandler, Options};

use common::{get_available_port, wait_for, wait_for_engine};

const TOTAL: usize = 32 * 1024 * 1024;

/// Writes 32 MiB to every connection as soon as it opens.
#[derive(Default)]
struct Flooder {
    closed: AtomicUsize,
}

impl EventHandler for Flooder {
    fn on_open(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        let mut payload = vec![0u8; TOTAL];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        conn.write(&payload).unwrap();
        (None, Action::None)
    }

    fn on_close(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }
}

#[test]
fn slow_reader_receives_every_byte() {
    let port = get_available_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let handler = Arc::new(Flooder::default());
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

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();

    // Read slowly in small chunks so the server's outbound queue has to
    // survive many writable events.
    let mut received = 0usize;
    let mut buf = [0u8; 16 * 1024];
    while received < TOTAL {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection ended after {received} bytes");
        for (off, &byte) in buf[..n].iter().enumerate() {
            assert_eq!(byte, ((received + off) % 251) as u8, "corrupt byte");
        }
        received += n;
        if received % (4 * 1024 * 1024) < n {
            thread::sleep(Duration::from_millis(5));
        }
    }
    assert_eq!(received, TOTAL);

    drop(stream);
    assert!(wait_for(Duration::from_secs(5), || {
        handler.closed.load(Ordering::SeqCst) == 1
    }));

    engine.stop().unwrap();
    server.join().unwrap().unwrap();
}
