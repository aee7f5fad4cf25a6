use std::io;
use std::os::fd::RawFd;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use tracing::{debug, error, warn};

use crate::conn::Conn;
use crate::engine::Shutdown;
use crate::error::{Error, Result};
use crate::handler::{Action, EventHandler};
use crate::listener::Listener;
use crate::load_balancer::Balancer;
use crate::netpoll::{IOEvent, IOFlags, Poller};
use crate::options::Options;
use crate::queue::Priority;
use crate::ring::DEFAULT_BUFFER_SIZE;
use crate::socket::{self, Network};

/// Which poll sources a loop watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Combined loop: listeners and connections. Used with SO_REUSEPORT and
    /// by the client.
    Run,
    /// Sub-reactor: connections only.
    Orbit,
    /// Dedicated acceptor: listeners only, handing conns to sub-reactors.
    Rotate,
}

/// The shareable half of an event loop: everything other threads may touch.
///
/// The poller is the only mutation channel into the loop; `conn_count` backs
/// the least-connections balancer.
pub(crate) struct EventLoopHandle {
    pub(crate) idx: i32,
    pub(crate) poller: Poller<EventLoop>,
    pub(crate) conn_count: AtomicI32,
}

impl EventLoopHandle {
    pub(crate) fn open(idx: i32) -> Result<Arc<EventLoopHandle>> {
        Ok(Arc::new(EventLoopHandle {
            idx,
            poller: Poller::open()?,
            conn_count: AtomicI32::new(0),
        }))
    }

    pub(crate) fn load(&self) -> i32 {
        self.conn_count.load(Ordering::Relaxed)
    }

    /// Hand an accepted or dialed connection to this loop's thread.
    pub(crate) fn trigger_register(&self, conn: Conn) -> Result<()> {
        self.poller
            .trigger(Priority::High, Box::new(move |el: &mut EventLoop| el.register(conn)))
    }
}

/// One reactor: a poller, the connections resident on it, and (depending on
/// the mode) the listeners it accepts from. All fields are mutated only on
/// the loop's own thread.
pub(crate) struct EventLoop {
    pub(crate) handle: Arc<EventLoopHandle>,
    pub(crate) listeners: AHashMap<RawFd, Arc<Listener>>,
    conns: AHashMap<RawFd, Conn>,
    /// Scratch read buffer, `read_buffer_cap` bytes; the UDP datagram
    /// landing zone.
    buffer: Vec<u8>,
    opts: Arc<Options>,
    handler: Arc<dyn EventHandler>,
    balancer: Arc<Balancer>,
    shutdown: Arc<Shutdown>,
}

impl EventLoop {
    pub(crate) fn new(
        handle: Arc<EventLoopHandle>,
        listeners: AHashMap<RawFd, Arc<Listener>>,
        opts: Arc<Options>,
        handler: Arc<dyn EventHandler>,
        balancer: Arc<Balancer>,
        shutdown: Arc<Shutdown>,
    ) -> EventLoop {
        let buffer = vec![0u8; opts.read_buffer_cap];
        EventLoop {
            handle,
            listeners,
            conns: AHashMap::new(),
            buffer,
            opts,
            handler,
            balancer,
            shutdown,
        }
    }

    /// Drive the loop until shutdown. Consumes the loop; runs on its worker
    /// thread.
    pub(crate) fn run(mut self, mode: Mode) -> Result<()> {
        if self.opts.lock_os_thread && self.handle.idx >= 0 {
            pin_to_core(self.handle.idx as usize);
        }
        let handle = self.handle.clone();
        let result = match mode {
            Mode::Run => handle.poller.polling(&mut self, |el, fd, ev, flags| {
                if el.conns.contains_key(&fd) {
                    el.process_io(fd, ev, flags)
                } else if el.listeners.contains_key(&fd) {
                    el.accept(fd)
                } else {
                    el.stale_fd(fd, ev, flags)
                }
            }),
            Mode::Orbit => handle.poller.polling(&mut self, |el, fd, ev, flags| {
                if el.conns.contains_key(&fd) {
                    el.process_io(fd, ev, flags)
                } else {
                    el.stale_fd(fd, ev, flags)
                }
            }),
            Mode::Rotate => {
                handle.poller.polling(&mut self, |el, fd, _ev, _flags| el.accept0(fd))
            }
        };

        match &result {
            Err(err) if err.is_shutdown() => {
                debug!(
                    "event-loop({}) is exiting in terms of the demand from user",
                    self.handle.idx
                );
            }
            Err(err) => {
                error!("event-loop({}) is exiting due to error: {err}", self.handle.idx);
            }
            Ok(()) => {}
        }

        self.close_conns();
        self.shutdown.turn_off();

        match result {
            Err(err) if err.is_shutdown() => Ok(()),
            other => other,
        }
    }

    /// An event for an fd that is in neither table. kqueue self-cleans on
    /// close; epoll can surface stale fds that must be deleted explicitly.
    fn stale_fd(&mut self, fd: RawFd, ev: IOEvent, flags: IOFlags) -> Result<()> {
        warn!(
            "received event[fd={fd}|ev={ev}|flags={flags}] of a stale connection from event-loop({})",
            self.handle.idx
        );
        self.handle.poller.delete(fd)
    }

    // ---- accept ----

    fn listener_info(&self, fd: RawFd) -> Option<(Network, crate::socket::NetAddr)> {
        self.listeners
            .get(&fd)
            .map(|ln| (ln.network, ln.local_addr.clone()))
    }

    /// Dedicated-acceptor accept: drain the queue, handing each socket to a
    /// sibling loop chosen by the balancer.
    fn accept0(&mut self, fd: RawFd) -> Result<()> {
        let Some((network, local)) = self.listener_info(fd) else {
            return Ok(());
        };
        if network.is_udp() {
            return self.read_udp(fd);
        }
        loop {
            let (nfd, remote) = match socket::accept(fd) {
                Ok(pair) => pair,
                Err(err) => match err.raw_os_error() {
                    Some(libc::EAGAIN) => return Ok(()),
                    Some(libc::EINTR | libc::ECONNRESET | libc::ECONNABORTED) => continue,
                    _ => {
                        error!("Accept() failed due to error: {err}");
                        return Err(Error::AcceptSocket);
                    }
                },
            };
            self.setup_keepalive(nfd, network);
            let target = self.balancer.next(Some(&remote));
            let conn =
                Conn::new_stream(network, nfd, target.clone(), local.clone(), remote, &self.opts);
            if let Err(err) = target.trigger_register(conn) {
                error!("failed to enqueue accepted socket fd={nfd} to poller: {err}");
                unsafe { libc::close(nfd) };
            }
        }
    }

    /// Combined-mode accept: one socket per readable event, registered on
    /// this loop directly.
    fn accept(&mut self, fd: RawFd) -> Result<()> {
        let Some((network, local)) = self.listener_info(fd) else {
            return Ok(());
        };
        if network.is_udp() {
            return self.read_udp(fd);
        }
        let (nfd, remote) = match socket::accept(fd) {
            Ok(pair) => pair,
            Err(err) => match err.raw_os_error() {
                Some(libc::EAGAIN | libc::EINTR | libc::ECONNRESET | libc::ECONNABORTED) => {
                    return Ok(())
                }
                _ => {
                    error!("Accept() failed due to error: {err}");
                    return Err(Error::AcceptSocket);
                }
            },
        };
        self.setup_keepalive(nfd, network);
        let conn =
            Conn::new_stream(network, nfd, self.handle.clone(), local, remote, &self.opts);
        self.register(conn)
    }

    /// Keepalive is inherited from the listener on Linux/FreeBSD/DragonFly;
    /// elsewhere each accepted fd gets it explicitly.
    fn setup_keepalive(&self, fd: RawFd, network: Network) {
        if socket::KEEPALIVE_INHERITED
            || self.opts.tcp_keep_alive.is_zero()
            || !network.is_tcp()
        {
            return;
        }
        if let Err(err) = socket::set_keep_alive(
            fd,
            self.opts.tcp_keep_alive,
            self.opts.tcp_keep_interval,
            self.opts.tcp_keep_count,
        ) {
            error!("failed to set TCP keepalive on fd={fd}: {err}");
        }
    }

    // ---- register/open ----

    /// Add a connection to this loop. Runs on the loop thread, either inline
    /// from `accept` or as a triggered task from the acceptor or the client.
    pub(crate) fn register(&mut self, mut conn: Conn) -> Result<()> {
        let fd = conn.fd;
        let registered = if self.opts.edge_triggered_io {
            self.handle.poller.add_read_write(fd, true)
        } else {
            self.handle.poller.add_read(fd, false)
        };
        if let Err(err) = registered {
            error!("failed to register fd={fd} on event-loop({}): {err}", self.handle.idx);
            unsafe { libc::close(fd) };
            conn.release();
            return Ok(());
        }
        let skip_open = conn.is_datagram() && conn.udp_peer.is_some();
        self.conns.insert(fd, conn);
        self.handle.conn_count.fetch_add(1, Ordering::Relaxed);
        if skip_open {
            return Ok(());
        }
        self.open(fd)
    }

    /// Register a dialed connection, then release the dialer blocked on the
    /// opened rendezvous.
    pub(crate) fn register_enrolled(
        &mut self,
        conn: Conn,
        opened_tx: crossbeam_channel::Sender<()>,
    ) -> Result<()> {
        let result = self.register(conn);
        let _ = opened_tx.send(());
        result
    }

    fn open(&mut self, fd: RawFd) -> Result<()> {
        let handler = self.handler.clone();
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };
        conn.opened = true;
        let Some((out, action)) = catch_panic("on_open", || handler.on_open(conn)) else {
            return self.close_by_fd(fd, None);
        };
        if let Some(bytes) = out {
            if let Some(conn) = self.conns.get_mut(&fd) {
                let _ = conn.write(&bytes);
            }
        }
        self.after_callback(fd, action)
    }

    /// Apply the action a callback returned, plus any close the handler
    /// requested on the conn itself.
    fn after_callback(&mut self, fd: RawFd, action: Action) -> Result<()> {
        match action {
            Action::Shutdown => return Err(Error::EngineShutdown),
            Action::Close => return self.close_by_fd(fd, None),
            Action::None => {}
        }
        if let Some(conn) = self.conns.get_mut(&fd) {
            if conn.close_requested {
                let err = conn.close_err.take();
                return self.close_by_fd(fd, err);
            }
        }
        Ok(())
    }

    // ---- I/O ----

    /// Dispatch a readiness event for a resident connection (epoll flavor).
    #[cfg(target_os = "linux")]
    fn process_io(&mut self, fd: RawFd, ev: IOEvent, _flags: IOFlags) -> Result<()> {
        use crate::netpoll::{READ_EVENTS, WRITE_EVENTS};
        const ERR_EVENTS: IOEvent = (libc::EPOLLERR | libc::EPOLLHUP) as IOEvent;
        const RDHUP: IOEvent = libc::EPOLLRDHUP as IOEvent;

        // An error-or-hangup-only event: the peer is gone, don't bother
        // writing back.
        if ev & (ERR_EVENTS | RDHUP) != 0 && ev & (READ_EVENTS | WRITE_EVENTS) == 0 {
            if let Some(conn) = self.conns.get_mut(&fd) {
                conn.outbound.release();
            }
            return self.close_by_fd(fd, Some(eof_error()));
        }
        // Writable first: drain pending data before taking on more input,
        // and flush what we can toward a dying peer.
        if ev & (WRITE_EVENTS | ERR_EVENTS) != 0 {
            self.loop_write(fd)?;
        }
        if ev & (READ_EVENTS | ERR_EVENTS) != 0 {
            self.loop_read(fd)?;
        }
        // EPOLLRDHUP last: the peer half-closed, make sure the socket buffer
        // is fully drained before converting it into EOF.
        if ev & RDHUP != 0 {
            let open = self.conns.get(&fd).map(|c| c.opened).unwrap_or(false);
            if open {
                if ev & libc::EPOLLIN as IOEvent == 0 {
                    return self.close_by_fd(fd, Some(eof_error()));
                }
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.is_eof = true;
                }
                return self.loop_read(fd);
            }
        }
        Ok(())
    }

    /// Dispatch a readiness event for a resident connection (kqueue flavor).
    #[cfg(not(target_os = "linux"))]
    fn process_io(&mut self, fd: RawFd, filter: IOEvent, flags: IOFlags) -> Result<()> {
        use crate::netpoll::{READ_EVENTS, WRITE_EVENTS};
        match filter {
            READ_EVENTS => self.loop_read(fd)?,
            WRITE_EVENTS => self.loop_write(fd)?,
            _ => {}
        }
        // EV_EOF rides along with the filter event; drain whatever is left
        // before treating it as EOF.
        if flags & libc::EV_EOF as IOFlags != 0 {
            let open = self.conns.get(&fd).map(|c| c.opened).unwrap_or(false);
            if open {
                match filter {
                    READ_EVENTS => {
                        if let Some(conn) = self.conns.get_mut(&fd) {
                            conn.is_eof = true;
                        }
                        return self.loop_read(fd);
                    }
                    // macOS delivers a writable EV_EOF for unix-domain peers
                    // before the readable one; flush rather than close.
                    WRITE_EVENTS => return self.loop_write(fd),
                    _ => {
                        if let Some(conn) = self.conns.get_mut(&fd) {
                            conn.outbound.release();
                        }
                        return self.close_by_fd(fd, Some(eof_error()));
                    }
                }
            }
        }
        Ok(())
    }

    fn loop_read(&mut self, fd: RawFd) -> Result<()> {
        let et = self.opts.edge_triggered_io;
        let chunk = self.opts.edge_triggered_io_chunk;
        let handler = self.handler.clone();
        let mut received = 0usize;

        loop {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return Ok(());
            };
            if !conn.opened {
                return Ok(());
            }
            let is_eof = conn.is_eof;
            conn.inbound.grow_for(DEFAULT_BUFFER_SIZE);
            let read = {
                let (a, b) = conn.inbound.writable_parts();
                if a.is_empty() && b.is_empty() {
                    // Inbound ring at cap and the handler isn't consuming:
                    // stop reading and let TCP flow control push back.
                    return Ok(());
                }
                socket::readv(fd, &mut [a, b])
            };
            match read {
                Ok(0) => return self.close_by_fd(fd, Some(eof_error())),
                Ok(n) => {
                    conn.inbound.advance_write(n);
                    received += n;
                    let Some(action) = catch_panic("on_traffic", || handler.on_traffic(conn))
                    else {
                        return self.close_by_fd(fd, None);
                    };
                    self.after_callback(fd, action)?;
                    if !self.conns.contains_key(&fd) {
                        return Ok(());
                    }
                    if !et {
                        return Ok(());
                    }
                    if received >= chunk {
                        // Out of budget with bytes possibly left in the
                        // socket: re-arm so the edge fires again.
                        let _ = self.handle.poller.mod_read_write(fd, true);
                        return Ok(());
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if is_eof {
                        // Half-closed and the socket buffer is now dry.
                        return self.close_by_fd(fd, Some(eof_error()));
                    }
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return self.close_by_fd(fd, Some(Error::Io(err))),
            }
        }
    }

    fn loop_write(&mut self, fd: RawFd) -> Result<()> {
        let et = self.opts.edge_triggered_io;
        let chunk = self.opts.edge_triggered_io_chunk;
        let mut sent = 0usize;

        loop {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return Ok(());
            };
            conn.refill_outbound();
            if conn.outbound.is_empty() {
                break;
            }
            let wrote = {
                let (a, b) = conn.outbound.peek();
                socket::writev(fd, &[a, b])
            };
            match wrote {
                Ok(n) => {
                    conn.outbound.discard(n);
                    conn.refill_outbound();
                    sent += n;
                    let more = !conn.outbound.is_empty();
                    if et && more && sent >= chunk {
                        // Budget spent while the socket stayed writable:
                        // re-arm so the edge fires again.
                        let _ = self.handle.poller.mod_read_write(fd, true);
                        return Ok(());
                    }
                    if !(et && more) {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return self.close_by_fd(fd, Some(Error::Io(err))),
            }
        }

        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(());
        };
        if !et && conn.outbound_len() == 0 {
            // Fully drained: stop watching for writable so an idle socket
            // doesn't spin the loop.
            let _ = self.handle.poller.mod_read(fd, false);
        }
        Ok(())
    }

    /// One inbound datagram per iteration: an ephemeral conn scoped to the
    /// callback, replying through `sendto`.
    fn read_udp(&mut self, fd: RawFd) -> Result<()> {
        let Some((_, local)) = self.listener_info(fd) else {
            return Ok(());
        };
        let handler = self.handler.clone();
        loop {
            let (n, peer) = match socket::recv_from(fd, &mut self.buffer) {
                Ok(pair) => pair,
                Err(err) => match err.raw_os_error() {
                    Some(libc::EAGAIN) => return Ok(()),
                    Some(libc::EINTR) => continue,
                    _ => {
                        warn!("failed to receive UDP datagram on fd={fd}: {err}");
                        return Ok(());
                    }
                },
            };
            let remote = socket::sockaddr_to_net_addr(&peer);
            let mut conn = Conn::new_datagram(
                fd,
                self.handle.clone(),
                local.clone(),
                remote,
                Some(peer),
                &self.opts,
            );
            conn.opened = true;
            conn.inbound.write(&self.buffer[..n]);
            let action = catch_panic("on_traffic", || handler.on_traffic(&mut conn));
            conn.release();
            if let Some(Action::Shutdown) = action {
                return Err(Error::EngineShutdown);
            }
        }
    }

    // ---- close ----

    /// Close a resident connection: final flush, deregister, `on_close`,
    /// close the fd, release the buffers. Safe to call for already-gone fds.
    pub(crate) fn close_by_fd(&mut self, fd: RawFd, err: Option<Error>) -> Result<()> {
        let Some(mut conn) = self.conns.remove(&fd) else {
            return Ok(());
        };
        self.handle.conn_count.fetch_sub(1, Ordering::Relaxed);

        // Best-effort single flush of queued outbound bytes.
        conn.refill_outbound();
        if !conn.outbound.is_empty() {
            let (a, b) = conn.outbound.peek();
            let _ = socket::writev(fd, &[a, b]);
        }

        if let Err(derr) = self.handle.poller.delete(fd) {
            debug!("failed to delete fd={fd} from poller: {derr}");
        }

        let handler = self.handler.clone();
        let was_opened = conn.opened;
        let mut action = Action::None;
        if was_opened {
            conn.opened = false;
            action = catch_panic("on_close", || handler.on_close(&mut conn, err.as_ref()))
                .unwrap_or(Action::None);
        }

        let rc = unsafe { libc::close(fd) };
        if rc < 0 {
            error!(
                "failed to close fd={fd}: {}",
                io::Error::last_os_error()
            );
        }
        conn.release();

        if action == Action::Shutdown {
            return Err(Error::EngineShutdown);
        }
        Ok(())
    }

    /// Close every resident connection; runs when the loop exits.
    pub(crate) fn close_conns(&mut self) {
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            let _ = self.close_by_fd(fd, None);
        }
    }

    /// Thread-safe write path used by [`crate::conn::ConnSender`]. `Ok(false)`
    /// means the fd no longer names a live connection.
    pub(crate) fn async_write(&mut self, fd: RawFd, data: &[u8]) -> Result<bool> {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return Ok(false);
        };
        if !conn.opened {
            return Ok(false);
        }
        let _ = conn.write(data);
        if conn.close_requested {
            let err = conn.close_err.take();
            self.close_by_fd(fd, err)?;
        }
        Ok(true)
    }
}

/// The ticker coroutine: runs `on_tick` at handler-chosen intervals on its
/// own thread until engine shutdown.
pub(crate) fn ticker(
    handle: Arc<EventLoopHandle>,
    handler: Arc<dyn EventHandler>,
    shutdown_rx: crossbeam_channel::Receiver<()>,
) {
    loop {
        let (delay, action) = catch_panic("on_tick", || handler.on_tick())
            .unwrap_or((std::time::Duration::from_secs(1), Action::None));
        if action == Action::Shutdown {
            // Low priority, so tasks already queued (async writes) finish
            // ahead of the shutdown.
            let _ = handle
                .poller
                .trigger(Priority::Low, Box::new(|_| Err(Error::EngineShutdown)));
        }
        crossbeam_channel::select! {
            recv(shutdown_rx) -> _ => return,
            default(delay) => {}
        }
    }
}

fn eof_error() -> Error {
    Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
}

/// Run a handler callback, catching panics so one bad callback cannot take
/// the loop down. Returns `None` when the callback panicked.
fn catch_panic<T>(what: &str, f: impl FnOnce() -> T) -> Option<T> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            error!("recovered from panic in {what}: {msg}");
            None
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % num_cpus(), &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(
                "failed to pin event-loop thread to core {core}: {}",
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) {}

/// Number of online CPU cores.
pub(crate) fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}
