use std::any::Any;
use std::io;
use std::net::{TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use ahash::AHashMap;
use tracing::info;

use crate::conn::{Conn, ConnSender};
use crate::engine::{Engine, Shutdown};
use crate::error::{Error, Result};
use crate::event_loop::{num_cpus, ticker, EventLoop, EventLoopHandle, Mode};
use crate::handler::EventHandler;
use crate::listener::Listener;
use crate::load_balancer::Balancer;
use crate::options::{LoadBalancing, Options, TcpNoDelay};
use crate::queue::Priority;
use crate::socket::{self, Network};

struct Running {
    handles: Vec<Arc<EventLoopHandle>>,
    balancer: Arc<Balancer>,
    shutdown: Arc<Shutdown>,
    workers: Vec<thread::JoinHandle<Result<()>>>,
    ticker: Option<thread::JoinHandle<()>>,
    engine: Engine,
}

/// The engine with no listeners: dialed and enrolled connections are
/// distributed over the loops with the least-connections balancer.
pub struct Client {
    opts: Arc<Options>,
    handler: Arc<dyn EventHandler>,
    running: Option<Running>,
}

impl Client {
    pub fn new<H: EventHandler>(handler: H, options: Options) -> Client {
        let mut opts = options;
        opts.normalize();
        Client {
            opts: Arc::new(opts),
            handler: Arc::new(handler),
            running: None,
        }
    }

    /// Spawn the event loops. Connections can be dialed once this returns.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::EngineInShutdown);
        }
        let num_event_loop = if self.opts.num_event_loop > 0 {
            self.opts.num_event_loop
        } else {
            num_cpus()
        };
        info!("starting client with {num_event_loop} event-loops");

        let shutdown = Shutdown::new();
        let mut balancer = Balancer::new(LoadBalancing::LeastConnections);
        for i in 0..num_event_loop {
            match EventLoopHandle::open(i as i32) {
                Ok(handle) => balancer.register(handle),
                Err(err) => {
                    balancer.iterate(|_, h| {
                        h.poller.close();
                        true
                    });
                    return Err(err);
                }
            }
        }
        let balancer = Arc::new(balancer);
        let mut handles = Vec::with_capacity(num_event_loop);
        balancer.iterate(|_, h| {
            handles.push(h.clone());
            true
        });

        let engine = Engine::from_parts(handles.clone(), None, shutdown.clone());
        self.handler.on_boot(&engine);

        let mut workers = Vec::with_capacity(num_event_loop);
        let spawn = (|| -> Result<()> {
            for (i, handle) in handles.iter().enumerate() {
                let el = EventLoop::new(
                    handle.clone(),
                    AHashMap::<RawFd, Arc<Listener>>::new(),
                    self.opts.clone(),
                    self.handler.clone(),
                    balancer.clone(),
                    shutdown.clone(),
                );
                let jh = thread::Builder::new()
                    .name(format!("gyre-client-loop-{i}"))
                    .spawn(move || el.run(Mode::Run))
                    .map_err(Error::Io)?;
                workers.push(jh);
            }
            Ok(())
        })();
        if let Err(err) = spawn {
            shutdown.turn_off();
            for handle in &handles {
                let _ = handle
                    .poller
                    .trigger(Priority::High, Box::new(|_| Err(Error::EngineShutdown)));
            }
            for jh in workers {
                let _ = jh.join();
            }
            for handle in &handles {
                handle.poller.close();
            }
            return Err(err);
        }

        let mut tick = None;
        if self.opts.ticker {
            let designated = handles[0].clone();
            let tick_handler = self.handler.clone();
            let rx = shutdown.subscribe();
            match thread::Builder::new()
                .name("gyre-client-ticker".to_string())
                .spawn(move || ticker(designated, tick_handler, rx))
            {
                Ok(jh) => tick = Some(jh),
                Err(err) => {
                    shutdown.turn_off();
                    for handle in &handles {
                        let _ = handle
                            .poller
                            .trigger(Priority::High, Box::new(|_| Err(Error::EngineShutdown)));
                    }
                    for jh in workers {
                        let _ = jh.join();
                    }
                    for handle in &handles {
                        handle.poller.close();
                    }
                    return Err(Error::Io(err));
                }
            }
        }

        self.running = Some(Running {
            handles,
            balancer,
            shutdown,
            workers,
            ticker: tick,
            engine,
        });
        Ok(())
    }

    /// Stop the event loops and join the workers. Every live connection
    /// observes `on_close` first.
    pub fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Err(Error::EmptyEngine);
        };
        running.shutdown.turn_off();
        self.handler.on_shutdown(&running.engine);

        for handle in &running.handles {
            let _ = handle
                .poller
                .trigger(Priority::High, Box::new(|_| Err(Error::EngineShutdown)));
        }

        let mut first_err: Option<Error> = None;
        for jh in running.workers {
            match jh.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err =
                            Some(Error::Io(io::Error::other("client worker panicked")));
                    }
                }
            }
        }
        if let Some(jh) = running.ticker {
            let _ = jh.join();
        }
        for handle in &running.handles {
            handle.poller.close();
        }
        running.engine.mark_in_shutdown();

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Connect to `network://address` with a blocking connect, then hand the
    /// socket to an event loop. Blocks until `on_open` has run.
    pub fn dial(&self, network: &str, address: &str) -> Result<ConnSender> {
        self.dial_inner(network, address, None)
    }

    /// Like [`Client::dial`], with a user context retrievable later via
    /// [`Conn::context`].
    pub fn dial_with_context(
        &self,
        network: &str,
        address: &str,
        ctx: Box<dyn Any + Send>,
    ) -> Result<ConnSender> {
        self.dial_inner(network, address, Some(ctx))
    }

    fn dial_inner(
        &self,
        network: &str,
        address: &str,
        ctx: Option<Box<dyn Any + Send>>,
    ) -> Result<ConnSender> {
        let network: Network = network.parse()?;
        match network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let stream = TcpStream::connect(address)?;
                self.enroll_fd(&stream, Network::Tcp, ctx)
            }
            Network::Udp | Network::Udp4 | Network::Udp6 => {
                let local = if matches!(network, Network::Udp6) {
                    "[::]:0"
                } else {
                    "0.0.0.0:0"
                };
                let socket = UdpSocket::bind(local)?;
                socket.connect(address)?;
                self.enroll_fd(&socket, Network::Udp, ctx)
            }
            Network::Unix => {
                let stream = UnixStream::connect(address)?;
                self.enroll_fd(&stream, Network::Unix, ctx)
            }
        }
    }

    /// Take over an already-connected TCP stream.
    pub fn enroll_tcp(&self, stream: TcpStream) -> Result<ConnSender> {
        self.enroll_fd(&stream, Network::Tcp, None)
    }

    /// Take over an already-connected unix-domain stream.
    pub fn enroll_unix(&self, stream: UnixStream) -> Result<ConnSender> {
        self.enroll_fd(&stream, Network::Unix, None)
    }

    /// Duplicate the socket with close-on-exec, apply the socket options,
    /// and register the duplicate on the least-loaded loop. The original
    /// socket is closed when `source` drops.
    fn enroll_fd(
        &self,
        source: &dyn AsRawFd,
        network: Network,
        ctx: Option<Box<dyn Any + Send>>,
    ) -> Result<ConnSender> {
        let Some(running) = &self.running else {
            return Err(Error::EmptyEngine);
        };
        if running.balancer.len() == 0 {
            return Err(Error::EmptyEngine);
        }
        let raw = source.as_raw_fd();
        if raw < 0 {
            return Err(Error::InvalidNetConn);
        }
        let fd = socket::dup_cloexec(raw)?;

        // The dup shares the original's file status flags; make sure the
        // loop never blocks on it.
        let enrolled = (|| -> Result<()> {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags < 0
                || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
            {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            if self.opts.socket_send_buffer > 0 {
                socket::set_send_buffer(fd, self.opts.socket_send_buffer)?;
            }
            if self.opts.socket_recv_buffer > 0 {
                socket::set_recv_buffer(fd, self.opts.socket_recv_buffer)?;
            }
            if network.is_tcp() {
                if self.opts.tcp_no_delay == TcpNoDelay::On {
                    socket::set_nodelay(fd, true)?;
                }
                if !self.opts.tcp_keep_alive.is_zero() {
                    socket::set_keep_alive(
                        fd,
                        self.opts.tcp_keep_alive,
                        self.opts.tcp_keep_interval,
                        self.opts.tcp_keep_count,
                    )?;
                }
            }
            Ok(())
        })();
        if let Err(err) = enrolled {
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let local = socket::local_net_addr(fd);
        let remote = socket::peer_net_addr(fd);
        let handle = running.balancer.next(None);
        let mut conn = match network {
            Network::Udp | Network::Udp4 | Network::Udp6 => {
                Conn::new_datagram(fd, handle.clone(), local, remote, None, &self.opts)
            }
            _ => Conn::new_stream(network.canonical(), fd, handle.clone(), local, remote, &self.opts),
        };
        conn.set_boxed_context(ctx);

        let (opened_tx, opened_rx) = crossbeam_channel::bounded::<()>(1);
        let registered = handle.poller.trigger(
            Priority::High,
            Box::new(move |el: &mut EventLoop| el.register_enrolled(conn, opened_tx)),
        );
        if let Err(err) = registered {
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let _ = opened_rx.recv();

        Ok(ConnSender::new(fd, handle))
    }
}
