use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use ahash::AHashMap;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::event_loop::{num_cpus, ticker, EventLoop, EventLoopHandle, Mode};
use crate::handler::{Action, EventHandler};
use crate::listener::Listener;
use crate::load_balancer::Balancer;
use crate::options::Options;
use crate::queue::Priority;
use crate::socket::Network;

/// Hard cap on event loops when threads are pinned.
const MAX_LOCKED_EVENT_LOOPS: usize = 10_000;

/// The engine-wide cancellation root. Arming is dropping the sender; every
/// subscriber observes the disconnect.
pub(crate) struct Shutdown {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new() -> Arc<Shutdown> {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        Arc::new(Shutdown {
            tx: Mutex::new(Some(tx)),
            rx,
        })
    }

    /// Cancel the engine. Returns whether this call was the one that did it.
    pub(crate) fn turn_off(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub(crate) fn subscribe(&self) -> Receiver<()> {
        self.rx.clone()
    }

    /// Block until the engine is cancelled.
    fn wait(&self) {
        let _ = self.rx.recv();
    }
}

struct EngineShared {
    handles: Vec<Arc<EventLoopHandle>>,
    ingress: Option<Arc<EventLoopHandle>>,
    shutdown: Arc<Shutdown>,
    in_shutdown: AtomicBool,
}

/// Handle to a running engine, passed to `on_boot`/`on_shutdown` and
/// available from the [`find`] registry accessor.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub(crate) fn from_parts(
        handles: Vec<Arc<EventLoopHandle>>,
        ingress: Option<Arc<EventLoopHandle>>,
        shutdown: Arc<Shutdown>,
    ) -> Engine {
        Engine {
            shared: Arc::new(EngineShared {
                handles,
                ingress,
                shutdown,
                in_shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Total connections currently resident across all event loops.
    pub fn count_connections(&self) -> usize {
        self.shared
            .handles
            .iter()
            .map(|h| h.load().max(0) as usize)
            .sum()
    }

    /// Whether the engine has completed shutdown.
    pub fn is_shutdown(&self) -> bool {
        self.shared.in_shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn mark_in_shutdown(&self) {
        self.shared.in_shutdown.store(true, Ordering::Release);
    }

    /// Begin graceful shutdown. Fails with [`Error::EngineInShutdown`] when
    /// the engine is already stopping.
    pub fn stop(&self) -> Result<()> {
        if self.shared.in_shutdown.load(Ordering::Acquire)
            || !self.shared.shutdown.turn_off()
        {
            return Err(Error::EngineInShutdown);
        }
        Ok(())
    }
}

// ---- process-wide registry ----

fn registry() -> &'static Mutex<HashMap<String, Engine>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Engine>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Look up the running engine serving `proto_addr` (as passed to [`run`]).
pub fn find(proto_addr: &str) -> Option<Engine> {
    registry().lock().get(proto_addr).cloned()
}

/// Parse a `proto://address` string.
pub(crate) fn parse_proto_addr(s: &str) -> Result<(Network, String)> {
    let (proto, addr) = s.split_once("://").ok_or(Error::InvalidNetworkAddress)?;
    if addr.is_empty() {
        return Err(Error::InvalidNetworkAddress);
    }
    Ok((proto.parse()?, addr.to_string()))
}

/// Start the engine on the given `proto://address` listeners and block until
/// shutdown, driving `handler` from the event-loop workers.
///
/// Returns the first startup syscall failure, or the first worker failure
/// collected during shutdown.
pub fn run<H: EventHandler>(handler: H, proto_addrs: &[&str], options: Options) -> Result<()> {
    if proto_addrs.is_empty() {
        return Err(Error::InvalidNetworkAddress);
    }
    let mut opts = options;
    opts.normalize();
    let opts = Arc::new(opts);
    let handler: Arc<dyn EventHandler> = Arc::new(handler);

    let num_event_loop = if opts.num_event_loop > 0 {
        opts.num_event_loop
    } else {
        num_cpus()
    };
    if opts.lock_os_thread && num_event_loop > MAX_LOCKED_EVENT_LOOPS {
        return Err(Error::TooManyEventLoopThreads);
    }

    let addrs: Vec<String> = proto_addrs.iter().map(|s| s.to_string()).collect();
    info!(
        "starting engine with {num_event_loop} event-loops, listening on: {}",
        addrs.join(" | ")
    );

    let mut primary: Vec<Arc<Listener>> = Vec::with_capacity(addrs.len());
    let mut parsed: Vec<(Network, String)> = Vec::with_capacity(addrs.len());
    for addr in &addrs {
        let (network, address) = parse_proto_addr(addr)?;
        let ln = Arc::new(Listener::init(network, &address, &opts)?);
        parsed.push((network, address));
        primary.push(ln);
    }

    let shutdown = Shutdown::new();
    let mut balancer = Balancer::new(opts.lb);
    let mut all_listeners: Vec<Arc<Listener>> = primary.clone();
    let mut loop_listeners: Vec<AHashMap<i32, Arc<Listener>>> = Vec::new();
    let mut ingress: Option<Arc<EventLoopHandle>> = None;

    let close_partial = |balancer: &Balancer,
                         ingress: &Option<Arc<EventLoopHandle>>,
                         listeners: &[Arc<Listener>]| {
        balancer.iterate(|_, h| {
            h.poller.close();
            true
        });
        if let Some(handle) = ingress {
            handle.poller.close();
        }
        for ln in listeners {
            ln.close();
        }
    };

    // Build the topology: with SO_REUSEPORT every loop owns its own copy of
    // each listener; otherwise a dedicated acceptor feeds the sub-reactors.
    let build = (|| -> Result<()> {
        for i in 0..num_event_loop {
            let handle = EventLoopHandle::open(i as i32)?;
            balancer.register(handle.clone());
            let mut lns = AHashMap::new();
            if opts.reuse_port {
                if i == 0 {
                    for ln in &primary {
                        lns.insert(ln.fd, ln.clone());
                    }
                } else {
                    for (network, address) in &parsed {
                        let ln = Arc::new(Listener::init(*network, address, &opts)?);
                        all_listeners.push(ln.clone());
                        lns.insert(ln.fd, ln);
                    }
                }
                for ln in lns.values() {
                    handle.poller.add_read(ln.fd, false)?;
                }
            }
            loop_listeners.push(lns);
        }
        if !opts.reuse_port {
            let acceptor = EventLoopHandle::open(-1)?;
            for ln in &primary {
                acceptor.poller.add_read(ln.fd, true)?;
            }
            ingress = Some(acceptor);
        }
        Ok(())
    })();
    if let Err(err) = build {
        close_partial(&balancer, &ingress, &all_listeners);
        error!("engine is stopping with error: {err}");
        return Err(err);
    }

    let balancer = Arc::new(balancer);
    let mut handles: Vec<Arc<EventLoopHandle>> = Vec::with_capacity(num_event_loop);
    balancer.iterate(|_, h| {
        handles.push(h.clone());
        true
    });

    let shared = Arc::new(EngineShared {
        handles: handles.clone(),
        ingress: ingress.clone(),
        shutdown: shutdown.clone(),
        in_shutdown: AtomicBool::new(false),
    });
    let engine = Engine {
        shared: shared.clone(),
    };

    match handler.on_boot(&engine) {
        Action::None | Action::Close => {}
        Action::Shutdown => {
            close_partial(&balancer, &ingress, &all_listeners);
            return Ok(());
        }
    }

    // Spawn the workers.
    let mut workers: Vec<thread::JoinHandle<Result<()>>> = Vec::new();
    let spawn = (|| -> Result<()> {
        for (i, handle) in handles.iter().enumerate() {
            let lns = std::mem::take(&mut loop_listeners[i]);
            let el = EventLoop::new(
                handle.clone(),
                lns,
                opts.clone(),
                handler.clone(),
                balancer.clone(),
                shutdown.clone(),
            );
            let mode = if opts.reuse_port { Mode::Run } else { Mode::Orbit };
            let jh = thread::Builder::new()
                .name(format!("gyre-loop-{i}"))
                .spawn(move || el.run(mode))
                .map_err(Error::Io)?;
            workers.push(jh);
        }
        if let Some(acceptor) = &ingress {
            let mut map = AHashMap::new();
            for ln in &primary {
                map.insert(ln.fd, ln.clone());
            }
            let el = EventLoop::new(
                acceptor.clone(),
                map,
                opts.clone(),
                handler.clone(),
                balancer.clone(),
                shutdown.clone(),
            );
            let jh = thread::Builder::new()
                .name("gyre-ingress".to_string())
                .spawn(move || el.run(Mode::Rotate))
                .map_err(Error::Io)?;
            workers.push(jh);
        }
        Ok(())
    })();
    if let Err(err) = spawn {
        // Workers already running are told to exit before we bail out.
        shutdown.turn_off();
        trigger_shutdown(&shared);
        for jh in workers {
            let _ = jh.join();
        }
        close_partial(&balancer, &ingress, &all_listeners);
        error!("engine is stopping with error: {err}");
        return Err(err);
    }

    let mut ticker_handle = None;
    if opts.ticker {
        let designated = if opts.reuse_port {
            handles[0].clone()
        } else {
            ingress.clone().expect("reactor topology always has an ingress")
        };
        let tick_handler = handler.clone();
        let rx = shutdown.subscribe();
        match thread::Builder::new()
            .name("gyre-ticker".to_string())
            .spawn(move || ticker(designated, tick_handler, rx))
        {
            Ok(jh) => ticker_handle = Some(jh),
            Err(err) => {
                shutdown.turn_off();
                trigger_shutdown(&shared);
                for jh in workers {
                    let _ = jh.join();
                }
                close_partial(&balancer, &ingress, &all_listeners);
                error!("engine is stopping with error: {err}");
                return Err(Error::Io(err));
            }
        }
    }

    {
        let mut reg = registry().lock();
        for addr in &addrs {
            reg.insert(addr.clone(), engine.clone());
        }
    }

    // Block until something cancels the engine: Engine::stop, a Shutdown
    // action, a ticker shutdown, or a worker failing.
    shutdown.wait();

    handler.on_shutdown(&engine);
    trigger_shutdown(&shared);

    let mut first_err: Option<Error> = None;
    for jh in workers {
        match jh.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            Err(_) => {
                if first_err.is_none() {
                    first_err = Some(Error::Io(io::Error::other("event-loop worker panicked")));
                }
            }
        }
    }
    if let Some(jh) = ticker_handle {
        let _ = jh.join();
    }

    close_partial(&balancer, &ingress, &all_listeners);
    shared.in_shutdown.store(true, Ordering::Release);

    {
        let mut reg = registry().lock();
        for addr in &addrs {
            reg.remove(addr);
        }
    }

    match first_err {
        Some(err) => {
            error!("engine shutdown error: {err}");
            Err(err)
        }
        None => Ok(()),
    }
}

/// Tell every poller to exit its polling loop.
fn trigger_shutdown(shared: &EngineShared) {
    for (i, handle) in shared
        .handles
        .iter()
        .chain(shared.ingress.iter())
        .enumerate()
    {
        if let Err(err) = handle
            .poller
            .trigger(Priority::High, Box::new(|_| Err(Error::EngineShutdown)))
        {
            error!("failed to enqueue shutdown signal for event-loop({i}): {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_addr_parsing() {
        let (network, addr) = parse_proto_addr("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(network, Network::Tcp);
        assert_eq!(addr, "127.0.0.1:9000");

        let (network, addr) = parse_proto_addr("unix:///tmp/gyre.sock").unwrap();
        assert_eq!(network, Network::Unix);
        assert_eq!(addr, "/tmp/gyre.sock");

        assert!(matches!(
            parse_proto_addr("127.0.0.1:9000"),
            Err(Error::InvalidNetworkAddress)
        ));
        assert!(matches!(
            parse_proto_addr("sctp://127.0.0.1:9000"),
            Err(Error::UnsupportedProtocol)
        ));
    }
}
