//! gyre — a multi-reactor, non-blocking network engine for TCP, UDP and
//! unix-domain sockets, built directly on epoll (Linux) and kqueue (macOS,
//! BSDs).
//!
//! Applications implement [`EventHandler`] and call [`run`] with one or more
//! `proto://address` listeners; a fixed pool of event-loop workers, each
//! pinned to its own poller, drives every accept, read, write and lifecycle
//! callback. [`Client`] is the same machinery with no listeners, for
//! outbound connections.

pub mod client;
pub mod conn;
pub mod engine;
pub mod error;
mod event_loop;
pub mod handler;
mod listener;
mod load_balancer;
mod netpoll;
pub mod options;
mod queue;
pub mod ring;
pub mod socket;

pub use client::Client;
pub use conn::{Conn, ConnSender};
pub use engine::{find, run, Engine};
pub use error::{Error, Result};
pub use handler::{Action, BuiltinEventHandler, EventHandler};
pub use options::{LoadBalancing, Options, TcpNoDelay};
pub use ring::{RingBuffer, DEFAULT_BUFFER_SIZE, MAX_STREAM_BUFFER_CAP};
pub use socket::{NetAddr, Network};
