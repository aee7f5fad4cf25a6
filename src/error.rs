use std::io;

use thiserror::Error;

/// Errors produced by the engine.
///
/// Variants are matched on by callers; syscall failures that do not map to a
/// dedicated kind travel inside [`Error::Io`].
#[derive(Debug, Error)]
pub enum Error {
    /// The internal engine is missing, typically because it was never started.
    #[error("the internal engine is empty")]
    EmptyEngine,
    /// The engine is being shut down. Returned by a poller task to terminate
    /// its event loop; not surfaced to applications as a failure.
    #[error("engine is going to be shutdown")]
    EngineShutdown,
    /// The engine was asked to shut down more than once, or was handed new
    /// work while stopping.
    #[error("engine is already in shutdown")]
    EngineInShutdown,
    /// The acceptor failed to accept a new connection.
    #[error("accept a new connection error")]
    AcceptSocket,
    /// More than 10,000 event loops were requested under `lock_os_thread`.
    #[error("too many event-loops under lock_os_thread mode")]
    TooManyEventLoopThreads,
    /// The network is not one of unix, tcp/tcp4/tcp6, udp/udp4/udp6.
    #[error("only unix, tcp/tcp4/tcp6, udp/udp4/udp6 are supported")]
    UnsupportedProtocol,
    /// The network is not one of tcp/tcp4/tcp6.
    #[error("only tcp/tcp4/tcp6 are supported")]
    UnsupportedTcpProtocol,
    /// The network is not one of udp/udp4/udp6.
    #[error("only udp/udp4/udp6 are supported")]
    UnsupportedUdpProtocol,
    /// The network is not unix.
    #[error("only unix is supported")]
    UnsupportedUdsProtocol,
    /// The operation is not supported on this platform.
    #[error("unsupported operation")]
    UnsupportedOp,
    /// A negative size was passed to a buffer operation.
    #[error("negative size is not allowed")]
    NegativeSize,
    /// An IPv4 multicast membership was requested on an interface with no
    /// IPv4 address configured.
    #[error("no IPv4 address on interface")]
    NoIPv4AddressOnInterface,
    /// The listen or dial address could not be parsed.
    #[error("invalid network address")]
    InvalidNetworkAddress,
    /// The stream handed to `enroll` is unusable.
    #[error("the network connection is invalid")]
    InvalidNetConn,
    /// A nil/no-op runnable was submitted for execution.
    #[error("nil runnable is not allowed")]
    NilRunnable,
    /// The poller could not allocate its kernel handle or wakeup primitive.
    #[error("failed to init poller: {0}")]
    PollerInit(#[source] io::Error),
    /// Any other syscall failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error is the cooperative shutdown signal rather than a
    /// real failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::EngineShutdown)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
