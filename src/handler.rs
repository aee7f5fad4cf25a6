use std::time::Duration;

use crate::conn::Conn;
use crate::engine::Engine;
use crate::error::Error;

/// What the engine should do after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep going.
    #[default]
    None,
    /// Close the connection the callback was invoked for.
    Close,
    /// Shut the whole engine down.
    Shutdown,
}

/// Application callbacks driven by the event loops.
///
/// One handler value is shared by every loop, so implementations are
/// `Send + Sync` and callbacks take `&self`. All callbacks run on an
/// event-loop thread and must not block; offload long work to your own pool.
///
/// Every method has a default body, so handlers implement only what they
/// care about.
pub trait EventHandler: Send + Sync + 'static {
    /// Fired once the engine is ready to accept connections.
    /// Returning [`Action::Shutdown`] aborts startup.
    fn on_boot(&self, _engine: &Engine) -> Action {
        Action::None
    }

    /// Fired once when the engine is shutting down, before the loops exit.
    fn on_shutdown(&self, _engine: &Engine) {}

    /// Fired when a connection has been opened and registered on its loop.
    /// Returned bytes are queued to the peer before any traffic is read.
    fn on_open(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// Fired when a connection has been closed. `err` is the failure that
    /// closed it, or `None` for an orderly close.
    fn on_close(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        Action::None
    }

    /// Fired when the inbound buffer has new bytes. Consume them with the
    /// [`Conn`] read operations; whatever is left stays for the next call.
    fn on_traffic(&self, _conn: &mut Conn) -> Action {
        Action::None
    }

    /// Fired by the ticker when enabled. Returns the delay until the next
    /// tick.
    fn on_tick(&self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }
}

/// A handler that does nothing; handy as an embedded default and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEventHandler;

impl EventHandler for BuiltinEventHandler {}

/// Shared handlers work too: the engine takes the `Arc`, the application
/// keeps a clone for inspecting handler state.
impl<H: EventHandler> EventHandler for std::sync::Arc<H> {
    fn on_boot(&self, engine: &Engine) -> Action {
        (**self).on_boot(engine)
    }

    fn on_shutdown(&self, engine: &Engine) {
        (**self).on_shutdown(engine)
    }

    fn on_open(&self, conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (**self).on_open(conn)
    }

    fn on_close(&self, conn: &mut Conn, err: Option<&Error>) -> Action {
        (**self).on_close(conn, err)
    }

    fn on_traffic(&self, conn: &mut Conn) -> Action {
        (**self).on_traffic(conn)
    }

    fn on_tick(&self) -> (Duration, Action) {
        (**self).on_tick()
    }
}
