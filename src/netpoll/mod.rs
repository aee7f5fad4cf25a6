//! Readiness polling over epoll (Linux) and kqueue (macOS and the BSDs).
//!
//! Each event loop owns one [`Poller`]. The poller multiplexes readiness
//! events for the loop's file descriptors and runs cross-thread tasks
//! injected through [`Poller::trigger`] in the same iteration, woken by an
//! eventfd / `EVFILT_USER` / pipe signal.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::{IOEvent, IOFlags, Poller, READ_EVENTS, WRITE_EVENTS};

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use kqueue::{IOEvent, IOFlags, Poller, READ_EVENTS, WRITE_EVENTS};

/// Initial capacity of the poller event list.
pub const INIT_POLL_EVENTS_CAP: usize = 128;
/// Upper bound on the event-list capacity.
pub const MAX_POLL_EVENTS_CAP: usize = 1024;
/// Lower bound on the event-list capacity.
pub const MIN_POLL_EVENTS_CAP: usize = 32;
/// Maximum number of low-priority tasks drained per poller iteration.
pub const MAX_ASYNC_TASKS_AT_ONE_TIME: usize = 256;

/// Grow/shrink schedule for the event list: double when a wait fills it
/// exactly, halve when usage drops below half, always inside
/// [`MIN_POLL_EVENTS_CAP`, `MAX_POLL_EVENTS_CAP`].
pub(crate) fn resized_event_list(size: usize, used: usize) -> usize {
    if used == size && size << 1 <= MAX_POLL_EVENTS_CAP {
        size << 1
    } else if used < size >> 1 && size >> 1 >= MIN_POLL_EVENTS_CAP {
        size >> 1
    } else {
        size
    }
}
