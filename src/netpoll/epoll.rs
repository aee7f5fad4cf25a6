use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::queue::{Priority, Task, TaskQueues};

use super::{
    resized_event_list, INIT_POLL_EVENTS_CAP, MAX_ASYNC_TASKS_AT_ONE_TIME,
    MAX_POLL_EVENTS_CAP,
};

/// Readiness bits reported to the poll callback.
pub type IOEvent = u32;
/// Extra flags reported to the poll callback; unused on epoll.
pub type IOFlags = u16;

/// Readable events polled by epoll.
pub const READ_EVENTS: IOEvent = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
/// Writable events polled by epoll.
pub const WRITE_EVENTS: IOEvent = libc::EPOLLOUT as u32;

/// A poller backed by epoll, woken through an eventfd.
///
/// Exactly one thread runs [`Poller::polling`]; [`Poller::trigger`] is safe
/// from any thread. `C` is the loop context handed to injected tasks.
pub struct Poller<C> {
    epfd: RawFd,
    wakeup_fd: RawFd,
    wakeup_call: AtomicBool,
    closed: AtomicBool,
    queues: TaskQueues<C>,
    high_priority_threshold: usize,
}

impl<C> Poller<C> {
    /// Allocate the epoll instance and register the eventfd wakeup source.
    pub fn open() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::PollerInit(io::Error::last_os_error()));
        }
        let wakeup_fd =
            unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(Error::PollerInit(err));
        }
        let poller = Poller {
            epfd,
            wakeup_fd,
            wakeup_call: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            queues: TaskQueues::new(),
            high_priority_threshold: MAX_POLL_EVENTS_CAP,
        };
        poller
            .ctl(libc::EPOLL_CTL_ADD, wakeup_fd, libc::EPOLLIN as u32)
            .map_err(Error::PollerInit)?;
        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register `fd` with read interest. Half-close notification
    /// (`EPOLLRDHUP`) is always requested alongside.
    pub fn add_read(&self, fd: RawFd, edge_triggered: bool) -> Result<()> {
        let mut ev = READ_EVENTS | libc::EPOLLRDHUP as u32;
        if edge_triggered {
            ev |= libc::EPOLLET as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, ev).map_err(Error::Io)
    }

    /// Register `fd` with write interest.
    pub fn add_write(&self, fd: RawFd, edge_triggered: bool) -> Result<()> {
        let mut ev = WRITE_EVENTS;
        if edge_triggered {
            ev |= libc::EPOLLET as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, ev).map_err(Error::Io)
    }

    /// Register `fd` with read and write interest.
    pub fn add_read_write(&self, fd: RawFd, edge_triggered: bool) -> Result<()> {
        let mut ev = READ_EVENTS | WRITE_EVENTS | libc::EPOLLRDHUP as u32;
        if edge_triggered {
            ev |= libc::EPOLLET as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, ev).map_err(Error::Io)
    }

    /// Narrow `fd` back to read-only interest.
    pub fn mod_read(&self, fd: RawFd, edge_triggered: bool) -> Result<()> {
        let mut ev = READ_EVENTS | libc::EPOLLRDHUP as u32;
        if edge_triggered {
            ev |= libc::EPOLLET as u32;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, ev).map_err(Error::Io)
    }

    /// Widen `fd` to read and write interest.
    pub fn mod_read_write(&self, fd: RawFd, edge_triggered: bool) -> Result<()> {
        let mut ev = READ_EVENTS | WRITE_EVENTS | libc::EPOLLRDHUP as u32;
        if edge_triggered {
            ev |= libc::EPOLLET as u32;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, ev).map_err(Error::Io)
    }

    /// Remove `fd` from the interest set.
    pub fn delete(&self, fd: RawFd) -> Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Enqueue a task for the polling thread and wake it at most once.
    ///
    /// Safe from any thread. Fails with [`Error::EngineInShutdown`] once the
    /// poller is stopping.
    pub fn trigger(&self, priority: Priority, task: Task<C>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::EngineInShutdown);
        }
        self.queues.push(priority, task, self.high_priority_threshold);
        if self
            .wakeup_call
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.wake()?;
        }
        Ok(())
    }

    fn wake(&self) -> Result<()> {
        let one: u64 = 1;
        loop {
            let rc = unsafe {
                libc::write(
                    self.wakeup_fd,
                    &one as *const u64 as *const libc::c_void,
                    8,
                )
            };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // Counter saturated: the loop is already due for a wakeup.
                Some(libc::EAGAIN) => return Ok(()),
                Some(libc::EINTR) => continue,
                _ => {
                    warn!("failed to wake up the poller: {err}");
                    return Err(Error::Io(err));
                }
            }
        }
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.wakeup_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    /// Block on epoll until shutdown, invoking `callback` for every fd event
    /// and draining pending tasks at the end of each batch.
    ///
    /// Returns the [`Error::EngineShutdown`] / [`Error::AcceptSocket`] that
    /// terminated the loop, or the epoll failure.
    pub fn polling<F>(&self, ctx: &mut C, mut callback: F) -> Result<()>
    where
        F: FnMut(&mut C, RawFd, IOEvent, IOFlags) -> Result<()>,
    {
        let mut size = INIT_POLL_EVENTS_CAP;
        let mut events: Vec<libc::epoll_event> =
            vec![unsafe { std::mem::zeroed() }; size];
        let mut timeout: libc::c_int = -1;
        let mut do_chores = false;

        loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), size as libc::c_int, timeout)
            };
            if n == 0
                || (n < 0
                    && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR))
            {
                timeout = -1;
                std::thread::yield_now();
                continue;
            } else if n < 0 {
                let err = io::Error::last_os_error();
                error!("error occurs in epoll: {err}");
                return Err(Error::Io(err));
            }
            timeout = 0;
            let n = n as usize;

            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                if fd == self.wakeup_fd {
                    do_chores = true;
                    self.drain_wakeup();
                    continue;
                }
                if let Err(err) = callback(ctx, fd, ev.events, 0) {
                    if matches!(err, Error::AcceptSocket | Error::EngineShutdown) {
                        return Err(err);
                    }
                }
            }

            if do_chores {
                do_chores = false;
                while let Some(task) = self.queues.pop_urgent() {
                    if let Err(err) = task(ctx) {
                        if err.is_shutdown() {
                            return Err(err);
                        }
                    }
                }
                for _ in 0..MAX_ASYNC_TASKS_AT_ONE_TIME {
                    let Some(task) = self.queues.pop_backlog() else {
                        break;
                    };
                    if let Err(err) = task(ctx) {
                        if err.is_shutdown() {
                            return Err(err);
                        }
                    }
                }
                self.wakeup_call.store(false, Ordering::Release);
                // Tasks enqueued after the drain but before the clear would
                // otherwise be stranded without a wakeup.
                if !self.queues.is_empty()
                    && self
                        .wakeup_call
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    && self.wake().is_err()
                {
                    do_chores = true;
                }
            }

            let resized = resized_event_list(size, n);
            if resized != size {
                size = resized;
                events = vec![unsafe { std::mem::zeroed() }; size];
            }
        }
    }

    /// Refuse further triggers; pending tasks are dropped.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Close the wakeup eventfd and the epoll fd.
    pub fn close(&self) {
        self.shutdown();
        unsafe {
            libc::close(self.wakeup_fd);
            libc::close(self.epfd);
        }
    }
}
