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

/// The kevent filter reported to the poll callback.
pub type IOEvent = i16;
/// The kevent flags reported to the poll callback.
pub type IOFlags = u16;

/// Readable filter polled by kqueue.
pub const READ_EVENTS: IOEvent = libc::EVFILT_READ as i16;
/// Writable filter polled by kqueue.
pub const WRITE_EVENTS: IOEvent = libc::EVFILT_WRITE as i16;

/// `EVFILT_USER` is missing on NetBSD/OpenBSD; a non-blocking pipe pair
/// stands in as the wakeup primitive there.
const PIPE_WAKEUP: bool =
    cfg!(any(target_os = "netbsd", target_os = "openbsd"));

fn kev(ident: RawFd, filter: i16, flags: u16) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = ident as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev
}

/// A poller backed by kqueue, woken through `EVFILT_USER` or a pipe.
///
/// Exactly one thread runs [`Poller::polling`]; [`Poller::trigger`] is safe
/// from any thread. `C` is the loop context handed to injected tasks.
pub struct Poller<C> {
    kq: RawFd,
    pipe: Option<(RawFd, RawFd)>,
    wakeup_call: AtomicBool,
    closed: AtomicBool,
    queues: TaskQueues<C>,
    high_priority_threshold: usize,
}

impl<C> Poller<C> {
    /// Allocate the kqueue and register the wakeup primitive.
    pub fn open() -> Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::PollerInit(io::Error::last_os_error()));
        }
        unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) };
        let mut poller = Poller {
            kq,
            pipe: None,
            wakeup_call: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            queues: TaskQueues::new(),
            high_priority_threshold: MAX_POLL_EVENTS_CAP,
        };
        if let Err(err) = poller.add_wakeup_event() {
            poller.close();
            return Err(Error::PollerInit(err));
        }
        Ok(poller)
    }

    #[cfg(not(any(target_os = "netbsd", target_os = "openbsd")))]
    fn add_wakeup_event(&mut self) -> io::Result<()> {
        let changes = [kev(
            0,
            libc::EVFILT_USER as i16,
            (libc::EV_ADD | libc::EV_CLEAR) as u16,
        )];
        self.kevent(&changes, &mut [], None).map(|_| ())
    }

    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    fn add_wakeup_event(&mut self) -> io::Result<()> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        self.pipe = Some((fds[0], fds[1]));
        let changes = [kev(fds[0], libc::EVFILT_READ as i16, libc::EV_ADD as u16)];
        self.kevent(&changes, &mut [], None).map(|_| ())
    }

    fn kevent(
        &self,
        changes: &[libc::kevent],
        events: &mut [libc::kevent],
        timeout: Option<&libc::timespec>,
    ) -> io::Result<usize> {
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as _,
                events.as_mut_ptr(),
                events.len() as _,
                timeout
                    .map(|ts| ts as *const libc::timespec)
                    .unwrap_or(std::ptr::null()),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn interest_flags(edge_triggered: bool) -> u16 {
        if edge_triggered {
            (libc::EV_ADD | libc::EV_CLEAR) as u16
        } else {
            libc::EV_ADD as u16
        }
    }

    /// Register `fd` with read interest.
    pub fn add_read(&self, fd: RawFd, edge_triggered: bool) -> Result<()> {
        let changes = [kev(fd, READ_EVENTS, Self::interest_flags(edge_triggered))];
        self.kevent(&changes, &mut [], None)
            .map(|_| ())
            .map_err(Error::Io)
    }

    /// Register `fd` with write interest.
    pub fn add_write(&self, fd: RawFd, edge_triggered: bool) -> Result<()> {
        let changes = [kev(fd, WRITE_EVENTS, Self::interest_flags(edge_triggered))];
        self.kevent(&changes, &mut [], None)
            .map(|_| ())
            .map_err(Error::Io)
    }

    /// Register `fd` with read and write interest.
    pub fn add_read_write(&self, fd: RawFd, edge_triggered: bool) -> Result<()> {
        let flags = Self::interest_flags(edge_triggered);
        let changes = [kev(fd, READ_EVENTS, flags), kev(fd, WRITE_EVENTS, flags)];
        self.kevent(&changes, &mut [], None)
            .map(|_| ())
            .map_err(Error::Io)
    }

    /// Narrow `fd` back to read-only interest by deleting the write filter.
    /// The read filter is assumed to be registered already.
    pub fn mod_read(&self, fd: RawFd, _edge_triggered: bool) -> Result<()> {
        let changes = [kev(fd, WRITE_EVENTS, libc::EV_DELETE as u16)];
        self.kevent(&changes, &mut [], None)
            .map(|_| ())
            .map_err(Error::Io)
    }

    /// Widen `fd` to read and write interest by adding the write filter.
    pub fn mod_read_write(&self, fd: RawFd, edge_triggered: bool) -> Result<()> {
        let changes = [kev(fd, WRITE_EVENTS, Self::interest_flags(edge_triggered))];
        self.kevent(&changes, &mut [], None)
            .map(|_| ())
            .map_err(Error::Io)
    }

    /// Removing a closed fd is implicit on kqueue.
    pub fn delete(&self, _fd: RawFd) -> Result<()> {
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
        if let Some((_, w)) = self.pipe {
            let byte = [0u8; 1];
            loop {
                let rc =
                    unsafe { libc::write(w, byte.as_ptr() as *const libc::c_void, 1) };
                if rc >= 0 {
                    return Ok(());
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    // Pipe full: a wakeup is already pending.
                    Some(libc::EAGAIN) => return Ok(()),
                    Some(libc::EINTR) => continue,
                    _ => {
                        warn!("failed to wake up the poller: {err}");
                        return Err(Error::Io(err));
                    }
                }
            }
        }
        #[cfg(not(any(target_os = "netbsd", target_os = "openbsd")))]
        {
            let mut ev = kev(0, libc::EVFILT_USER as i16, 0);
            ev.fflags = libc::NOTE_TRIGGER;
            loop {
                match self.kevent(&[ev], &mut [], None) {
                    Ok(_) => return Ok(()),
                    Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(err) => {
                        warn!("failed to wake up the poller: {err}");
                        return Err(Error::Io(err));
                    }
                }
            }
        }
        #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
        unreachable!("pipe wakeup is always initialized on this platform")
    }

    fn drain_wakeup(&self) {
        if let Some((r, _)) = self.pipe {
            let mut buf = [0u8; 64];
            loop {
                let rc = unsafe {
                    libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if rc < buf.len() as isize {
                    break;
                }
            }
        }
        // EV_CLEAR on the EVFILT_USER event resets it on delivery.
    }

    fn is_wakeup(&self, ev: &libc::kevent) -> bool {
        if let Some((r, _)) = self.pipe {
            ev.ident as RawFd == r
        } else {
            ev.ident == 0
        }
    }

    /// Block on kqueue until shutdown, invoking `callback` for every fd
    /// event and draining pending tasks at the end of each batch.
    ///
    /// Returns the [`Error::EngineShutdown`] / [`Error::AcceptSocket`] that
    /// terminated the loop, or the kevent failure.
    pub fn polling<F>(&self, ctx: &mut C, mut callback: F) -> Result<()>
    where
        F: FnMut(&mut C, RawFd, IOEvent, IOFlags) -> Result<()>,
    {
        let mut size = INIT_POLL_EVENTS_CAP;
        let mut events: Vec<libc::kevent> =
            vec![unsafe { std::mem::zeroed() }; size];
        let zero_ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let mut timeout: Option<&libc::timespec> = None;
        let mut do_chores = false;

        loop {
            let n = match self.kevent(&[], &mut events, timeout) {
                Ok(0) => {
                    timeout = None;
                    std::thread::yield_now();
                    continue;
                }
                Ok(n) => n,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {
                    timeout = None;
                    std::thread::yield_now();
                    continue;
                }
                Err(err) => {
                    error!("error occurs in kqueue: {err}");
                    return Err(Error::Io(err));
                }
            };
            timeout = Some(&zero_ts);

            for i in 0..n {
                let ev = events[i];
                if self.is_wakeup(&ev) {
                    do_chores = true;
                    self.drain_wakeup();
                    continue;
                }
                if let Err(err) =
                    callback(ctx, ev.ident as RawFd, ev.filter as i16, ev.flags as u16)
                {
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

    /// Close the wakeup primitive and the kqueue fd.
    pub fn close(&self) {
        self.shutdown();
        if let Some((r, w)) = self.pipe {
            unsafe {
                libc::close(r);
                libc::close(w);
            }
        }
        unsafe {
            libc::close(self.kq);
        }
    }
}
