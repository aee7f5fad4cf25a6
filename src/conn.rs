use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use socket2::SockAddr;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event_loop::EventLoopHandle;
use crate::options::Options;
use crate::queue::Priority;
use crate::ring::RingBuffer;
use crate::socket::{self, NetAddr, Network};

/// Per-fd connection state, owned by exactly one event loop and mutated only
/// on that loop's thread.
///
/// Handlers receive `&mut Conn` in callbacks: consume inbound bytes with
/// [`Conn::read`] / [`Conn::peek`] / [`Conn::discard`], queue outbound bytes
/// with [`Conn::write`] / [`Conn::writev`]. For thread-safe writes from
/// outside the loop, grab a [`ConnSender`].
pub struct Conn {
    pub(crate) fd: RawFd,
    pub(crate) handle: Arc<EventLoopHandle>,
    network: Network,
    local: NetAddr,
    remote: NetAddr,
    pub(crate) inbound: RingBuffer,
    pub(crate) outbound: RingBuffer,
    /// Outbound spillover once the ring is at its cap, oldest first.
    pending: VecDeque<Vec<u8>>,
    /// Bytes of the front spillover chunk already moved into the ring.
    pending_head: usize,
    pending_len: usize,
    pub(crate) opened: bool,
    pub(crate) is_eof: bool,
    pub(crate) close_requested: bool,
    pub(crate) close_err: Option<Error>,
    et: bool,
    datagram: bool,
    /// Reply address for datagrams arriving on a shared UDP socket.
    pub(crate) udp_peer: Option<SockAddr>,
    ctx: Option<Box<dyn Any + Send>>,
}

impl Conn {
    pub(crate) fn new_stream(
        network: Network,
        fd: RawFd,
        handle: Arc<EventLoopHandle>,
        local: NetAddr,
        remote: NetAddr,
        opts: &Options,
    ) -> Conn {
        Conn {
            fd,
            handle,
            network,
            local,
            remote,
            inbound: RingBuffer::new(opts.read_buffer_cap),
            outbound: RingBuffer::new(opts.write_buffer_cap),
            pending: VecDeque::new(),
            pending_head: 0,
            pending_len: 0,
            opened: false,
            is_eof: false,
            close_requested: false,
            close_err: None,
            et: opts.edge_triggered_io,
            datagram: false,
            udp_peer: None,
            ctx: None,
        }
    }

    pub(crate) fn new_datagram(
        fd: RawFd,
        handle: Arc<EventLoopHandle>,
        local: NetAddr,
        remote: NetAddr,
        udp_peer: Option<SockAddr>,
        opts: &Options,
    ) -> Conn {
        Conn {
            fd,
            handle,
            network: Network::Udp,
            local,
            remote,
            inbound: RingBuffer::new(opts.read_buffer_cap),
            outbound: RingBuffer::new(opts.write_buffer_cap),
            pending: VecDeque::new(),
            pending_head: 0,
            pending_len: 0,
            opened: false,
            is_eof: false,
            close_requested: false,
            close_err: None,
            et: opts.edge_triggered_io,
            datagram: true,
            udp_peer,
            ctx: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn local_addr(&self) -> &NetAddr {
        &self.local
    }

    pub fn remote_addr(&self) -> &NetAddr {
        &self.remote
    }

    /// Index of the event loop this connection lives on.
    pub fn event_loop_index(&self) -> i32 {
        self.handle.idx
    }

    // ---- inbound ----

    /// Bytes currently buffered inbound.
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// The buffered inbound bytes as up to two slices, oldest first, without
    /// consuming them.
    pub fn peek(&self) -> (&[u8], &[u8]) {
        self.inbound.peek()
    }

    /// Copy up to `out.len()` inbound bytes into `out` and consume them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.inbound.read(out)
    }

    /// Consume and return up to `n` inbound bytes.
    pub fn next(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.inbound.len());
        let mut out = vec![0u8; n];
        self.inbound.read(&mut out);
        out
    }

    /// Drop `n` inbound bytes. Returns how many were dropped.
    pub fn discard(&mut self, n: usize) -> usize {
        self.inbound.discard(n)
    }

    // ---- outbound ----

    /// Bytes queued outbound and not yet flushed to the socket.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len() + self.pending_len
    }

    /// Queue `data` to the peer. Bytes the socket cannot take immediately
    /// are buffered and drained on writable events.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.writev(&[data])
    }

    /// Gather-write several slices, preserving order across calls.
    pub fn writev(&mut self, bufs: &[&[u8]]) -> Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Ok(0);
        }
        if !self.opened || self.close_requested {
            return Err(Error::Io(io::Error::from(io::ErrorKind::NotConnected)));
        }

        if self.datagram {
            return self.send_datagram(bufs, total);
        }

        // Pending data keeps packet order: append behind it.
        if self.outbound_len() > 0 {
            for b in bufs {
                self.buffer_outbound(b);
            }
            return Ok(total);
        }

        // Fast path: write straight to the socket, buffer the remainder.
        let mut offset = 0usize;
        loop {
            let remaining = remaining_bufs(bufs, offset);
            if remaining.is_empty() {
                return Ok(total);
            }
            match socket::writev(self.fd, &remaining) {
                Ok(n) => {
                    offset += n;
                    if offset == total {
                        return Ok(total);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.close_requested = true;
                    self.close_err = Some(Error::Io(io::Error::new(err.kind(), "write")));
                    return Err(Error::Io(err));
                }
            }
        }

        for b in remaining_bufs(bufs, offset) {
            self.buffer_outbound(b);
        }
        if !self.et {
            // Level-triggered: start watching for writable.
            let _ = self.handle.poller.mod_read_write(self.fd, false);
        }
        Ok(total)
    }

    fn send_datagram(&mut self, bufs: &[&[u8]], total: usize) -> Result<usize> {
        let data: Vec<u8> = if bufs.len() == 1 {
            bufs[0].to_vec()
        } else {
            let mut joined = Vec::with_capacity(total);
            for b in bufs {
                joined.extend_from_slice(b);
            }
            joined
        };
        let sent = match &self.udp_peer {
            Some(peer) => socket::send_to(self.fd, &data, peer)?,
            None => {
                let n = unsafe {
                    libc::write(self.fd, data.as_ptr() as *const libc::c_void, data.len())
                };
                if n < 0 {
                    return Err(Error::Io(io::Error::last_os_error()));
                }
                n as usize
            }
        };
        Ok(sent)
    }

    fn buffer_outbound(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.pending.is_empty() {
            let accepted = self.outbound.write(data);
            if accepted < data.len() {
                self.pending_len += data.len() - accepted;
                self.pending.push_back(data[accepted..].to_vec());
            }
        } else {
            self.pending_len += data.len();
            self.pending.push_back(data.to_vec());
        }
    }

    /// Move spillover chunks into the ring as it drains.
    pub(crate) fn refill_outbound(&mut self) {
        while let Some(front) = self.pending.front() {
            let n = self.outbound.write(&front[self.pending_head..]);
            self.pending_head += n;
            self.pending_len -= n;
            if self.pending_head == front.len() {
                self.pending.pop_front();
                self.pending_head = 0;
            } else {
                break;
            }
        }
    }

    // ---- lifecycle ----

    /// Ask the loop to close this connection once the current callback
    /// returns.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    /// A cloneable, thread-safe handle for writing to and closing this
    /// connection from outside its loop thread.
    pub fn sender(&self) -> ConnSender {
        ConnSender {
            fd: self.fd,
            handle: self.handle.clone(),
        }
    }

    // ---- user context ----

    /// Attach arbitrary user state to the connection.
    pub fn set_context<T: Any + Send>(&mut self, ctx: T) {
        self.ctx = Some(Box::new(ctx));
    }

    pub fn context<T: Any + Send>(&self) -> Option<&T> {
        self.ctx.as_ref().and_then(|c| c.downcast_ref::<T>())
    }

    pub fn context_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.ctx.as_mut().and_then(|c| c.downcast_mut::<T>())
    }

    pub fn take_context(&mut self) -> Option<Box<dyn Any + Send>> {
        self.ctx.take()
    }

    pub(crate) fn set_boxed_context(&mut self, ctx: Option<Box<dyn Any + Send>>) {
        self.ctx = ctx;
    }

    pub(crate) fn is_datagram(&self) -> bool {
        self.datagram
    }

    /// Tear down buffers and state; the backing stores go back to the pool.
    pub(crate) fn release(&mut self) {
        self.opened = false;
        self.inbound.release();
        self.outbound.release();
        self.pending.clear();
        self.pending_head = 0;
        self.pending_len = 0;
        self.ctx = None;
    }
}

/// Skip the first `offset` bytes of a buffer list, yielding the remainder as
/// borrowed slices for a gather write.
fn remaining_bufs<'a>(bufs: &[&'a [u8]], mut offset: usize) -> Vec<&'a [u8]> {
    let mut out = Vec::with_capacity(bufs.len());
    for &b in bufs {
        if offset >= b.len() {
            offset -= b.len();
            continue;
        }
        out.push(&b[offset..]);
        offset = 0;
    }
    out
}

/// Thread-safe handle to a connection, routed through the owning loop's
/// poller. The original fd is the key: if the connection has already closed,
/// sends are dropped with a debug log.
#[derive(Clone)]
pub struct ConnSender {
    fd: RawFd,
    handle: Arc<EventLoopHandle>,
}

impl ConnSender {
    pub(crate) fn new(fd: RawFd, handle: Arc<EventLoopHandle>) -> ConnSender {
        ConnSender { fd, handle }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Queue `data` on the connection from any thread.
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        let fd = self.fd;
        self.handle.poller.trigger(
            Priority::Low,
            Box::new(move |el| {
                if !el.async_write(fd, &data)? {
                    debug!("async write to fd {fd} dropped: connection is gone");
                }
                Ok(())
            }),
        )
    }

    /// Close the connection from any thread.
    pub fn close(&self) -> Result<()> {
        let fd = self.fd;
        self.handle
            .poller
            .trigger(Priority::Low, Box::new(move |el| el.close_by_fd(fd, None)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_bufs_skips_consumed_prefix() {
        let a: &[u8] = b"hello";
        let b: &[u8] = b"world";
        let rem = remaining_bufs(&[a, b], 7);
        assert_eq!(rem, vec![&b"rld"[..]]);
        let rem = remaining_bufs(&[a, b], 5);
        assert_eq!(rem, vec![&b"world"[..]]);
        assert!(remaining_bufs(&[a, b], 10).is_empty());
    }
}
