//! Socket plumbing: create/bind/listen/accept/dup plus the `SO_*`/`TCP_*`
//! option set. Built on socket2 where it has a wrapper and raw libc where it
//! does not.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, TcpKeepalive, Type};

use crate::error::{Error, Result};
use crate::options::{Options, TcpNoDelay};

/// Listen backlog for stream listeners.
pub(crate) const LISTEN_BACKLOG: i32 = 1024;

/// Whether accepted sockets inherit TCP keepalive from the listener.
/// True on Linux, FreeBSD and DragonFlyBSD; everywhere else keepalive must
/// be set per accepted fd.
pub(crate) const KEEPALIVE_INHERITED: bool = cfg!(any(
    target_os = "linux",
    target_os = "freebsd",
    target_os = "dragonfly"
));

/// The transport a listener or dialed connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Network {
    pub fn is_tcp(self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }

    pub fn is_udp(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    pub fn is_unix(self) -> bool {
        matches!(self, Network::Unix)
    }

    /// The canonical network after binding: tcp4/tcp6 collapse to tcp,
    /// udp4/udp6 to udp.
    pub fn canonical(self) -> Network {
        match self {
            Network::Tcp4 | Network::Tcp6 => Network::Tcp,
            Network::Udp4 | Network::Udp6 => Network::Udp,
            other => other,
        }
    }

    fn wants_v4(self) -> bool {
        matches!(self, Network::Tcp4 | Network::Udp4)
    }

    fn wants_v6(self) -> bool {
        matches!(self, Network::Tcp6 | Network::Udp6)
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            "unix" => Ok(Network::Unix),
            _ => Err(Error::UnsupportedProtocol),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Unix => "unix",
        };
        f.write_str(s)
    }
}

/// A local or remote endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAddr {
    Ip(SocketAddr),
    Unix(PathBuf),
    /// An unbound or anonymous endpoint.
    Unnamed,
}

impl NetAddr {
    pub fn ip(&self) -> Option<SocketAddr> {
        match self {
            NetAddr::Ip(addr) => Some(*addr),
            _ => None,
        }
    }

    /// The bytes fed to the source-address hash: IP octets, or the socket
    /// path for unix-domain peers.
    pub(crate) fn hash_bytes(&self) -> Vec<u8> {
        match self {
            NetAddr::Ip(SocketAddr::V4(v4)) => v4.ip().octets().to_vec(),
            NetAddr::Ip(SocketAddr::V6(v6)) => v6.ip().octets().to_vec(),
            NetAddr::Unix(path) => path.as_os_str().as_encoded_bytes().to_vec(),
            NetAddr::Unnamed => Vec::new(),
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddr::Ip(addr) => write!(f, "{addr}"),
            NetAddr::Unix(path) => write!(f, "{}", path.display()),
            NetAddr::Unnamed => f.write_str("<unnamed>"),
        }
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        NetAddr::Ip(addr)
    }
}

pub(crate) fn sockaddr_to_net_addr(addr: &SockAddr) -> NetAddr {
    if let Some(ip) = addr.as_socket() {
        NetAddr::Ip(ip)
    } else if let Some(path) = addr.as_pathname() {
        NetAddr::Unix(path.to_path_buf())
    } else {
        NetAddr::Unnamed
    }
}

fn resolve(network: Network, address: &str) -> Result<SocketAddr> {
    let mut candidates = address
        .to_socket_addrs()
        .map_err(|_| Error::InvalidNetworkAddress)?;
    candidates
        .find(|a| {
            if network.wants_v4() {
                a.is_ipv4()
            } else if network.wants_v6() {
                a.is_ipv6()
            } else {
                true
            }
        })
        .ok_or(Error::InvalidNetworkAddress)
}

fn with_sock<T>(fd: RawFd, f: impl FnOnce(SockRef<'_>) -> io::Result<T>) -> io::Result<T> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    f(SockRef::from(&borrowed))
}

pub(crate) fn set_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    with_sock(fd, |s| s.set_nodelay(on))
}

pub(crate) fn set_send_buffer(fd: RawFd, bytes: usize) -> io::Result<()> {
    with_sock(fd, |s| s.set_send_buffer_size(bytes))
}

pub(crate) fn set_recv_buffer(fd: RawFd, bytes: usize) -> io::Result<()> {
    with_sock(fd, |s| s.set_recv_buffer_size(bytes))
}

/// Enable TCP keepalive with the engine's defaulting rules: a zero interval
/// means idle / 5, a zero count means 5 probes.
pub(crate) fn set_keep_alive(
    fd: RawFd,
    idle: Duration,
    mut interval: Duration,
    mut count: u32,
) -> io::Result<()> {
    if interval.is_zero() {
        interval = idle / 5;
    }
    if count == 0 {
        count = 5;
    }
    let params = TcpKeepalive::new()
        .with_time(idle)
        .with_interval(interval)
        .with_retries(count);
    with_sock(fd, |s| s.set_tcp_keepalive(&params))
}

fn apply_common_options(socket: &Socket, network: Network, opts: &Options) -> Result<()> {
    if opts.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if opts.reuse_port && !network.is_unix() {
        socket.set_reuse_port(true)?;
    }
    if network.is_tcp() && opts.tcp_no_delay == TcpNoDelay::On {
        socket.set_nodelay(true)?;
    }
    if opts.socket_send_buffer > 0 {
        socket.set_send_buffer_size(opts.socket_send_buffer)?;
    }
    if opts.socket_recv_buffer > 0 {
        socket.set_recv_buffer_size(opts.socket_recv_buffer)?;
    }
    if !opts.bind_to_device.is_empty() {
        #[cfg(target_os = "linux")]
        socket.bind_device(Some(opts.bind_to_device.as_bytes()))?;
        #[cfg(not(target_os = "linux"))]
        return Err(Error::UnsupportedOp);
    }
    Ok(())
}

/// Create a bound, listening, non-blocking TCP socket.
pub(crate) fn tcp_listener_fd(
    network: Network,
    address: &str,
    opts: &Options,
) -> Result<(RawFd, NetAddr)> {
    if !network.is_tcp() {
        return Err(Error::UnsupportedTcpProtocol);
    }
    let addr = resolve(network, address)?;
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    apply_common_options(&socket, network, opts)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    let local = sockaddr_to_net_addr(&socket.local_addr()?);
    Ok((socket.into_raw_fd(), local))
}

/// Create a bound, non-blocking UDP socket, joining a multicast group when
/// the bind address is one.
pub(crate) fn udp_socket_fd(
    network: Network,
    address: &str,
    opts: &Options,
    connect: bool,
) -> Result<(RawFd, NetAddr)> {
    if !network.is_udp() {
        return Err(Error::UnsupportedUdpProtocol);
    }
    let addr = resolve(network, address)?;
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    apply_common_options(&socket, network, opts)?;
    if connect {
        socket.connect(&addr.into())?;
    } else {
        if addr.ip().is_multicast() {
            join_multicast(&socket, &addr, opts.multicast_interface_index)?;
        }
        socket.bind(&addr.into())?;
    }
    let local = sockaddr_to_net_addr(&socket.local_addr()?);
    Ok((socket.into_raw_fd(), local))
}

#[cfg(target_os = "linux")]
fn join_multicast(socket: &Socket, addr: &SocketAddr, interface_index: u32) -> Result<()> {
    match addr {
        SocketAddr::V4(v4) => socket.join_multicast_v4_n(
            v4.ip(),
            &socket2::InterfaceIndexOrAddress::Index(interface_index),
        )?,
        SocketAddr::V6(v6) => socket.join_multicast_v6(v6.ip(), interface_index)?,
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn join_multicast(_socket: &Socket, _addr: &SocketAddr, _interface_index: u32) -> Result<()> {
    Err(Error::UnsupportedOp)
}

/// Create a bound, listening, non-blocking unix-domain socket. Any stale
/// socket file at `address` is removed first.
pub(crate) fn uds_listener_fd(
    network: Network,
    address: &str,
    opts: &Options,
) -> Result<(RawFd, NetAddr)> {
    if !network.is_unix() {
        return Err(Error::UnsupportedUdsProtocol);
    }
    let _ = std::fs::remove_file(address);
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    apply_common_options(&socket, network, opts)?;
    socket.bind(&SockAddr::unix(address)?)?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok((socket.into_raw_fd(), NetAddr::Unix(PathBuf::from(address))))
}

/// Accept one pending connection, leaving the new fd non-blocking and
/// close-on-exec. `WouldBlock` means the accept queue is drained.
pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, NetAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(not(target_os = "macos"))]
    let nfd = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    #[cfg(target_os = "macos")]
    let nfd = unsafe {
        let nfd = libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len);
        if nfd >= 0 {
            libc::fcntl(nfd, libc::F_SETFD, libc::FD_CLOEXEC);
            let flags = libc::fcntl(nfd, libc::F_GETFL);
            libc::fcntl(nfd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        nfd
    };

    if nfd < 0 {
        return Err(io::Error::last_os_error());
    }
    let addr = unsafe { SockAddr::new(storage, len) };
    Ok((nfd, sockaddr_to_net_addr(&addr)))
}

static TRY_DUPFD_CLOEXEC: AtomicBool = AtomicBool::new(true);

/// Duplicate `fd` with close-on-exec set, preferring `F_DUPFD_CLOEXEC` and
/// downgrading once, process-wide, to `dup` + `FD_CLOEXEC` on kernels that
/// reject it.
pub(crate) fn dup_cloexec(fd: RawFd) -> io::Result<RawFd> {
    if TRY_DUPFD_CLOEXEC.load(Ordering::Relaxed) {
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup >= 0 {
            return Ok(dup);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(err);
        }
        TRY_DUPFD_CLOEXEC.store(false, Ordering::Relaxed);
    }
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::fcntl(dup, libc::F_SETFD, libc::FD_CLOEXEC) };
    Ok(dup)
}

/// Gather-write `bufs` to `fd` with a single `writev`.
pub(crate) fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = bufs
        .iter()
        .filter(|b| !b.is_empty())
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    if iov.is_empty() {
        return Ok(0);
    }
    let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Scatter-read from `fd` into `bufs` with a single `readv`.
pub(crate) fn readv(fd: RawFd, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = bufs
        .iter_mut()
        .filter(|b| !b.is_empty())
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    if iov.is_empty() {
        return Ok(0);
    }
    let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Send one datagram to `addr`.
pub(crate) fn send_to(fd: RawFd, data: &[u8], addr: &SockAddr) -> io::Result<usize> {
    let n = unsafe {
        libc::sendto(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            0,
            addr.as_ptr() as *const libc::sockaddr,
            addr.len(),
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Receive one datagram along with its source address.
pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((n as usize, unsafe { SockAddr::new(storage, len) }))
}

/// Fetch the local address of a raw socket fd.
pub(crate) fn local_net_addr(fd: RawFd) -> NetAddr {
    with_sock(fd, |s| s.local_addr())
        .map(|a| sockaddr_to_net_addr(&a))
        .unwrap_or(NetAddr::Unnamed)
}

/// Fetch the peer address of a raw socket fd.
pub(crate) fn peer_net_addr(fd: RawFd) -> NetAddr {
    with_sock(fd, |s| s.peer_addr())
        .map(|a| sockaddr_to_net_addr(&a))
        .unwrap_or(NetAddr::Unnamed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_parsing() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("udp6".parse::<Network>().unwrap(), Network::Udp6);
        assert_eq!("unix".parse::<Network>().unwrap(), Network::Unix);
        assert!(matches!(
            "sctp".parse::<Network>(),
            Err(Error::UnsupportedProtocol)
        ));
    }

    #[test]
    fn canonical_collapses_families() {
        assert_eq!(Network::Tcp4.canonical(), Network::Tcp);
        assert_eq!(Network::Udp6.canonical(), Network::Udp);
        assert_eq!(Network::Unix.canonical(), Network::Unix);
    }

    #[test]
    fn tcp_listener_binds_ephemeral_port() {
        let opts = Options::default();
        let (fd, addr) = tcp_listener_fd(Network::Tcp, "127.0.0.1:0", &opts).unwrap();
        let ip = addr.ip().expect("ip address");
        assert_ne!(ip.port(), 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn dup_cloexec_produces_distinct_fd() {
        let opts = Options::default();
        let (fd, _) = tcp_listener_fd(Network::Tcp, "127.0.0.1:0", &opts).unwrap();
        let dup = dup_cloexec(fd).unwrap();
        assert_ne!(fd, dup);
        unsafe {
            libc::close(dup);
            libc::close(fd);
        }
    }

    #[test]
    fn family_specific_resolution() {
        assert!(resolve(Network::Tcp4, "127.0.0.1:80").unwrap().is_ipv4());
        assert!(resolve(Network::Tcp6, "[::1]:80").unwrap().is_ipv6());
        assert!(matches!(
            resolve(Network::Tcp6, "127.0.0.1:80"),
            Err(Error::InvalidNetworkAddress)
        ));
    }
}
