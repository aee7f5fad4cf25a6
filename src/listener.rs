use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

use crate::error::Result;
use crate::options::Options;
use crate::socket::{self, NetAddr, Network};

/// A bound and listening (or UDP-bound) socket owned by the engine.
/// Immutable after init; closed exactly once.
pub(crate) struct Listener {
    pub(crate) fd: RawFd,
    pub(crate) network: Network,
    pub(crate) address: String,
    pub(crate) local_addr: NetAddr,
    closed: AtomicBool,
}

impl Listener {
    /// Create the socket for `network://address` with the option set applied,
    /// and arrange keepalive inheritance where the platform supports it.
    pub(crate) fn init(network: Network, address: &str, opts: &Options) -> Result<Listener> {
        let (fd, local_addr) = match network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                socket::tcp_listener_fd(network, address, opts)?
            }
            Network::Udp | Network::Udp4 | Network::Udp6 => {
                socket::udp_socket_fd(network, address, opts, false)?
            }
            Network::Unix => socket::uds_listener_fd(network, address, opts)?,
        };

        let ln = Listener {
            fd,
            network: network.canonical(),
            address: address.to_string(),
            local_addr,
            closed: AtomicBool::new(false),
        };

        if ln.network.is_tcp() && !opts.tcp_keep_alive.is_zero() && socket::KEEPALIVE_INHERITED {
            // Accepted sockets inherit these from the listener here; other
            // platforms set them per accepted fd instead.
            if let Err(err) = socket::set_keep_alive(
                ln.fd,
                opts.tcp_keep_alive,
                opts.tcp_keep_interval,
                opts.tcp_keep_count,
            ) {
                error!("failed to set TCP keepalive on listener {}: {err}", ln.address);
            }
        }

        Ok(ln)
    }

    /// Close the socket. Idempotent; unlinks the socket file for UDS.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.fd >= 0 {
            let rc = unsafe { libc::close(self.fd) };
            if rc < 0 {
                error!(
                    "failed to close listener fd {}: {}",
                    self.fd,
                    std::io::Error::last_os_error()
                );
            }
        }
        if self.network.is_unix() {
            let _ = std::fs::remove_file(&self.address);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}
