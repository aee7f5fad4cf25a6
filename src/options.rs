use std::time::Duration;

use crate::ring::{DEFAULT_BUFFER_SIZE, MAX_STREAM_BUFFER_CAP};

/// Load-balancing policy for distributing accepted connections across
/// event loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancing {
    /// Assign loops in rotation.
    #[default]
    RoundRobin,
    /// Assign the loop with the fewest resident connections.
    LeastConnections,
    /// Hash the remote address so a peer always lands on the same loop.
    SourceAddrHash,
}

/// TCP_NODELAY behavior for new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpNoDelay {
    /// Leave the kernel default (Nagle enabled).
    #[default]
    Default,
    /// Disable Nagle's algorithm.
    On,
}

/// Engine configuration.
///
/// All fields have usable defaults; construct with `Options::default()` and
/// override with the `with_*` builders.
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of event loops. 0 means one per CPU.
    pub num_event_loop: usize,
    /// Pin each event-loop thread to a CPU core. Required bookkeeping caps
    /// the loop count at 10,000 when set.
    pub lock_os_thread: bool,
    /// Run the `on_tick` timer on the designated loop.
    pub ticker: bool,
    /// Initial capacity of each connection's inbound ring buffer.
    /// Rounded to a power of two and clamped to
    /// [`DEFAULT_BUFFER_SIZE`, `MAX_STREAM_BUFFER_CAP`].
    pub read_buffer_cap: usize,
    /// Initial capacity of each connection's outbound ring buffer.
    /// Clamped like `read_buffer_cap`.
    pub write_buffer_cap: usize,
    /// Register connections edge-triggered and drain fully on each event.
    pub edge_triggered_io: bool,
    /// Per-event byte budget when draining in edge-triggered mode.
    /// Rounded up to a power of two; defaults to 1 MiB when ET is on.
    pub edge_triggered_io_chunk: usize,
    /// Load-balancing policy.
    pub lb: LoadBalancing,
    /// Bind every loop's own copy of each listener with SO_REUSEPORT and let
    /// the kernel spread accepts, instead of running a dedicated acceptor.
    pub reuse_port: bool,
    /// Set SO_REUSEADDR on listeners.
    pub reuse_addr: bool,
    /// TCP_NODELAY for accepted and dialed TCP connections.
    pub tcp_no_delay: TcpNoDelay,
    /// TCP keepalive idle time. Zero disables keepalive.
    pub tcp_keep_alive: Duration,
    /// Interval between keepalive probes. Zero means idle / 5.
    pub tcp_keep_interval: Duration,
    /// Number of failed probes before the connection is dropped.
    /// Zero means 5.
    pub tcp_keep_count: u32,
    /// SO_SNDBUF for new sockets. Zero leaves the kernel default.
    pub socket_send_buffer: usize,
    /// SO_RCVBUF for new sockets. Zero leaves the kernel default.
    pub socket_recv_buffer: usize,
    /// Interface index for joining a multicast group on UDP binds.
    /// Zero lets the kernel pick.
    pub multicast_interface_index: u32,
    /// Bind sockets to this device (SO_BINDTODEVICE, Linux only).
    pub bind_to_device: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            num_event_loop: 0,
            lock_os_thread: false,
            ticker: false,
            read_buffer_cap: 0,
            write_buffer_cap: 0,
            edge_triggered_io: false,
            edge_triggered_io_chunk: 0,
            lb: LoadBalancing::RoundRobin,
            reuse_port: false,
            reuse_addr: false,
            tcp_no_delay: TcpNoDelay::Default,
            tcp_keep_alive: Duration::ZERO,
            tcp_keep_interval: Duration::ZERO,
            tcp_keep_count: 0,
            socket_send_buffer: 0,
            socket_recv_buffer: 0,
            multicast_interface_index: 0,
            bind_to_device: String::new(),
        }
    }
}

impl Options {
    /// Normalize buffer capacities and the edge-triggered chunk size.
    /// Called once by the engine/client before loops start.
    pub(crate) fn normalize(&mut self) {
        if self.edge_triggered_io_chunk > 0 {
            self.edge_triggered_io = true;
            self.edge_triggered_io_chunk =
                self.edge_triggered_io_chunk.next_power_of_two();
        } else if self.edge_triggered_io {
            self.edge_triggered_io_chunk = 1 << 20;
        }
        self.read_buffer_cap = clamp_buffer_cap(self.read_buffer_cap);
        self.write_buffer_cap = clamp_buffer_cap(self.write_buffer_cap);
    }

    pub fn with_num_event_loop(mut self, n: usize) -> Self {
        self.num_event_loop = n;
        self
    }

    pub fn with_lock_os_thread(mut self, on: bool) -> Self {
        self.lock_os_thread = on;
        self
    }

    pub fn with_ticker(mut self, on: bool) -> Self {
        self.ticker = on;
        self
    }

    pub fn with_read_buffer_cap(mut self, cap: usize) -> Self {
        self.read_buffer_cap = cap;
        self
    }

    pub fn with_write_buffer_cap(mut self, cap: usize) -> Self {
        self.write_buffer_cap = cap;
        self
    }

    pub fn with_edge_triggered_io(mut self, on: bool) -> Self {
        self.edge_triggered_io = on;
        self
    }

    pub fn with_edge_triggered_io_chunk(mut self, chunk: usize) -> Self {
        self.edge_triggered_io_chunk = chunk;
        self
    }

    pub fn with_load_balancing(mut self, lb: LoadBalancing) -> Self {
        self.lb = lb;
        self
    }

    pub fn with_reuse_port(mut self, on: bool) -> Self {
        self.reuse_port = on;
        self
    }

    pub fn with_reuse_addr(mut self, on: bool) -> Self {
        self.reuse_addr = on;
        self
    }

    pub fn with_tcp_no_delay(mut self, nodelay: TcpNoDelay) -> Self {
        self.tcp_no_delay = nodelay;
        self
    }

    pub fn with_tcp_keep_alive(mut self, idle: Duration) -> Self {
        self.tcp_keep_alive = idle;
        self
    }

    pub fn with_tcp_keep_interval(mut self, interval: Duration) -> Self {
        self.tcp_keep_interval = interval;
        self
    }

    pub fn with_tcp_keep_count(mut self, count: u32) -> Self {
        self.tcp_keep_count = count;
        self
    }

    pub fn with_socket_send_buffer(mut self, bytes: usize) -> Self {
        self.socket_send_buffer = bytes;
        self
    }

    pub fn with_socket_recv_buffer(mut self, bytes: usize) -> Self {
        self.socket_recv_buffer = bytes;
        self
    }

    pub fn with_multicast_interface_index(mut self, index: u32) -> Self {
        self.multicast_interface_index = index;
        self
    }

    pub fn with_bind_to_device(mut self, device: &str) -> Self {
        self.bind_to_device = device.to_string();
        self
    }
}

fn clamp_buffer_cap(cap: usize) -> usize {
    if cap == 0 {
        MAX_STREAM_BUFFER_CAP
    } else if cap <= DEFAULT_BUFFER_SIZE {
        DEFAULT_BUFFER_SIZE
    } else {
        cap.next_power_of_two().min(MAX_STREAM_BUFFER_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_caps_clamp_to_powers_of_two() {
        let mut opts = Options::default()
            .with_read_buffer_cap(5000)
            .with_write_buffer_cap(100);
        opts.normalize();
        assert_eq!(opts.read_buffer_cap, 8192);
        assert_eq!(opts.write_buffer_cap, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn zero_caps_default_to_max() {
        let mut opts = Options::default();
        opts.normalize();
        assert_eq!(opts.read_buffer_cap, MAX_STREAM_BUFFER_CAP);
        assert_eq!(opts.write_buffer_cap, MAX_STREAM_BUFFER_CAP);
    }

    #[test]
    fn et_chunk_defaults_and_rounds() {
        let mut opts = Options::default().with_edge_triggered_io(true);
        opts.normalize();
        assert_eq!(opts.edge_triggered_io_chunk, 1 << 20);

        let mut opts = Options::default().with_edge_triggered_io_chunk(3000);
        opts.normalize();
        assert!(opts.edge_triggered_io);
        assert_eq!(opts.edge_triggered_io_chunk, 4096);
    }
}
