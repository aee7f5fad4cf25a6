use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::event_loop::EventLoopHandle;
use crate::options::LoadBalancing;
use crate::socket::NetAddr;

/// Picks which event loop receives each new connection.
///
/// Ties (least-connections) break toward the lower loop index.
pub(crate) struct Balancer {
    policy: LoadBalancing,
    loops: Vec<Arc<EventLoopHandle>>,
    cursor: AtomicUsize,
}

impl Balancer {
    pub(crate) fn new(policy: LoadBalancing) -> Balancer {
        Balancer {
            policy,
            loops: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Add a loop. Called only during engine start, before any `next`.
    pub(crate) fn register(&mut self, handle: Arc<EventLoopHandle>) {
        self.loops.push(handle);
    }

    pub(crate) fn len(&self) -> usize {
        self.loops.len()
    }

    pub(crate) fn iterate(&self, mut f: impl FnMut(usize, &Arc<EventLoopHandle>) -> bool) {
        for (i, handle) in self.loops.iter().enumerate() {
            if !f(i, handle) {
                return;
            }
        }
    }

    /// Choose the loop for a connection from `remote`.
    pub(crate) fn next(&self, remote: Option<&NetAddr>) -> Arc<EventLoopHandle> {
        debug_assert!(!self.loops.is_empty());
        match self.policy {
            LoadBalancing::RoundRobin => {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.loops.len();
                self.loops[i].clone()
            }
            LoadBalancing::LeastConnections => {
                let mut best = 0;
                let mut best_load = i32::MAX;
                for (i, handle) in self.loops.iter().enumerate() {
                    let load = handle.load();
                    if load < best_load {
                        best = i;
                        best_load = load;
                    }
                }
                self.loops[best].clone()
            }
            LoadBalancing::SourceAddrHash => {
                let hash = match remote {
                    Some(addr) => fnv1a_32(&addr.hash_bytes()),
                    None => 0,
                };
                self.loops[hash as usize % self.loops.len()].clone()
            }
        }
    }
}

/// 32-bit FNV-1a over the remote address bytes.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
