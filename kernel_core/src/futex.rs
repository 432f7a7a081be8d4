//! Futexes
//!
//! Address-keyed wait queues, private to one address space. The wait
//! compares the futex word under the bucket lock, so a wake that follows a
//! store cannot be missed; wake releases every waiter on the address.

use core_types::{KernelResult, VirtAddr};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::address_space::AddressSpace;

struct FutexNode {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl FutexNode {
    fn new() -> Arc<FutexNode> {
        Arc::new(FutexNode {
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    fn block(&self) {
        let mut woken = self.woken.lock().expect("futex node lock");
        while !*woken {
            woken = self.condvar.wait(woken).expect("futex node wait");
        }
    }

    fn wake(&self) {
        let mut woken = self.woken.lock().expect("futex node lock");
        *woken = true;
        self.condvar.notify_all();
    }
}

/// Per-space futex table.
pub(crate) struct FutexSpace {
    buckets: Mutex<HashMap<u64, VecDeque<Arc<FutexNode>>>>,
}

impl FutexSpace {
    pub fn new() -> FutexSpace {
        FutexSpace {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks while `*addr == expected`; returns immediately otherwise.
    pub fn wait(&self, space: &AddressSpace, addr: VirtAddr, expected: u32) -> KernelResult<()> {
        // Resolve the word once up front so a fault happens outside the
        // bucket lock; the page stays resident afterwards.
        space.read_u32(addr)?;

        let node = {
            let mut buckets = self.buckets.lock().expect("futex table lock");
            let value = space.read_u32(addr)?;
            if value != expected {
                return Ok(());
            }
            let node = FutexNode::new();
            buckets.entry(addr.value()).or_default().push_back(node.clone());
            node
        };

        node.block();
        Ok(())
    }

    /// Wakes every waiter on `addr`; returns how many were released.
    pub fn wake(&self, addr: VirtAddr) -> usize {
        let nodes = {
            let mut buckets = self.buckets.lock().expect("futex table lock");
            buckets.remove(&addr.value()).unwrap_or_default()
        };
        for node in &nodes {
            node.wake();
        }
        nodes.len()
    }

    /// Waiters currently parked on `addr` (tests).
    pub fn waiter_count(&self, addr: VirtAddr) -> usize {
        let buckets = self.buckets.lock().expect("futex table lock");
        buckets.get(&addr.value()).map_or(0, VecDeque::len)
    }
}
