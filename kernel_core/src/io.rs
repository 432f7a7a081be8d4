//! I/O port sets
//!
//! An I/O descriptor names a set of ports. Enabling it in a thread grants
//! that thread access to exactly those ports; full-I/O grants the whole
//! range.

use std::collections::BTreeSet;
use std::sync::Arc;

/// An immutable set of I/O ports.
pub struct IoSpace {
    ports: BTreeSet<u64>,
}

impl IoSpace {
    pub fn new(ports: impl IntoIterator<Item = u64>) -> Arc<IoSpace> {
        Arc::new(IoSpace {
            ports: ports.into_iter().collect(),
        })
    }

    pub fn contains(&self, port: u64) -> bool {
        self.ports.contains(&port)
    }

    pub fn ports(&self) -> impl Iterator<Item = u64> + '_ {
        self.ports.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
