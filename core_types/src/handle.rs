//! Descriptor handles
//!
//! A handle is an opaque integer naming a descriptor within one universe.
//! Handles are only meaningful relative to the universe that allocated them;
//! transferring a descriptor to another universe yields a fresh handle there.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque descriptor handle.
///
/// Positive values name descriptors in a universe's table. Zero and negative
/// values are reserved sentinels that syscalls interpret specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(i64);

impl Handle {
    /// The null handle; syscalls that accept it substitute a caller default
    /// (own universe, own address space).
    pub const NULL: Handle = Handle(0);

    /// Sentinel naming the calling thread's own universe.
    pub const THIS_UNIVERSE: Handle = Handle(-1);

    /// Sentinel naming the calling thread itself.
    pub const THIS_THREAD: Handle = Handle(-2);

    /// Creates a handle from its raw integer value.
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer value.
    pub const fn raw(&self) -> i64 {
        self.0
    }

    /// Returns true for the null handle.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns true for any reserved sentinel (null included).
    pub fn is_sentinel(&self) -> bool {
        self.0 <= 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Handle::NULL => write!(f, "handle:null"),
            Handle::THIS_UNIVERSE => write!(f, "handle:this-universe"),
            Handle::THIS_THREAD => write!(f, "handle:this-thread"),
            Handle(raw) => write!(f, "handle:{}", raw),
        }
    }
}
