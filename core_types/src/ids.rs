//! Unique identifiers for kernel objects
//!
//! These ids name the objects themselves, independent of any universe's
//! handle table. They appear in logs and audit trails; the syscall ABI never
//! carries them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! object_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from a UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the inner UUID
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

object_id!(
    /// Identifies a universe (a descriptor table).
    UniverseId,
    "universe"
);

object_id!(
    /// Identifies an address space.
    SpaceId,
    "space"
);

object_id!(
    /// Identifies a thread.
    ThreadId,
    "thread"
);

object_id!(
    /// Identifies a stream (a pair of lanes).
    StreamId,
    "stream"
);

object_id!(
    /// Identifies a memory object.
    MemoryId,
    "memory"
);
