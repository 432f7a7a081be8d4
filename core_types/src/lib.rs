//! # Core Types
//!
//! Fundamental types shared by the kernel and by userspace-facing API crates.
//!
//! ## Design Principles
//!
//! 1. **Handles are opaque**: a [`Handle`] is a small integer that only has
//!    meaning inside one universe's descriptor table.
//! 2. **Objects are identified**: every long-lived kernel object carries a
//!    unique id used in logs and audit trails, never in the syscall ABI.
//! 3. **Errors are closed**: the user-facing error taxonomy is a single enum
//!    with stable numeric codes; internal errors convert into it at the
//!    syscall boundary.
//! 4. **Testable**: everything here works under `cargo test`.

pub mod error;
pub mod handle;
pub mod ids;
pub mod memory;
pub mod observation;

pub use error::{KernelError, KernelResult};
pub use handle::Handle;
pub use ids::{MemoryId, SpaceId, StreamId, ThreadId, UniverseId};
pub use memory::{
    is_page_aligned, page_count, AccessType, ForkPolicy, PhysAddr, Protection, VirtAddr, PAGE_SIZE,
};
pub use observation::{DescriptorTag, Observation};
