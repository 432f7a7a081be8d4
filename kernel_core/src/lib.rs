//! # Kernel Core
//!
//! The kernel-side syscall surface and IPC core of a small capability
//! microkernel, built as a hosted kernel that runs under `cargo test`.
//!
//! ## Philosophy
//!
//! **Testability is a first-class design constraint.** There is no MMU, no
//! trap handler, and no arch code here; physical memory is a process-wide
//! frame pool, user-mode loads and stores are explicit entry points that
//! take the same fault paths hardware would, and platform events (IRQ
//! edges, the clock) are hooks the test harness drives. Everything else is
//! the real mechanism, not a mock: descriptor tables, managed memory,
//! address spaces, completion queues, streams, and futexes.
//!
//! ## Map
//!
//! - [`universe`]: descriptor tables, attach/detach/transfer
//! - [`memory`], [`physical`]: memory objects and the frame pool
//! - [`address_space`]: interval map, fork policies, foreign accessors
//! - [`queue_space`]: completion-queue delivery
//! - [`stream`]: lane pairing, offer/accept, descriptor transport
//! - [`thread`], [`scheduler`]: executors, observations, run queues
//! - [`irq`], [`futex`], [`clock`], [`io`]: the remaining blocking and
//!   platform primitives
//! - [`kernel`], [`gate`]: the syscall surface and its dispatcher

pub mod address_space;
pub mod clock;
pub mod futex;
pub mod gate;
pub mod io;
pub mod irq;
pub mod kernel;
pub mod klog;
pub mod memory;
pub mod physical;
pub mod queue_space;
pub mod scheduler;
pub mod stream;
pub mod thread;
pub mod universe;

pub mod writer;

pub use address_space::{AddressSpace, ForeignAccessor};
pub use gate::{GateEvent, Syscall, SyscallGate, SyscallReply};
pub use kernel::{Kernel, IRQ_PIN_COUNT};
pub use klog::{KernelLog, LogEntry, LogLevel};
pub use memory::{Memory, MemoryRef};
pub use stream::{LaneHandle, Stream};
pub use thread::{Interrupt, RunState, Thread};
pub use universe::{Descriptor, Universe};
