//! # Kernel API
//!
//! The user-visible ABI of the kernel: flag words, asynchronous action
//! descriptors, completion-record layouts, the shared completion-queue
//! framing, and register images.
//!
//! ## Philosophy
//!
//! Everything in this crate is *data*, not mechanism. The kernel crate
//! consumes these definitions to validate arguments and to encode completion
//! records; userspace (and the conformance tests standing in for it) consume
//! them to build submissions and to decode queue contents. Keeping both
//! sides on one definition is what makes the byte layouts testable.

pub mod actions;
pub mod flags;
pub mod queue;
pub mod records;
pub mod registers;
pub mod time;

pub use actions::{Action, ActionKind};
pub use flags::{AllocateSettings, MapSettings, Placement, ThreadSettings};
pub use queue::{QueueElement, QueueHeader, RingReader, ELEMENT_HEADER_SIZE, QUEUE_HEADER_SIZE};
pub use records::{CompletionRecord, RecordKind, RECORD_ALIGN};
pub use registers::{
    DebugRegisters, GeneralRegisters, ProgramRegisters, RegisterImage, RegisterSet,
    ThreadRegisters, GENERAL_REGISTER_COUNT,
};
pub use time::{Duration, Instant};
