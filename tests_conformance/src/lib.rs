//! Conformance test helpers
//!
//! Shared bootstrap utilities for the end-to-end scenarios: a kernel with
//! an initial thread, completion queues mapped into a caller's space, and a
//! drain helper that snapshots queue memory through the same user-access
//! path the scenarios use.

use core_types::{Handle, VirtAddr, PAGE_SIZE};
use kernel_api::queue::QUEUE_HEADER_SIZE;
use kernel_api::{flags, QueueElement, QueueHeader, RingReader};
use kernel_core::{Kernel, Thread};
use std::sync::Arc;

/// A kernel plus its initial thread.
pub fn test_bootstrap() -> (Arc<Kernel>, Arc<Thread>) {
    let kernel = Kernel::new();
    let caller = kernel.bootstrap_thread();
    (kernel, caller)
}

/// Allocates, maps, and initializes a completion queue with `capacity`
/// data bytes in the caller's space; returns its base address.
pub fn setup_queue(kernel: &Kernel, caller: &Arc<Thread>, capacity: u64) -> VirtAddr {
    let bytes = QUEUE_HEADER_SIZE + capacity;
    let pages = bytes.div_ceil(PAGE_SIZE).max(1);
    let memory = kernel
        .allocate_memory(caller, pages * PAGE_SIZE, 0)
        .expect("queue memory");
    let queue = kernel
        .map_memory(
            caller,
            memory,
            Handle::NULL,
            None,
            0,
            pages * PAGE_SIZE,
            flags::MAP_READ_WRITE,
        )
        .expect("queue mapping");
    let header = QueueHeader::with_capacity(capacity);
    kernel
        .write_memory(caller, queue, &header.encode())
        .expect("queue header");
    queue
}

/// Reads every element posted to the queue so far, in order.
pub fn drain_queue(
    kernel: &Kernel,
    caller: &Arc<Thread>,
    queue: VirtAddr,
    capacity: u64,
) -> Vec<QueueElement> {
    let snapshot = kernel
        .read_memory(caller, queue, (QUEUE_HEADER_SIZE + capacity) as usize)
        .expect("queue snapshot");
    RingReader::new(snapshot).expect("queue header").drain()
}

/// Allocates and maps `pages` pages of zeroed read-write memory, returning
/// the mapping address.
pub fn setup_buffer(kernel: &Kernel, caller: &Arc<Thread>, pages: u64) -> VirtAddr {
    let memory = kernel
        .allocate_memory(caller, pages * PAGE_SIZE, 0)
        .expect("buffer memory");
    kernel
        .map_memory(
            caller,
            memory,
            Handle::NULL,
            None,
            0,
            pages * PAGE_SIZE,
            flags::MAP_READ_WRITE,
        )
        .expect("buffer mapping")
}

/// Resolves a thread handle in the caller's universe to the thread object,
/// so tests can drive syscalls as that thread.
pub fn thread_object(caller: &Arc<Thread>, handle: Handle) -> Arc<Thread> {
    caller
        .universe()
        .get(handle)
        .expect("thread descriptor")
        .into_thread()
        .expect("thread variant")
}

/// Polls until `condition` holds or the deadline passes.
pub fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("condition not reached in time");
}
