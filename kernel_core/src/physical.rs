//! The physical frame pool
//!
//! Physical memory is the only truly shared resource in the kernel; it is
//! modeled as a process-wide pool of page frames, initialized before the
//! first thread runs and never torn down. Frames are identified by
//! [`PhysAddr`]; hardware ranges materialize their frames on first touch so
//! that device memory and allocated memory go through the same accessors.

use core_types::{PhysAddr, PAGE_SIZE};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Base of the dynamically allocated frame range, above anything a hardware
/// range would pin.
const DYNAMIC_BASE: u64 = 0x1_0000_0000;

struct PoolState {
    frames: HashMap<u64, Box<[u8]>>,
    next_dynamic: u64,
}

/// Process-wide frame pool.
pub struct FramePool {
    state: Mutex<PoolState>,
}

static POOL: OnceLock<FramePool> = OnceLock::new();

/// Returns the global frame pool.
pub fn frame_pool() -> &'static FramePool {
    POOL.get_or_init(|| FramePool {
        state: Mutex::new(PoolState {
            frames: HashMap::new(),
            next_dynamic: DYNAMIC_BASE,
        }),
    })
}

impl FramePool {
    /// Allocates one zeroed frame.
    pub fn allocate(&self) -> PhysAddr {
        let mut state = self.state.lock().expect("frame pool lock");
        let addr = state.next_dynamic;
        state.next_dynamic += PAGE_SIZE;
        state.frames.insert(addr, zeroed_frame());
        PhysAddr::new(addr)
    }

    /// Allocates `count` physically consecutive zeroed frames and returns
    /// the base.
    pub fn allocate_contiguous(&self, count: u64) -> PhysAddr {
        let mut state = self.state.lock().expect("frame pool lock");
        let base = state.next_dynamic;
        state.next_dynamic += count * PAGE_SIZE;
        for index in 0..count {
            state
                .frames
                .insert(base + index * PAGE_SIZE, zeroed_frame());
        }
        PhysAddr::new(base)
    }

    /// Returns a frame to the pool.
    pub fn free(&self, addr: PhysAddr) {
        let mut state = self.state.lock().expect("frame pool lock");
        state.frames.remove(&addr.page_base().value());
    }

    /// Runs `f` over the frame containing `addr`, materializing it if it
    /// names a hardware range that was never touched.
    pub fn with_frame<R>(&self, addr: PhysAddr, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.state.lock().expect("frame pool lock");
        let frame = state
            .frames
            .entry(addr.page_base().value())
            .or_insert_with(zeroed_frame);
        f(&mut frame[..])
    }

    /// Copies bytes out of a frame.
    pub fn read(&self, addr: PhysAddr, out: &mut [u8]) {
        let offset = addr.page_offset() as usize;
        self.with_frame(addr, |frame| {
            out.copy_from_slice(&frame[offset..offset + out.len()]);
        });
    }

    /// Copies bytes into a frame.
    pub fn write(&self, addr: PhysAddr, data: &[u8]) {
        let offset = addr.page_offset() as usize;
        self.with_frame(addr, |frame| {
            frame[offset..offset + data.len()].copy_from_slice(data);
        });
    }

    /// Copies a whole frame onto another.
    pub fn copy_frame(&self, from: PhysAddr, to: PhysAddr) {
        let mut buffer = vec![0u8; PAGE_SIZE as usize];
        self.read(from.page_base(), &mut buffer);
        self.write(to.page_base(), &buffer);
    }
}

fn zeroed_frame() -> Box<[u8]> {
    vec![0u8; PAGE_SIZE as usize].into_boxed_slice()
}
