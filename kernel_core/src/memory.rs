//! Memory objects
//!
//! A memory object owns pages. Four variants exist: *allocated* (zero-filled
//! anonymous memory, optionally physically contiguous), *hardware* (a pinned
//! physical range), and the *backing*/*frontal* pair over one managed space.
//!
//! ## Managed memory protocol
//!
//! The frontal view is what consumers map; the backing view is what the
//! pager maps. A frontal access to an absent page files a load request: if a
//! manage submission is parked, a manage record is posted to it, otherwise
//! the request queues until the next submission arrives. The faulting access
//! blocks until `complete_load` marks the page present. Pages for which a
//! manage record is already outstanding are not reported twice. A
//! lock-memory submission completes once every page of its range is
//! present; `loadahead` files requests without waiting.

use core_types::{
    is_page_aligned, page_count, KernelError, KernelResult, MemoryId, PhysAddr, PAGE_SIZE,
};
use kernel_api::AllocateSettings;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::physical::frame_pool;
use crate::writer::{Completer, EventWriter};

/// A reference-counted memory object.
pub type MemoryRef = Arc<Memory>;

/// A memory object.
pub struct Memory {
    id: MemoryId,
    kind: MemoryKind,
}

enum MemoryKind {
    Allocated(AllocatedMemory),
    Hardware(HardwareMemory),
    Backing(Arc<ManagedSpace>),
    Frontal(Arc<ManagedSpace>),
}

impl Memory {
    /// Creates an allocated memory object.
    pub fn allocate(length: u64, settings: AllocateSettings) -> KernelResult<MemoryRef> {
        if length == 0 || !is_page_aligned(length) {
            return Err(KernelError::IllegalArgs);
        }
        Ok(Arc::new(Memory {
            id: MemoryId::new(),
            kind: MemoryKind::Allocated(AllocatedMemory::new(length, settings)),
        }))
    }

    /// Creates a hardware memory object pinning `[base, base + length)`.
    pub fn hardware(base: PhysAddr, length: u64) -> KernelResult<MemoryRef> {
        if length == 0 || !is_page_aligned(length) || base.page_offset() != 0 {
            return Err(KernelError::IllegalArgs);
        }
        Ok(Arc::new(Memory {
            id: MemoryId::new(),
            kind: MemoryKind::Hardware(HardwareMemory { base, length }),
        }))
    }

    /// Creates a managed space and returns its backing and frontal views.
    pub fn create_managed(length: u64) -> KernelResult<(MemoryRef, MemoryRef)> {
        if length == 0 || !is_page_aligned(length) {
            return Err(KernelError::IllegalArgs);
        }
        let managed = Arc::new(ManagedSpace::new(length));
        let backing = Arc::new(Memory {
            id: MemoryId::new(),
            kind: MemoryKind::Backing(managed.clone()),
        });
        let frontal = Arc::new(Memory {
            id: MemoryId::new(),
            kind: MemoryKind::Frontal(managed),
        });
        Ok((backing, frontal))
    }

    pub fn id(&self) -> MemoryId {
        self.id
    }

    /// Object length in bytes.
    pub fn length(&self) -> u64 {
        match &self.kind {
            MemoryKind::Allocated(allocated) => allocated.length,
            MemoryKind::Hardware(hardware) => hardware.length,
            MemoryKind::Backing(managed) | MemoryKind::Frontal(managed) => managed.length,
        }
    }

    /// Resolves the frame backing the page at `offset`.
    ///
    /// For a frontal view this drives the manage protocol and blocks until
    /// the page is present, unless `require_backing` is false, in which case
    /// the page is materialized directly (used for mappings that must never
    /// wait on a pager, such as completion queues).
    pub fn fetch_page(&self, offset: u64, require_backing: bool) -> KernelResult<PhysAddr> {
        let offset = offset - offset % PAGE_SIZE;
        if offset >= self.length() {
            return Err(KernelError::IllegalArgs);
        }
        match &self.kind {
            MemoryKind::Allocated(allocated) => Ok(allocated.fetch(offset)),
            MemoryKind::Hardware(hardware) => {
                Ok(PhysAddr::new(hardware.base.value() + offset))
            }
            MemoryKind::Backing(managed) => Ok(managed.backing_page(offset)),
            MemoryKind::Frontal(managed) => {
                if require_backing {
                    Ok(managed.frontal_page(offset))
                } else {
                    Ok(managed.backing_page(offset))
                }
            }
        }
    }

    fn managed(&self) -> KernelResult<&Arc<ManagedSpace>> {
        match &self.kind {
            MemoryKind::Backing(managed) | MemoryKind::Frontal(managed) => Ok(managed),
            _ => Err(KernelError::IllegalArgs),
        }
    }

    /// Parks a manage submission; the next unreported load request is
    /// delivered to it.
    pub fn submit_manage(&self, completer: Completer) -> KernelResult<()> {
        self.managed()?.submit_manage(completer);
        Ok(())
    }

    /// Marks a range present and releases every waiter in it.
    pub fn complete_load(&self, offset: u64, length: u64) -> KernelResult<()> {
        let managed = self.managed()?;
        managed.validate_range(offset, length)?;
        managed.complete_load(offset, length);
        Ok(())
    }

    /// Completes once every page of the range is present.
    pub fn submit_lock(&self, offset: u64, length: u64, completer: Completer) -> KernelResult<()> {
        let managed = self.managed()?;
        managed.validate_range(offset, length)?;
        managed.submit_lock(offset, length, completer);
        Ok(())
    }

    /// Hints that a range will be needed; files load requests without
    /// waiting. A no-op for non-managed memory.
    pub fn loadahead(&self, offset: u64, length: u64) -> KernelResult<()> {
        match &self.kind {
            MemoryKind::Backing(managed) | MemoryKind::Frontal(managed) => {
                managed.validate_range(offset, length)?;
                managed.loadahead(offset, length);
                Ok(())
            }
            _ => {
                if !is_page_aligned(offset) || !is_page_aligned(length) {
                    return Err(KernelError::IllegalArgs);
                }
                Ok(())
            }
        }
    }
}

struct AllocatedMemory {
    length: u64,
    pages: Mutex<Vec<Option<PhysAddr>>>,
}

impl AllocatedMemory {
    fn new(length: u64, settings: AllocateSettings) -> Self {
        let count = page_count(length) as usize;
        let mut pages = vec![None; count];
        if settings.continuous {
            let base = frame_pool().allocate_contiguous(count as u64);
            for (index, page) in pages.iter_mut().enumerate() {
                *page = Some(PhysAddr::new(base.value() + index as u64 * PAGE_SIZE));
            }
        }
        Self {
            length,
            pages: Mutex::new(pages),
        }
    }

    fn fetch(&self, offset: u64) -> PhysAddr {
        let index = (offset / PAGE_SIZE) as usize;
        let mut pages = self.pages.lock().expect("allocated memory lock");
        *pages[index].get_or_insert_with(|| frame_pool().allocate())
    }
}

impl Drop for AllocatedMemory {
    fn drop(&mut self) {
        let pages = self.pages.lock().expect("allocated memory lock");
        for page in pages.iter().flatten() {
            frame_pool().free(*page);
        }
    }
}

struct HardwareMemory {
    base: PhysAddr,
    length: u64,
}

struct LockRequest {
    offset: u64,
    length: u64,
    completer: Completer,
}

struct ManagedState {
    frames: Vec<Option<PhysAddr>>,
    present: Vec<bool>,
    /// Pages covered by a posted or queued manage record that has not been
    /// satisfied yet.
    requested: Vec<bool>,
    /// Parked manage submissions, each good for one record.
    monitors: VecDeque<Completer>,
    /// Load requests waiting for the next manage submission, as page ranges.
    queued: VecDeque<(u64, u64)>,
    locks: Vec<LockRequest>,
}

/// The shared state behind a backing/frontal pair.
pub struct ManagedSpace {
    length: u64,
    state: Mutex<ManagedState>,
    present_changed: Condvar,
}

type Effects = Vec<(Completer, EventWriter)>;

fn run_effects(effects: Effects) {
    for (completer, writer) in effects {
        completer.complete(writer);
    }
}

impl ManagedSpace {
    fn new(length: u64) -> Self {
        let count = page_count(length) as usize;
        Self {
            length,
            state: Mutex::new(ManagedState {
                frames: vec![None; count],
                present: vec![false; count],
                requested: vec![false; count],
                monitors: VecDeque::new(),
                queued: VecDeque::new(),
                locks: Vec::new(),
            }),
            present_changed: Condvar::new(),
        }
    }

    fn validate_range(&self, offset: u64, length: u64) -> KernelResult<()> {
        if !is_page_aligned(offset) || !is_page_aligned(length) || length == 0 {
            return Err(KernelError::IllegalArgs);
        }
        if offset.checked_add(length).filter(|end| *end <= self.length).is_none() {
            return Err(KernelError::IllegalArgs);
        }
        Ok(())
    }

    fn frame_locked(state: &mut ManagedState, index: usize) -> PhysAddr {
        *state.frames[index].get_or_insert_with(|| frame_pool().allocate())
    }

    /// Files load requests for every absent, unreported page of the range.
    fn request_locked(state: &mut ManagedState, first: usize, count: usize, effects: &mut Effects) {
        let mut run_start = None;
        for index in first..first + count + 1 {
            let wanted = index < first + count && !state.present[index] && !state.requested[index];
            match (run_start, wanted) {
                (None, true) => run_start = Some(index),
                (Some(start), false) => {
                    for page in start..index {
                        state.requested[page] = true;
                    }
                    let offset = start as u64 * PAGE_SIZE;
                    let length = (index - start) as u64 * PAGE_SIZE;
                    if let Some(monitor) = state.monitors.pop_front() {
                        effects.push((
                            monitor,
                            EventWriter::Manage {
                                error: core_types::error::CODE_NONE,
                                offset,
                                length,
                            },
                        ));
                    } else {
                        state.queued.push_back((offset, length));
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
    }

    /// Drops the satisfied parts of queued load requests so a later manage
    /// submission only ever sees ranges that are still absent.
    fn prune_queued_locked(state: &mut ManagedState) {
        let old: Vec<(u64, u64)> = state.queued.drain(..).collect();
        for (offset, length) in old {
            let first = (offset / PAGE_SIZE) as usize;
            let count = (length / PAGE_SIZE) as usize;
            let mut run_start = None;
            for index in first..first + count + 1 {
                let absent = index < first + count && !state.present[index];
                match (run_start, absent) {
                    (None, true) => run_start = Some(index),
                    (Some(start), false) => {
                        state.queued.push_back((
                            start as u64 * PAGE_SIZE,
                            (index - start) as u64 * PAGE_SIZE,
                        ));
                        run_start = None;
                    }
                    _ => {}
                }
            }
        }
    }

    fn check_locks_locked(state: &mut ManagedState, effects: &mut Effects) {
        let mut remaining = Vec::new();
        for lock in state.locks.drain(..) {
            let first = (lock.offset / PAGE_SIZE) as usize;
            let count = (lock.length / PAGE_SIZE) as usize;
            if (first..first + count).all(|index| state.present[index]) {
                effects.push((lock.completer, EventWriter::ok()));
            } else {
                remaining.push(lock);
            }
        }
        state.locks = remaining;
    }

    /// Access through the backing view: materializes the frame without
    /// touching presence, so the pager can fill pages before declaring them
    /// loaded.
    fn backing_page(&self, offset: u64) -> PhysAddr {
        let index = (offset / PAGE_SIZE) as usize;
        let mut state = self.state.lock().expect("managed space lock");
        Self::frame_locked(&mut state, index)
    }

    /// Access through the frontal view: drives the manage protocol and
    /// blocks until the page is present.
    fn frontal_page(&self, offset: u64) -> PhysAddr {
        let index = (offset / PAGE_SIZE) as usize;
        let mut effects = Vec::new();
        let mut state = self.state.lock().expect("managed space lock");
        if !state.present[index] {
            Self::request_locked(&mut state, index, 1, &mut effects);
            if !effects.is_empty() {
                drop(state);
                run_effects(effects);
                state = self.state.lock().expect("managed space lock");
            }
            state = self
                .wait_present(state, index);
        }
        Self::frame_locked(&mut state, index)
    }

    fn wait_present<'a>(
        &self,
        mut state: MutexGuard<'a, ManagedState>,
        index: usize,
    ) -> MutexGuard<'a, ManagedState> {
        while !state.present[index] {
            state = self
                .present_changed
                .wait(state)
                .expect("managed space wait");
        }
        state
    }

    fn submit_manage(&self, completer: Completer) {
        let mut effects = Vec::new();
        {
            let mut state = self.state.lock().expect("managed space lock");
            if let Some((offset, length)) = state.queued.pop_front() {
                effects.push((
                    completer,
                    EventWriter::Manage {
                        error: core_types::error::CODE_NONE,
                        offset,
                        length,
                    },
                ));
            } else {
                state.monitors.push_back(completer);
            }
        }
        run_effects(effects);
    }

    fn complete_load(&self, offset: u64, length: u64) {
        let first = (offset / PAGE_SIZE) as usize;
        let count = (length / PAGE_SIZE) as usize;
        let mut effects = Vec::new();
        {
            let mut state = self.state.lock().expect("managed space lock");
            for index in first..first + count {
                state.present[index] = true;
                state.requested[index] = false;
                Self::frame_locked(&mut state, index);
            }
            Self::prune_queued_locked(&mut state);
            Self::check_locks_locked(&mut state, &mut effects);
            self.present_changed.notify_all();
        }
        run_effects(effects);
    }

    fn submit_lock(&self, offset: u64, length: u64, completer: Completer) {
        let first = (offset / PAGE_SIZE) as usize;
        let count = (length / PAGE_SIZE) as usize;
        let mut effects = Vec::new();
        {
            let mut state = self.state.lock().expect("managed space lock");
            if (first..first + count).all(|index| state.present[index]) {
                effects.push((completer, EventWriter::ok()));
            } else {
                Self::request_locked(&mut state, first, count, &mut effects);
                state.locks.push(LockRequest {
                    offset,
                    length,
                    completer,
                });
            }
        }
        run_effects(effects);
    }

    fn loadahead(&self, offset: u64, length: u64) {
        let first = (offset / PAGE_SIZE) as usize;
        let count = (length / PAGE_SIZE) as usize;
        let mut effects = Vec::new();
        {
            let mut state = self.state.lock().expect("managed space lock");
            Self::request_locked(&mut state, first, count, &mut effects);
        }
        run_effects(effects);
    }
}

impl Drop for ManagedSpace {
    fn drop(&mut self) {
        let state = self.state.lock().expect("managed space lock");
        for frame in state.frames.iter().flatten() {
            frame_pool().free(*frame);
        }
    }
}
