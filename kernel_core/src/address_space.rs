//! Address spaces
//!
//! An address space is an interval map of mapped regions, each referencing a
//! memory object at an offset, with a protection, a fork policy, and a flag
//! exempting it from the managed-memory protocol. Fault resolution walks the
//! map, so every kernel path that touches user memory (foreign accessors,
//! completion-queue writes, the register of user loads and stores the tests
//! drive) takes the same route a hardware fault handler would.
//!
//! The region lock only guards the interval map itself; page fetches run
//! outside it so a blocked managed-memory fault never stalls unrelated
//! lookups in the same space.

use core_types::{
    is_page_aligned, AccessType, KernelError, KernelResult, PhysAddr, SpaceId, VirtAddr, PAGE_SIZE,
};
use kernel_api::{MapSettings, Placement};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::futex::FutexSpace;
use crate::memory::MemoryRef;
use crate::physical::frame_pool;
use crate::queue_space::QueueSpace;
use crate::writer::EventWriter;
use core_types::ForkPolicy;
use core_types::Protection;

/// Highest usable mapping address (exclusive).
const USER_TOP: u64 = 1 << 46;

/// Lowest usable mapping address; page zero is never mapped.
const USER_BOTTOM: u64 = PAGE_SIZE;

/// Copy-on-write overlay over a source memory object.
///
/// Reads fall through to the source until a page is privately copied; the
/// first write copies the page into the overlay.
struct CowState {
    source: MemoryRef,
    private: Mutex<HashMap<u64, PhysAddr>>,
}

impl CowState {
    fn new(source: MemoryRef) -> Arc<CowState> {
        Arc::new(CowState {
            source,
            private: Mutex::new(HashMap::new()),
        })
    }

    fn read_page(&self, source_offset: u64) -> KernelResult<PhysAddr> {
        if let Some(frame) = self
            .private
            .lock()
            .expect("cow overlay lock")
            .get(&source_offset)
        {
            return Ok(*frame);
        }
        self.source.fetch_page(source_offset, true)
    }

    fn write_page(&self, source_offset: u64) -> KernelResult<PhysAddr> {
        if let Some(frame) = self
            .private
            .lock()
            .expect("cow overlay lock")
            .get(&source_offset)
        {
            return Ok(*frame);
        }
        // Copy outside the overlay lock; fetching may block on the pager.
        let source_frame = self.source.fetch_page(source_offset, true)?;
        let fresh = frame_pool().allocate();
        frame_pool().copy_frame(source_frame, fresh);

        let mut private = self.private.lock().expect("cow overlay lock");
        if let Some(existing) = private.get(&source_offset) {
            frame_pool().free(fresh);
            return Ok(*existing);
        }
        private.insert(source_offset, fresh);
        Ok(fresh)
    }

    /// Point-in-time copy for fork: private pages are duplicated so the two
    /// sides diverge from here on.
    fn snapshot(&self) -> Arc<CowState> {
        let private = self.private.lock().expect("cow overlay lock");
        let mut copy = HashMap::with_capacity(private.len());
        for (&offset, &frame) in private.iter() {
            let fresh = frame_pool().allocate();
            frame_pool().copy_frame(frame, fresh);
            copy.insert(offset, fresh);
        }
        Arc::new(CowState {
            source: self.source.clone(),
            private: Mutex::new(copy),
        })
    }
}

impl Drop for CowState {
    fn drop(&mut self) {
        let private = self.private.lock().expect("cow overlay lock");
        for frame in private.values() {
            frame_pool().free(*frame);
        }
    }
}

#[derive(Clone)]
enum RegionBacking {
    Object { memory: MemoryRef, offset: u64 },
    CopyOnWrite { overlay: Arc<CowState>, offset: u64 },
}

impl RegionBacking {
    fn shifted(&self, delta: u64) -> RegionBacking {
        match self {
            RegionBacking::Object { memory, offset } => RegionBacking::Object {
                memory: memory.clone(),
                offset: offset + delta,
            },
            RegionBacking::CopyOnWrite { overlay, offset } => RegionBacking::CopyOnWrite {
                overlay: overlay.clone(),
                offset: offset + delta,
            },
        }
    }
}

#[derive(Clone)]
struct Region {
    base: u64,
    length: u64,
    backing: RegionBacking,
    protection: Protection,
    fork_policy: ForkPolicy,
    dont_require_backing: bool,
}

struct SpaceState {
    regions: BTreeMap<u64, Region>,
}

/// An address space.
pub struct AddressSpace {
    id: SpaceId,
    state: Mutex<SpaceState>,
    queues: QueueSpace,
    futex: FutexSpace,
}

impl AddressSpace {
    pub fn new() -> Arc<AddressSpace> {
        Arc::new(AddressSpace {
            id: SpaceId::new(),
            state: Mutex::new(SpaceState {
                regions: BTreeMap::new(),
            }),
            queues: QueueSpace::new(),
            futex: FutexSpace::new(),
        })
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub(crate) fn futex(&self) -> &FutexSpace {
        &self.futex
    }

    /// Number of mapped regions (splits count individually).
    pub fn region_count(&self) -> usize {
        self.state.lock().expect("space lock").regions.len()
    }

    fn overlaps_locked(state: &SpaceState, base: u64, length: u64) -> bool {
        let end = base + length;
        if let Some((_, region)) = state.regions.range(..end).next_back() {
            if region.base + region.length > base {
                return true;
            }
        }
        false
    }

    /// Maps `length` bytes of `memory` starting at `offset` and returns the
    /// chosen address.
    pub fn map(
        &self,
        memory: MemoryRef,
        settings: MapSettings,
        offset: u64,
        length: u64,
    ) -> KernelResult<VirtAddr> {
        if length == 0 || !is_page_aligned(length) || !is_page_aligned(offset) {
            return Err(KernelError::IllegalArgs);
        }
        if offset
            .checked_add(length)
            .filter(|end| *end <= memory.length())
            .is_none()
        {
            return Err(KernelError::IllegalArgs);
        }

        let mut state = self.state.lock().expect("space lock");
        let base = match settings.placement {
            Placement::Fixed(addr) => {
                let base = addr.value();
                if base < USER_BOTTOM || base.checked_add(length).filter(|e| *e <= USER_TOP).is_none()
                {
                    return Err(KernelError::IllegalArgs);
                }
                if Self::overlaps_locked(&state, base, length) {
                    return Err(KernelError::IllegalArgs);
                }
                base
            }
            Placement::PreferTop => {
                if length > USER_TOP - USER_BOTTOM {
                    return Err(KernelError::IllegalArgs);
                }
                let mut candidate = USER_TOP - length;
                for (_, region) in state.regions.iter().rev() {
                    if candidate >= region.base + region.length {
                        break;
                    }
                    candidate = region
                        .base
                        .checked_sub(length)
                        .ok_or(KernelError::IllegalArgs)?;
                }
                if candidate < USER_BOTTOM {
                    return Err(KernelError::IllegalArgs);
                }
                candidate
            }
        };

        state.regions.insert(
            base,
            Region {
                base,
                length,
                backing: RegionBacking::Object { memory, offset },
                protection: settings.protection,
                fork_policy: settings.fork_policy,
                dont_require_backing: settings.dont_require_backing,
            },
        );
        Ok(VirtAddr::new(base))
    }

    /// Unmaps `[addr, addr + length)`. The range must be fully covered by
    /// mapped regions; a partial unmap inside a region splits it.
    pub fn unmap(&self, addr: VirtAddr, length: u64) -> KernelResult<()> {
        if length == 0 || !is_page_aligned(length) || !addr.is_aligned() {
            return Err(KernelError::IllegalArgs);
        }
        let start = addr.value();
        let end = start
            .checked_add(length)
            .ok_or(KernelError::IllegalArgs)?;

        let mut state = self.state.lock().expect("space lock");

        // The affected regions must tile the range without holes.
        let affected: Vec<u64> = {
            let mut bases = Vec::new();
            let mut cursor = start;
            while cursor < end {
                let (base, region) = state
                    .regions
                    .range(..=cursor)
                    .next_back()
                    .filter(|(_, region)| region.base + region.length > cursor)
                    .map(|(base, region)| (*base, region.clone()))
                    .ok_or(KernelError::IllegalArgs)?;
                bases.push(base);
                cursor = region.base + region.length;
            }
            bases
        };

        for base in affected {
            let region = state.regions.remove(&base).expect("affected region");
            let region_end = region.base + region.length;
            if region.base < start {
                let keep = start - region.base;
                state.regions.insert(
                    region.base,
                    Region {
                        length: keep,
                        backing: region.backing.clone(),
                        ..region.clone()
                    },
                );
            }
            if region_end > end {
                let delta = end - region.base;
                state.regions.insert(
                    end,
                    Region {
                        base: end,
                        length: region_end - end,
                        backing: region.backing.shifted(delta),
                        protection: region.protection,
                        fork_policy: region.fork_policy,
                        dont_require_backing: region.dont_require_backing,
                    },
                );
            }
        }
        Ok(())
    }

    /// Forks the space, applying each region's fork policy.
    pub fn fork(&self) -> Arc<AddressSpace> {
        let mut state = self.state.lock().expect("space lock");
        let mut child_regions = BTreeMap::new();

        for (&base, region) in state.regions.iter_mut() {
            match region.fork_policy {
                ForkPolicy::Drop => {}
                ForkPolicy::Share => {
                    child_regions.insert(base, region.clone());
                }
                ForkPolicy::CopyOnWrite => {
                    let (parent_backing, child_backing) = match &region.backing {
                        RegionBacking::Object { memory, offset } => {
                            let parent = RegionBacking::CopyOnWrite {
                                overlay: CowState::new(memory.clone()),
                                offset: *offset,
                            };
                            let child = RegionBacking::CopyOnWrite {
                                overlay: CowState::new(memory.clone()),
                                offset: *offset,
                            };
                            (parent, child)
                        }
                        RegionBacking::CopyOnWrite { overlay, offset } => {
                            let child = RegionBacking::CopyOnWrite {
                                overlay: overlay.snapshot(),
                                offset: *offset,
                            };
                            (region.backing.clone(), child)
                        }
                    };
                    region.backing = parent_backing;
                    let mut child_region = region.clone();
                    child_region.backing = child_backing;
                    child_regions.insert(base, child_region);
                }
            }
        }

        Arc::new(AddressSpace {
            id: SpaceId::new(),
            state: Mutex::new(SpaceState {
                regions: child_regions,
            }),
            queues: QueueSpace::new(),
            futex: FutexSpace::new(),
        })
    }

    /// Resolves the frame behind one page-aligned access.
    ///
    /// Fails with *illegal-args* for unmapped addresses and protection
    /// violations; the syscall layer turns that into a page-fault
    /// observation on the faulting thread.
    pub fn resolve(&self, addr: VirtAddr, access: AccessType) -> KernelResult<PhysAddr> {
        let page = addr.page_base();
        let (backing, dont_require_backing, backing_offset) = {
            let state = self.state.lock().expect("space lock");
            let (_, region) = state
                .regions
                .range(..=page.value())
                .next_back()
                .filter(|(_, region)| region.base + region.length > page.value())
                .ok_or(KernelError::IllegalArgs)?;
            if !region.protection.allows(access) {
                return Err(KernelError::IllegalArgs);
            }
            let delta = page.value() - region.base;
            let offset = match &region.backing {
                RegionBacking::Object { offset, .. } => offset + delta,
                RegionBacking::CopyOnWrite { offset, .. } => offset + delta,
            };
            (region.backing.clone(), region.dont_require_backing, offset)
        };

        let frame = match backing {
            RegionBacking::Object { memory, .. } => {
                memory.fetch_page(backing_offset, !dont_require_backing)?
            }
            RegionBacking::CopyOnWrite { overlay, .. } => match access {
                AccessType::Write => overlay.write_page(backing_offset)?,
                _ => overlay.read_page(backing_offset)?,
            },
        };
        Ok(PhysAddr::new(frame.page_base().value() + addr.page_offset()))
    }

    /// The physical address behind `addr`, for DMA setup.
    pub fn grab_physical(&self, addr: VirtAddr) -> KernelResult<PhysAddr> {
        self.resolve(addr, AccessType::Read)
    }

    /// Copies bytes out of the space, resolving faults along the way.
    pub fn read(&self, addr: VirtAddr, out: &mut [u8]) -> KernelResult<()> {
        let mut done = 0usize;
        while done < out.len() {
            let current = addr
                .checked_add(done as u64)
                .ok_or(KernelError::IllegalArgs)?;
            let chunk = ((PAGE_SIZE - current.page_offset()) as usize).min(out.len() - done);
            let frame = self.resolve(current, AccessType::Read)?;
            frame_pool().read(frame, &mut out[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies bytes into the space, resolving faults along the way.
    pub fn write(&self, addr: VirtAddr, data: &[u8]) -> KernelResult<()> {
        let mut done = 0usize;
        while done < data.len() {
            let current = addr
                .checked_add(done as u64)
                .ok_or(KernelError::IllegalArgs)?;
            let chunk = ((PAGE_SIZE - current.page_offset()) as usize).min(data.len() - done);
            let frame = self.resolve(current, AccessType::Write)?;
            frame_pool().write(frame, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Reads one naturally-aligned 32-bit word (futex words).
    pub fn read_u32(&self, addr: VirtAddr) -> KernelResult<u32> {
        if addr.value() % 4 != 0 {
            return Err(KernelError::IllegalArgs);
        }
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes one naturally-aligned 32-bit word.
    pub fn write_u32(&self, addr: VirtAddr, value: u32) -> KernelResult<()> {
        if addr.value() % 4 != 0 {
            return Err(KernelError::IllegalArgs);
        }
        self.write(addr, &value.to_le_bytes())
    }

    /// Posts a completion batch into a queue owned by this space.
    pub(crate) fn post_completion(
        self: &Arc<Self>,
        queue: VirtAddr,
        context: u64,
        writers: Vec<EventWriter>,
    ) -> KernelResult<()> {
        self.queues.post(self, queue, context, writers)
    }
}

/// Reads or writes a slice of another space's memory with fault-safe
/// primitives; the capability the kernel hands to code acting across space
/// boundaries.
pub struct ForeignAccessor {
    space: Arc<AddressSpace>,
    base: VirtAddr,
    length: u64,
}

impl ForeignAccessor {
    pub fn acquire(space: Arc<AddressSpace>, base: VirtAddr, length: u64) -> ForeignAccessor {
        ForeignAccessor {
            space,
            base,
            length,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    fn slot(&self, offset: u64, len: usize) -> KernelResult<VirtAddr> {
        if offset + len as u64 > self.length {
            return Err(KernelError::IllegalArgs);
        }
        self.base
            .checked_add(offset)
            .ok_or(KernelError::IllegalArgs)
    }

    /// Copies out of the foreign space.
    pub fn load(&self, offset: u64, out: &mut [u8]) -> KernelResult<()> {
        let addr = self.slot(offset, out.len())?;
        self.space.read(addr, out)
    }

    /// Copies into the foreign space.
    pub fn store(&self, offset: u64, data: &[u8]) -> KernelResult<()> {
        let addr = self.slot(offset, data.len())?;
        self.space.write(addr, data)
    }
}
