//! Universes and descriptors
//!
//! A universe is a per-actor descriptor table: an ordered mapping from
//! opaque handles to typed descriptors. Universes own their descriptors by
//! strong reference; detaching the last reference destroys the underlying
//! object. Handles are allocated monotonically with reuse after detach, and
//! a reused value never collides with a live entry.

use core_types::{DescriptorTag, Handle, KernelError, KernelResult, UniverseId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::address_space::AddressSpace;
use crate::io::IoSpace;
use crate::irq::IrqObject;
use crate::memory::MemoryRef;
use crate::stream::LaneHandle;
use crate::thread::Thread;

/// A typed entry in a universe's table.
///
/// All variants are cloned by shared reference except lanes, whose handles
/// track endpoint liveness; lane descriptors move rather than duplicate when
/// pushed through a stream.
#[derive(Clone)]
pub enum Descriptor {
    Universe(Arc<Universe>),
    Memory(MemoryRef),
    Space(Arc<AddressSpace>),
    Thread(Arc<Thread>),
    Lane(LaneHandle),
    Irq(Arc<IrqObject>),
    Io(Arc<IoSpace>),
}

impl Descriptor {
    pub fn tag(&self) -> DescriptorTag {
        match self {
            Descriptor::Universe(_) => DescriptorTag::Universe,
            Descriptor::Memory(_) => DescriptorTag::Memory,
            Descriptor::Space(_) => DescriptorTag::Space,
            Descriptor::Thread(_) => DescriptorTag::Thread,
            Descriptor::Lane(_) => DescriptorTag::Lane,
            Descriptor::Irq(_) => DescriptorTag::Irq,
            Descriptor::Io(_) => DescriptorTag::Io,
        }
    }

    pub fn into_universe(self) -> KernelResult<Arc<Universe>> {
        match self {
            Descriptor::Universe(universe) => Ok(universe),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    pub fn into_memory(self) -> KernelResult<MemoryRef> {
        match self {
            Descriptor::Memory(memory) => Ok(memory),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    pub fn into_space(self) -> KernelResult<Arc<AddressSpace>> {
        match self {
            Descriptor::Space(space) => Ok(space),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    pub fn into_thread(self) -> KernelResult<Arc<Thread>> {
        match self {
            Descriptor::Thread(thread) => Ok(thread),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    pub fn into_lane(self) -> KernelResult<LaneHandle> {
        match self {
            Descriptor::Lane(lane) => Ok(lane),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    pub fn into_irq(self) -> KernelResult<Arc<IrqObject>> {
        match self {
            Descriptor::Irq(irq) => Ok(irq),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    pub fn into_io(self) -> KernelResult<Arc<IoSpace>> {
        match self {
            Descriptor::Io(io) => Ok(io),
            _ => Err(KernelError::BadDescriptor),
        }
    }
}

struct UniverseState {
    descriptors: BTreeMap<i64, Descriptor>,
    next_handle: i64,
    free_handles: Vec<i64>,
}

/// A descriptor table.
pub struct Universe {
    id: UniverseId,
    state: Mutex<UniverseState>,
}

impl Universe {
    pub fn new() -> Arc<Universe> {
        Arc::new(Universe {
            id: UniverseId::new(),
            state: Mutex::new(UniverseState {
                descriptors: BTreeMap::new(),
                next_handle: 1,
                free_handles: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> UniverseId {
        self.id
    }

    /// Attaches a descriptor and returns its fresh handle.
    pub fn attach(&self, descriptor: Descriptor) -> Handle {
        let mut state = self.state.lock().expect("universe lock");
        let raw = match state.free_handles.pop() {
            Some(raw) => raw,
            None => {
                let raw = state.next_handle;
                state.next_handle += 1;
                raw
            }
        };
        let previous = state.descriptors.insert(raw, descriptor);
        debug_assert!(previous.is_none());
        Handle::from_raw(raw)
    }

    /// Looks a handle up, cloning the descriptor.
    pub fn get(&self, handle: Handle) -> KernelResult<Descriptor> {
        let state = self.state.lock().expect("universe lock");
        state
            .descriptors
            .get(&handle.raw())
            .cloned()
            .ok_or(KernelError::NoDescriptor)
    }

    /// Detaches a handle, returning the descriptor so the caller can drop it
    /// outside the table lock.
    pub fn detach(&self, handle: Handle) -> KernelResult<Descriptor> {
        let mut state = self.state.lock().expect("universe lock");
        let descriptor = state
            .descriptors
            .remove(&handle.raw())
            .ok_or(KernelError::NoDescriptor)?;
        state.free_handles.push(handle.raw());
        Ok(descriptor)
    }

    /// The variant tag of a live entry.
    pub fn tag_of(&self, handle: Handle) -> KernelResult<DescriptorTag> {
        let state = self.state.lock().expect("universe lock");
        state
            .descriptors
            .get(&handle.raw())
            .map(Descriptor::tag)
            .ok_or(KernelError::NoDescriptor)
    }

    /// Number of live descriptors.
    pub fn len(&self) -> usize {
        self.state.lock().expect("universe lock").descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Copies a descriptor from `source` into `target`, returning the new
/// handle. The source handle stays attached; for a lane the two handles
/// share the endpoint, which closes when the last of them is detached.
///
/// The two table locks are taken in stable address order so that concurrent
/// transfers in opposite directions cannot deadlock.
pub fn transfer(
    source: &Arc<Universe>,
    target: &Arc<Universe>,
    handle: Handle,
) -> KernelResult<Handle> {
    if Arc::ptr_eq(source, target) {
        let descriptor = source.get(handle)?;
        return Ok(source.attach(descriptor));
    }

    let (first, second) = if Arc::as_ptr(source) < Arc::as_ptr(target) {
        (source, target)
    } else {
        (target, source)
    };
    let first_guard = first.state.lock().expect("universe lock");
    let second_guard = second.state.lock().expect("universe lock");
    let (source_guard, mut target_guard) = if Arc::ptr_eq(first, source) {
        (first_guard, second_guard)
    } else {
        (second_guard, first_guard)
    };

    let descriptor = source_guard
        .descriptors
        .get(&handle.raw())
        .ok_or(KernelError::NoDescriptor)?
        .clone();

    let raw = match target_guard.free_handles.pop() {
        Some(raw) => raw,
        None => {
            let raw = target_guard.next_handle;
            target_guard.next_handle += 1;
            raw
        }
    };
    target_guard.descriptors.insert(raw, descriptor);
    Ok(Handle::from_raw(raw))
}
