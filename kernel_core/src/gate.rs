//! Syscall gate
//!
//! A typed, serializable form of the syscall surface plus the dispatcher
//! that executes it against the kernel on behalf of a calling thread. This
//! is the single entry point a trap handler would funnel into; it records
//! an audit trail of invocations and outcomes that tests assert against.

use core_types::{DescriptorTag, Handle, KernelError, KernelResult, PhysAddr, ThreadId, VirtAddr};
use kernel_api::{Action, RegisterImage, RegisterSet};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::kernel::Kernel;
use crate::thread::Thread;

/// The complete syscall set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Syscall {
    // Logging
    Log { message: Vec<u8> },
    Panic { message: Vec<u8> },

    // Descriptors
    CreateUniverse,
    TransferDescriptor { handle: Handle, universe: Handle },
    DescriptorInfo { handle: Handle },
    CloseDescriptor { handle: Handle },

    // Memory objects
    AllocateMemory { size: u64, flags: u32 },
    CreateManagedMemory { size: u64 },
    AccessPhysical { physical: PhysAddr, size: u64 },
    MemoryInfo { handle: Handle },
    SubmitManageMemory { handle: Handle, queue: VirtAddr, context: u64 },
    CompleteLoad { handle: Handle, offset: u64, length: u64 },
    SubmitLockMemory { handle: Handle, offset: u64, size: u64, queue: VirtAddr, context: u64 },
    Loadahead { handle: Handle, offset: u64, length: u64 },

    // Address spaces
    CreateSpace,
    ForkSpace { handle: Handle },
    MapMemory { memory: Handle, space: Handle, hint: Option<VirtAddr>, offset: u64, length: u64, flags: u32 },
    UnmapMemory { space: Handle, address: VirtAddr, length: u64 },
    PointerPhysical { address: VirtAddr },
    LoadForeign { space: Handle, address: VirtAddr, length: u64 },

    // Threads
    CreateThread { universe: Handle, space: Handle, ip: u64, sp: u64, flags: u32 },
    Yield,
    SubmitObserve { thread: Handle, queue: VirtAddr, context: u64 },
    Resume { thread: Handle },
    LoadRegisters { thread: Handle, set: RegisterSet },
    StoreRegisters { thread: Handle, image: RegisterImage },
    WriteFsBase { value: u64 },

    // Time
    GetClock,
    SubmitAwaitClock { nanos: u64, queue: VirtAddr, context: u64 },

    // IPC
    CreateStream,
    SubmitAsync { handle: Handle, actions: Vec<Action>, queue: VirtAddr, context: u64 },

    // Synchronization
    FutexWait { address: VirtAddr, expected: u32 },
    FutexWake { address: VirtAddr },

    // Interrupts
    AccessIrq { number: u32 },
    AcknowledgeIrq { handle: Handle },
    SubmitWaitForIrq { handle: Handle, queue: VirtAddr, context: u64 },

    // I/O ports
    AccessIo { ports: Vec<u64> },
    EnableIo { handle: Handle },
    EnableFullIo,
}

impl Syscall {
    /// Stable name used in the audit trail.
    pub fn name(&self) -> &'static str {
        match self {
            Syscall::Log { .. } => "log",
            Syscall::Panic { .. } => "panic",
            Syscall::CreateUniverse => "create-universe",
            Syscall::TransferDescriptor { .. } => "transfer-descriptor",
            Syscall::DescriptorInfo { .. } => "descriptor-info",
            Syscall::CloseDescriptor { .. } => "close-descriptor",
            Syscall::AllocateMemory { .. } => "allocate-memory",
            Syscall::CreateManagedMemory { .. } => "create-managed-memory",
            Syscall::AccessPhysical { .. } => "access-physical",
            Syscall::MemoryInfo { .. } => "memory-info",
            Syscall::SubmitManageMemory { .. } => "submit-manage-memory",
            Syscall::CompleteLoad { .. } => "complete-load",
            Syscall::SubmitLockMemory { .. } => "submit-lock-memory",
            Syscall::Loadahead { .. } => "loadahead",
            Syscall::CreateSpace => "create-space",
            Syscall::ForkSpace { .. } => "fork-space",
            Syscall::MapMemory { .. } => "map-memory",
            Syscall::UnmapMemory { .. } => "unmap-memory",
            Syscall::PointerPhysical { .. } => "pointer-physical",
            Syscall::LoadForeign { .. } => "load-foreign",
            Syscall::CreateThread { .. } => "create-thread",
            Syscall::Yield => "yield",
            Syscall::SubmitObserve { .. } => "submit-observe",
            Syscall::Resume { .. } => "resume",
            Syscall::LoadRegisters { .. } => "load-registers",
            Syscall::StoreRegisters { .. } => "store-registers",
            Syscall::WriteFsBase { .. } => "write-fs-base",
            Syscall::GetClock => "get-clock",
            Syscall::SubmitAwaitClock { .. } => "submit-await-clock",
            Syscall::CreateStream => "create-stream",
            Syscall::SubmitAsync { .. } => "submit-async",
            Syscall::FutexWait { .. } => "futex-wait",
            Syscall::FutexWake { .. } => "futex-wake",
            Syscall::AccessIrq { .. } => "access-irq",
            Syscall::AcknowledgeIrq { .. } => "acknowledge-irq",
            Syscall::SubmitWaitForIrq { .. } => "submit-wait-for-irq",
            Syscall::AccessIo { .. } => "access-io",
            Syscall::EnableIo { .. } => "enable-io",
            Syscall::EnableFullIo => "enable-full-io",
        }
    }
}

/// Successful syscall results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyscallReply {
    None,
    Handle(Handle),
    HandlePair(Handle, Handle),
    Tag(DescriptorTag),
    Size(u64),
    Address(VirtAddr),
    Physical(PhysAddr),
    Bytes(Vec<u8>),
    Registers(RegisterImage),
    Clock(u64),
}

/// An audit-trail entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    Invoked {
        caller: ThreadId,
        name: &'static str,
    },
    Completed {
        caller: ThreadId,
        name: &'static str,
    },
    Rejected {
        caller: ThreadId,
        name: &'static str,
        error: KernelError,
    },
}

/// Dispatcher for the syscall surface.
pub struct SyscallGate {
    audit: Mutex<Vec<GateEvent>>,
}

impl SyscallGate {
    pub fn new() -> SyscallGate {
        SyscallGate {
            audit: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<GateEvent> {
        self.audit.lock().expect("gate audit lock").clone()
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&GateEvent) -> bool,
    {
        self.audit
            .lock()
            .expect("gate audit lock")
            .iter()
            .any(predicate)
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&GateEvent) -> bool,
    {
        self.audit
            .lock()
            .expect("gate audit lock")
            .iter()
            .filter(|event| predicate(event))
            .count()
    }

    fn record(&self, event: GateEvent) {
        self.audit.lock().expect("gate audit lock").push(event);
    }

    /// Executes one syscall on behalf of `caller`.
    pub fn dispatch(
        &self,
        kernel: &Kernel,
        caller: &Arc<Thread>,
        syscall: Syscall,
    ) -> KernelResult<SyscallReply> {
        let name = syscall.name();
        self.record(GateEvent::Invoked {
            caller: caller.id(),
            name,
        });

        let result = self.execute(kernel, caller, syscall);

        match &result {
            Ok(_) => self.record(GateEvent::Completed {
                caller: caller.id(),
                name,
            }),
            Err(error) => self.record(GateEvent::Rejected {
                caller: caller.id(),
                name,
                error: *error,
            }),
        }
        result
    }

    fn execute(
        &self,
        kernel: &Kernel,
        caller: &Arc<Thread>,
        syscall: Syscall,
    ) -> KernelResult<SyscallReply> {
        match syscall {
            Syscall::Log { message } => {
                kernel.sys_log(caller, &message)?;
                Ok(SyscallReply::None)
            }
            Syscall::Panic { message } => {
                kernel.sys_panic(caller, &message)?;
                Ok(SyscallReply::None)
            }
            Syscall::CreateUniverse => kernel.create_universe(caller).map(SyscallReply::Handle),
            Syscall::TransferDescriptor { handle, universe } => kernel
                .transfer_descriptor(caller, handle, universe)
                .map(SyscallReply::Handle),
            Syscall::DescriptorInfo { handle } => {
                kernel.descriptor_info(caller, handle).map(SyscallReply::Tag)
            }
            Syscall::CloseDescriptor { handle } => {
                kernel.close_descriptor(caller, handle)?;
                Ok(SyscallReply::None)
            }
            Syscall::AllocateMemory { size, flags } => kernel
                .allocate_memory(caller, size, flags)
                .map(SyscallReply::Handle),
            Syscall::CreateManagedMemory { size } => kernel
                .create_managed_memory(caller, size)
                .map(|(backing, frontal)| SyscallReply::HandlePair(backing, frontal)),
            Syscall::AccessPhysical { physical, size } => kernel
                .access_physical(caller, physical, size)
                .map(SyscallReply::Handle),
            Syscall::MemoryInfo { handle } => {
                kernel.memory_info(caller, handle).map(SyscallReply::Size)
            }
            Syscall::SubmitManageMemory {
                handle,
                queue,
                context,
            } => {
                kernel.submit_manage_memory(caller, handle, queue, context)?;
                Ok(SyscallReply::None)
            }
            Syscall::CompleteLoad {
                handle,
                offset,
                length,
            } => {
                kernel.complete_load(caller, handle, offset, length)?;
                Ok(SyscallReply::None)
            }
            Syscall::SubmitLockMemory {
                handle,
                offset,
                size,
                queue,
                context,
            } => {
                kernel.submit_lock_memory(caller, handle, offset, size, queue, context)?;
                Ok(SyscallReply::None)
            }
            Syscall::Loadahead {
                handle,
                offset,
                length,
            } => {
                kernel.loadahead(caller, handle, offset, length)?;
                Ok(SyscallReply::None)
            }
            Syscall::CreateSpace => kernel.create_space(caller).map(SyscallReply::Handle),
            Syscall::ForkSpace { handle } => {
                kernel.fork_space(caller, handle).map(SyscallReply::Handle)
            }
            Syscall::MapMemory {
                memory,
                space,
                hint,
                offset,
                length,
                flags,
            } => kernel
                .map_memory(caller, memory, space, hint, offset, length, flags)
                .map(SyscallReply::Address),
            Syscall::UnmapMemory {
                space,
                address,
                length,
            } => {
                kernel.unmap_memory(caller, space, address, length)?;
                Ok(SyscallReply::None)
            }
            Syscall::PointerPhysical { address } => kernel
                .pointer_physical(caller, address)
                .map(SyscallReply::Physical),
            Syscall::LoadForeign {
                space,
                address,
                length,
            } => kernel
                .load_foreign(caller, space, address, length)
                .map(SyscallReply::Bytes),
            Syscall::CreateThread {
                universe,
                space,
                ip,
                sp,
                flags,
            } => kernel
                .create_thread(caller, universe, space, ip, sp, flags)
                .map(SyscallReply::Handle),
            Syscall::Yield => {
                kernel.yield_now(caller)?;
                Ok(SyscallReply::None)
            }
            Syscall::SubmitObserve {
                thread,
                queue,
                context,
            } => {
                kernel.submit_observe(caller, thread, queue, context)?;
                Ok(SyscallReply::None)
            }
            Syscall::Resume { thread } => {
                kernel.resume(caller, thread)?;
                Ok(SyscallReply::None)
            }
            Syscall::LoadRegisters { thread, set } => kernel
                .load_registers(caller, thread, set)
                .map(SyscallReply::Registers),
            Syscall::StoreRegisters { thread, image } => {
                kernel.store_registers(caller, thread, image)?;
                Ok(SyscallReply::None)
            }
            Syscall::WriteFsBase { value } => {
                kernel.write_fs_base(caller, value)?;
                Ok(SyscallReply::None)
            }
            Syscall::GetClock => Ok(SyscallReply::Clock(kernel.get_clock())),
            Syscall::SubmitAwaitClock {
                nanos,
                queue,
                context,
            } => {
                kernel.submit_await_clock(caller, nanos, queue, context)?;
                Ok(SyscallReply::None)
            }
            Syscall::CreateStream => kernel
                .create_stream(caller)
                .map(|(first, second)| SyscallReply::HandlePair(first, second)),
            Syscall::SubmitAsync {
                handle,
                actions,
                queue,
                context,
            } => {
                kernel.submit_async(caller, handle, actions, queue, context)?;
                Ok(SyscallReply::None)
            }
            Syscall::FutexWait { address, expected } => {
                kernel.futex_wait(caller, address, expected)?;
                Ok(SyscallReply::None)
            }
            Syscall::FutexWake { address } => {
                kernel.futex_wake(caller, address)?;
                Ok(SyscallReply::None)
            }
            Syscall::AccessIrq { number } => {
                kernel.access_irq(caller, number).map(SyscallReply::Handle)
            }
            Syscall::AcknowledgeIrq { handle } => {
                kernel.acknowledge_irq(caller, handle)?;
                Ok(SyscallReply::None)
            }
            Syscall::SubmitWaitForIrq {
                handle,
                queue,
                context,
            } => {
                kernel.submit_wait_for_irq(caller, handle, queue, context)?;
                Ok(SyscallReply::None)
            }
            Syscall::AccessIo { ports } => {
                kernel.access_io(caller, &ports).map(SyscallReply::Handle)
            }
            Syscall::EnableIo { handle } => {
                kernel.enable_io(caller, handle)?;
                Ok(SyscallReply::None)
            }
            Syscall::EnableFullIo => {
                kernel.enable_full_io(caller)?;
                Ok(SyscallReply::None)
            }
        }
    }
}

impl Default for SyscallGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;

    #[test]
    fn test_dispatch_records_completion() {
        let kernel = Kernel::new();
        let caller = kernel.bootstrap_thread();
        let gate = SyscallGate::new();

        let reply = gate
            .dispatch(&kernel, &caller, Syscall::CreateUniverse)
            .unwrap();
        assert!(matches!(reply, SyscallReply::Handle(_)));
        assert_eq!(gate.events().len(), 2);
        assert!(gate.has_event(|event| matches!(
            event,
            GateEvent::Completed { name: "create-universe", .. }
        )));
    }

    #[test]
    fn test_dispatch_records_rejection() {
        let kernel = Kernel::new();
        let caller = kernel.bootstrap_thread();
        let gate = SyscallGate::new();

        let result = gate.dispatch(
            &kernel,
            &caller,
            Syscall::CloseDescriptor {
                handle: Handle::from_raw(404),
            },
        );
        assert_eq!(result.err(), Some(KernelError::NoDescriptor));
        assert!(gate.has_event(|event| matches!(
            event,
            GateEvent::Rejected {
                name: "close-descriptor",
                error: KernelError::NoDescriptor,
                ..
            }
        )));
    }

    #[test]
    fn test_syscall_serialization_round_trip() {
        let syscall = Syscall::MapMemory {
            memory: Handle::from_raw(3),
            space: Handle::NULL,
            hint: None,
            offset: 0,
            length: 4096,
            flags: kernel_api::flags::MAP_READ_WRITE,
        };
        let encoded = serde_json::to_vec(&syscall).unwrap();
        let decoded: Syscall = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.name(), "map-memory");
    }

    #[test]
    fn test_audit_counts_invocations() {
        let kernel = Kernel::new();
        let caller = kernel.bootstrap_thread();
        let gate = SyscallGate::new();

        for _ in 0..3 {
            gate.dispatch(&kernel, &caller, Syscall::GetClock).unwrap();
        }
        assert_eq!(
            gate.count_events(|event| matches!(event, GateEvent::Invoked { .. })),
            3
        );
    }
}
