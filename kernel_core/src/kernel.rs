//! The kernel facade
//!
//! Every syscall lives here as one method taking the calling thread
//! explicitly. Each call validates its arguments, resolves handles through
//! the caller's universe, and either returns synchronously or parks an
//! asynchronous operation whose completion lands in the caller's queue.
//!
//! The platform hooks the hardware would drive live here too: `fire_irq`
//! raises a pin edge, `advance_clock` moves virtual time, and
//! `read_memory`/`write_memory` stand in for user-mode loads and stores,
//! taking the same fault paths a hardware access would.

use core_types::{
    DescriptorTag, Handle, KernelError, KernelResult, PhysAddr, VirtAddr,
};
use kernel_api::queue::{ELEMENT_HEADER_SIZE, QUEUE_HEADER_SIZE};
use kernel_api::{
    actions, Action, ActionKind, AllocateSettings, Duration, MapSettings, QueueHeader,
    RegisterImage, RegisterSet, ThreadSettings,
};
use std::sync::{Arc, Mutex};

use crate::address_space::{AddressSpace, ForeignAccessor};
use crate::clock::Clock;
use crate::io::IoSpace;
use crate::irq::{IrqObject, IrqPin};
use crate::klog::{KernelLog, LogLevel};
use crate::memory::Memory;
use crate::scheduler::Scheduler;
use crate::stream::{Incoming, LaneHandle, Stream};
use crate::thread::{Interrupt, Thread};
use crate::universe::{self, Descriptor, Universe};
use crate::writer::{Batch, Completer, EventWriter, QueueTarget};

/// Number of platform IRQ pins set up at boot.
pub const IRQ_PIN_COUNT: usize = 16;

/// The kernel.
pub struct Kernel {
    log: Arc<KernelLog>,
    clock: Clock,
    scheduler: Mutex<Scheduler>,
    irq_pins: Vec<Arc<IrqPin>>,
}

impl Kernel {
    pub fn new() -> Arc<Kernel> {
        let irq_pins = (0..IRQ_PIN_COUNT as u32).map(IrqPin::new).collect();
        Arc::new(Kernel {
            log: Arc::new(KernelLog::new()),
            clock: Clock::new(),
            scheduler: Mutex::new(Scheduler::new()),
            irq_pins,
        })
    }

    /// Creates an initial thread with a fresh universe and address space;
    /// what boot would do for the first userspace task.
    pub fn bootstrap_thread(&self) -> Arc<Thread> {
        let thread = Thread::create(
            Universe::new(),
            AddressSpace::new(),
            0,
            0,
            ThreadSettings::parse(0).expect("empty thread flags"),
        );
        self.scheduler
            .lock()
            .expect("scheduler lock")
            .attach(thread.id(), true);
        thread
    }

    pub fn kernel_log(&self) -> &Arc<KernelLog> {
        &self.log
    }

    // --- handle resolution -------------------------------------------------

    fn resolve_universe_arg(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
    ) -> KernelResult<Arc<Universe>> {
        if handle.is_null() || handle == Handle::THIS_UNIVERSE {
            return Ok(caller.universe().clone());
        }
        caller.universe().get(handle)?.into_universe()
    }

    fn resolve_space_arg(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
    ) -> KernelResult<Arc<AddressSpace>> {
        if handle.is_null() {
            return Ok(caller.space().clone());
        }
        caller.universe().get(handle)?.into_space()
    }

    fn resolve_thread_arg(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
    ) -> KernelResult<Arc<Thread>> {
        if handle == Handle::THIS_THREAD {
            return Ok(caller.clone());
        }
        caller.universe().get(handle)?.into_thread()
    }

    fn queue_target(&self, caller: &Arc<Thread>, queue: VirtAddr, context: u64) -> QueueTarget {
        QueueTarget {
            space: caller.space().clone(),
            queue,
            context,
            log: self.log.clone(),
        }
    }

    /// Validates that the queue header is well-formed and can ever hold a
    /// batch of `need` payload bytes.
    fn check_queue(&self, caller: &Arc<Thread>, queue: VirtAddr, need: u64) -> KernelResult<()> {
        let mut header_bytes = [0u8; QUEUE_HEADER_SIZE as usize];
        caller.space().read(queue, &mut header_bytes)?;
        let header = QueueHeader::decode(&header_bytes).ok_or(KernelError::IllegalArgs)?;
        if header.capacity == 0
            || header.capacity % 8 != 0
            || need + ELEMENT_HEADER_SIZE > header.capacity
        {
            return Err(KernelError::IllegalArgs);
        }
        Ok(())
    }

    // --- log ---------------------------------------------------------------

    /// Appends a userspace message to the kernel log.
    pub fn sys_log(&self, _caller: &Arc<Thread>, message: &[u8]) -> KernelResult<()> {
        self.log
            .append(LogLevel::Info, String::from_utf8_lossy(message).into_owned());
        Ok(())
    }

    /// Logs at error level and interrupts the caller with a panic
    /// observation.
    pub fn sys_panic(&self, caller: &Arc<Thread>, message: &[u8]) -> KernelResult<()> {
        self.log.append(
            LogLevel::Error,
            String::from_utf8_lossy(message).into_owned(),
        );
        caller.raise(Interrupt::Panic);
        Ok(())
    }

    // --- descriptors -------------------------------------------------------

    pub fn create_universe(&self, caller: &Arc<Thread>) -> KernelResult<Handle> {
        let universe = Universe::new();
        Ok(caller.universe().attach(Descriptor::Universe(universe)))
    }

    pub fn transfer_descriptor(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
        universe_handle: Handle,
    ) -> KernelResult<Handle> {
        let target = self.resolve_universe_arg(caller, universe_handle)?;
        universe::transfer(caller.universe(), &target, handle)
    }

    pub fn descriptor_info(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
    ) -> KernelResult<DescriptorTag> {
        caller.universe().tag_of(handle)
    }

    pub fn close_descriptor(&self, caller: &Arc<Thread>, handle: Handle) -> KernelResult<()> {
        // The descriptor drops here, outside the table lock; for a lane
        // this is where close propagation runs.
        let _descriptor = caller.universe().detach(handle)?;
        Ok(())
    }

    // --- memory objects ----------------------------------------------------

    pub fn allocate_memory(
        &self,
        caller: &Arc<Thread>,
        size: u64,
        flags: u32,
    ) -> KernelResult<Handle> {
        let settings = AllocateSettings::parse(flags)?;
        let memory = Memory::allocate(size, settings)?;
        Ok(caller.universe().attach(Descriptor::Memory(memory)))
    }

    pub fn create_managed_memory(
        &self,
        caller: &Arc<Thread>,
        size: u64,
    ) -> KernelResult<(Handle, Handle)> {
        let (backing, frontal) = Memory::create_managed(size)?;
        let backing_handle = caller.universe().attach(Descriptor::Memory(backing));
        let frontal_handle = caller.universe().attach(Descriptor::Memory(frontal));
        Ok((backing_handle, frontal_handle))
    }

    pub fn access_physical(
        &self,
        caller: &Arc<Thread>,
        physical: PhysAddr,
        size: u64,
    ) -> KernelResult<Handle> {
        let memory = Memory::hardware(physical, size)?;
        Ok(caller.universe().attach(Descriptor::Memory(memory)))
    }

    pub fn memory_info(&self, caller: &Arc<Thread>, handle: Handle) -> KernelResult<u64> {
        let memory = caller.universe().get(handle)?.into_memory()?;
        Ok(memory.length())
    }

    pub fn submit_manage_memory(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
        queue: VirtAddr,
        context: u64,
    ) -> KernelResult<()> {
        let memory = caller.universe().get(handle)?.into_memory()?;
        self.check_queue(caller, queue, 24)?;
        memory.submit_manage(Completer::Direct(self.queue_target(caller, queue, context)))
    }

    pub fn complete_load(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
        offset: u64,
        length: u64,
    ) -> KernelResult<()> {
        let memory = caller.universe().get(handle)?.into_memory()?;
        memory.complete_load(offset, length)
    }

    pub fn submit_lock_memory(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
        offset: u64,
        size: u64,
        queue: VirtAddr,
        context: u64,
    ) -> KernelResult<()> {
        let memory = caller.universe().get(handle)?.into_memory()?;
        self.check_queue(caller, queue, 8)?;
        memory.submit_lock(
            offset,
            size,
            Completer::Direct(self.queue_target(caller, queue, context)),
        )
    }

    pub fn loadahead(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
        offset: u64,
        length: u64,
    ) -> KernelResult<()> {
        let memory = caller.universe().get(handle)?.into_memory()?;
        memory.loadahead(offset, length)
    }

    // --- address spaces ----------------------------------------------------

    pub fn create_space(&self, caller: &Arc<Thread>) -> KernelResult<Handle> {
        let space = AddressSpace::new();
        Ok(caller.universe().attach(Descriptor::Space(space)))
    }

    pub fn fork_space(&self, caller: &Arc<Thread>, handle: Handle) -> KernelResult<Handle> {
        let space = self.resolve_space_arg(caller, handle)?;
        let forked = space.fork();
        Ok(caller.universe().attach(Descriptor::Space(forked)))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn map_memory(
        &self,
        caller: &Arc<Thread>,
        memory_handle: Handle,
        space_handle: Handle,
        hint: Option<VirtAddr>,
        offset: u64,
        length: u64,
        flags: u32,
    ) -> KernelResult<VirtAddr> {
        let settings = MapSettings::parse(flags, hint)?;
        let memory = caller.universe().get(memory_handle)?.into_memory()?;
        let space = self.resolve_space_arg(caller, space_handle)?;
        space.map(memory, settings, offset, length)
    }

    pub fn unmap_memory(
        &self,
        caller: &Arc<Thread>,
        space_handle: Handle,
        address: VirtAddr,
        length: u64,
    ) -> KernelResult<()> {
        let space = self.resolve_space_arg(caller, space_handle)?;
        space.unmap(address, length)
    }

    pub fn pointer_physical(
        &self,
        caller: &Arc<Thread>,
        address: VirtAddr,
    ) -> KernelResult<PhysAddr> {
        caller.space().grab_physical(address)
    }

    /// Reads another space's memory through a foreign accessor.
    pub fn load_foreign(
        &self,
        caller: &Arc<Thread>,
        space_handle: Handle,
        address: VirtAddr,
        length: u64,
    ) -> KernelResult<Vec<u8>> {
        let space = self.resolve_space_arg(caller, space_handle)?;
        let accessor = ForeignAccessor::acquire(space, address, length);
        let mut buffer = vec![0u8; length as usize];
        accessor.load(0, &mut buffer)?;
        Ok(buffer)
    }

    // --- user memory access (fault path) -----------------------------------

    /// A user-mode load by the calling thread. Faults that resolution
    /// cannot satisfy become page-fault observations.
    pub fn read_memory(
        &self,
        caller: &Arc<Thread>,
        address: VirtAddr,
        length: usize,
    ) -> KernelResult<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        match caller.space().read(address, &mut buffer) {
            Ok(()) => Ok(buffer),
            Err(error) => {
                caller.raise(Interrupt::PageFault);
                Err(error)
            }
        }
    }

    /// A user-mode store by the calling thread.
    pub fn write_memory(
        &self,
        caller: &Arc<Thread>,
        address: VirtAddr,
        data: &[u8],
    ) -> KernelResult<()> {
        match caller.space().write(address, data) {
            Ok(()) => Ok(()),
            Err(error) => {
                caller.raise(Interrupt::PageFault);
                Err(error)
            }
        }
    }

    // --- threads -----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_thread(
        &self,
        caller: &Arc<Thread>,
        universe_handle: Handle,
        space_handle: Handle,
        ip: u64,
        sp: u64,
        flags: u32,
    ) -> KernelResult<Handle> {
        let settings = ThreadSettings::parse(flags)?;
        let universe = self.resolve_universe_arg(caller, universe_handle)?;
        let space = self.resolve_space_arg(caller, space_handle)?;
        let thread = Thread::create(universe, space, ip, sp, settings);
        self.scheduler
            .lock()
            .expect("scheduler lock")
            .attach(thread.id(), !settings.start_stopped);
        Ok(caller.universe().attach(Descriptor::Thread(thread)))
    }

    /// Defers the calling thread to the back of the run queue.
    pub fn yield_now(&self, caller: &Arc<Thread>) -> KernelResult<()> {
        self.scheduler
            .lock()
            .expect("scheduler lock")
            .defer(caller.id());
        Ok(())
    }

    pub fn submit_observe(
        &self,
        caller: &Arc<Thread>,
        thread_handle: Handle,
        queue: VirtAddr,
        context: u64,
    ) -> KernelResult<()> {
        let thread = caller.universe().get(thread_handle)?.into_thread()?;
        self.check_queue(caller, queue, 16)?;
        thread.submit_observe(Completer::Direct(self.queue_target(caller, queue, context)));
        Ok(())
    }

    pub fn resume(&self, caller: &Arc<Thread>, thread_handle: Handle) -> KernelResult<()> {
        let thread = caller.universe().get(thread_handle)?.into_thread()?;
        thread.resume()?;
        self.scheduler
            .lock()
            .expect("scheduler lock")
            .resume(thread.id());
        Ok(())
    }

    pub fn load_registers(
        &self,
        caller: &Arc<Thread>,
        thread_handle: Handle,
        set: RegisterSet,
    ) -> KernelResult<RegisterImage> {
        let thread = self.resolve_thread_arg(caller, thread_handle)?;
        Ok(thread.load_registers(set))
    }

    pub fn store_registers(
        &self,
        caller: &Arc<Thread>,
        thread_handle: Handle,
        image: RegisterImage,
    ) -> KernelResult<()> {
        let thread = self.resolve_thread_arg(caller, thread_handle)?;
        let self_store = Arc::ptr_eq(&thread, caller);
        thread.store_registers(image, self_store)
    }

    pub fn write_fs_base(&self, caller: &Arc<Thread>, value: u64) -> KernelResult<()> {
        caller.write_fs_base(value);
        Ok(())
    }

    // --- time --------------------------------------------------------------

    /// Current kernel time in nanoseconds.
    pub fn get_clock(&self) -> u64 {
        self.clock.now().as_nanos()
    }

    /// Completes after `nanos` of kernel time have elapsed.
    pub fn submit_await_clock(
        &self,
        caller: &Arc<Thread>,
        nanos: u64,
        queue: VirtAddr,
        context: u64,
    ) -> KernelResult<()> {
        self.check_queue(caller, queue, 8)?;
        self.clock.submit_await(
            Duration::from_nanos(nanos),
            Completer::Direct(self.queue_target(caller, queue, context)),
        );
        Ok(())
    }

    /// Platform hook: advances virtual time, firing due timers.
    pub fn advance_clock(&self, nanos: u64) -> usize {
        self.clock.advance(Duration::from_nanos(nanos))
    }

    // --- streams -----------------------------------------------------------

    pub fn create_stream(&self, caller: &Arc<Thread>) -> KernelResult<(Handle, Handle)> {
        let (first, second) = Stream::create();
        let first_handle = caller.universe().attach(Descriptor::Lane(first));
        let second_handle = caller.universe().attach(Descriptor::Lane(second));
        Ok((first_handle, second_handle))
    }

    fn resolve_lane(&self, caller: &Arc<Thread>, handle: Handle) -> KernelResult<LaneHandle> {
        if handle == Handle::THIS_THREAD {
            return Ok(caller.inferior_lane().clone());
        }
        match caller.universe().get(handle)? {
            Descriptor::Lane(lane) => Ok(lane),
            Descriptor::Thread(thread) => Ok(thread.superior_lane().clone()),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    /// Minimum payload bytes the submission's batch can occupy.
    fn batch_floor(actions_list: &[Action]) -> u64 {
        actions_list
            .iter()
            .map(|action| match action.record_kind() {
                kernel_api::RecordKind::Simple => 8,
                kernel_api::RecordKind::Inline => 16,
                _ => 16,
            })
            .sum()
    }

    /// Submits a sequence of IPC actions against a lane.
    pub fn submit_async(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
        actions_list: Vec<Action>,
        queue: VirtAddr,
        context: u64,
    ) -> KernelResult<()> {
        let root = self.resolve_lane(caller, handle)?;
        actions::validate_sequence(&actions_list)?;
        self.check_queue(caller, queue, Self::batch_floor(&actions_list))?;

        // Validation before side effects: every pushed descriptor must
        // exist now.
        for action in &actions_list {
            if action.kind == ActionKind::PushDescriptor {
                caller.universe().get(action.handle)?;
            }
        }

        let batch = Batch::new(self.queue_target(caller, queue, context), actions_list.len());
        let mut stack = vec![root];

        for (index, action) in actions_list.into_iter().enumerate() {
            let completer = Completer::Batched {
                batch: batch.clone(),
                index,
            };
            let target = if action.chain {
                stack.last().expect("validated stack").clone()
            } else {
                stack.pop().expect("validated stack")
            };

            let branch = match action.kind {
                ActionKind::Offer => target.submit(Incoming::Offer { completer }),
                ActionKind::Accept => target.submit(Incoming::Accept {
                    completer,
                    universe: Arc::downgrade(caller.universe()),
                }),
                ActionKind::SendFromBuffer => target.submit(Incoming::Send {
                    completer,
                    data: action.data,
                }),
                ActionKind::RecvInline => target.submit(Incoming::RecvInline { completer }),
                ActionKind::RecvToBuffer => {
                    let accessor = ForeignAccessor::acquire(
                        caller.space().clone(),
                        action.buffer,
                        action.length,
                    );
                    target.submit(Incoming::RecvBuffer {
                        completer,
                        accessor,
                    })
                }
                ActionKind::PushDescriptor => {
                    // Lane endpoints move; everything else is cloned.
                    let looked_up = match caller.universe().get(action.handle) {
                        Ok(Descriptor::Lane(_)) => caller.universe().detach(action.handle),
                        other => other,
                    };
                    match looked_up {
                        Ok(descriptor) => target.submit(Incoming::Push {
                            completer,
                            descriptor,
                        }),
                        Err(error) => {
                            // Raced with a close after validation.
                            completer.complete(EventWriter::failed(error));
                            None
                        }
                    }
                }
                ActionKind::PullDescriptor => target.submit(Incoming::Pull {
                    completer,
                    universe: Arc::downgrade(caller.universe()),
                }),
            };

            if action.ancillary {
                stack.push(branch.ok_or(KernelError::IllegalArgs)?);
            }
        }
        debug_assert!(stack.is_empty());
        Ok(())
    }

    // --- futexes -----------------------------------------------------------

    pub fn futex_wait(
        &self,
        caller: &Arc<Thread>,
        address: VirtAddr,
        expected: u32,
    ) -> KernelResult<()> {
        let space = caller.space().clone();
        caller.mark_blocked();
        self.scheduler
            .lock()
            .expect("scheduler lock")
            .block(caller.id());

        let result = space.futex().wait(&space, address, expected);

        self.scheduler
            .lock()
            .expect("scheduler lock")
            .unblock(caller.id());
        caller.mark_runnable();
        result
    }

    pub fn futex_wake(&self, caller: &Arc<Thread>, address: VirtAddr) -> KernelResult<()> {
        caller.space().futex().wake(address);
        Ok(())
    }

    // --- interrupts --------------------------------------------------------

    pub fn access_irq(&self, caller: &Arc<Thread>, number: u32) -> KernelResult<Handle> {
        let pin = self
            .irq_pins
            .get(number as usize)
            .ok_or(KernelError::IllegalArgs)?;
        let object = IrqObject::bind(pin.clone());
        Ok(caller.universe().attach(Descriptor::Irq(object)))
    }

    pub fn acknowledge_irq(&self, caller: &Arc<Thread>, handle: Handle) -> KernelResult<()> {
        let irq = caller.universe().get(handle)?.into_irq()?;
        irq.acknowledge();
        Ok(())
    }

    pub fn submit_wait_for_irq(
        &self,
        caller: &Arc<Thread>,
        handle: Handle,
        queue: VirtAddr,
        context: u64,
    ) -> KernelResult<()> {
        let irq = caller.universe().get(handle)?.into_irq()?;
        self.check_queue(caller, queue, 8)?;
        irq.submit_wait(Completer::Direct(self.queue_target(caller, queue, context)))
    }

    /// Platform hook: an edge on the given pin.
    pub fn fire_irq(&self, number: u32) -> KernelResult<usize> {
        let pin = self
            .irq_pins
            .get(number as usize)
            .ok_or(KernelError::IllegalArgs)?;
        Ok(pin.fire())
    }

    // --- I/O ports ---------------------------------------------------------

    pub fn access_io(&self, caller: &Arc<Thread>, ports: &[u64]) -> KernelResult<Handle> {
        let io = IoSpace::new(ports.iter().copied());
        Ok(caller.universe().attach(Descriptor::Io(io)))
    }

    pub fn enable_io(&self, caller: &Arc<Thread>, handle: Handle) -> KernelResult<()> {
        let io = caller.universe().get(handle)?.into_io()?;
        caller.enable_ports(io.ports());
        Ok(())
    }

    pub fn enable_full_io(&self, caller: &Arc<Thread>) -> KernelResult<()> {
        caller.enable_full_io();
        Ok(())
    }

    /// Scheduler bookkeeping snapshot (tests).
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&Scheduler) -> R) -> R {
        let scheduler = self.scheduler.lock().expect("scheduler lock");
        f(&scheduler)
    }
}
