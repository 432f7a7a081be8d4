//! Threads
//!
//! A thread owns an executor (its register image), a universe, and an
//! address space, plus the two implicit lanes every thread is born with:
//! the *superior* lane its creator talks to and the *inferior* lane the
//! thread itself uses. Threads do not execute code in this kernel; they are
//! the subjects of scheduling state, register introspection, and
//! observations.

use core_types::{KernelError, KernelResult, Observation, ThreadId};
use kernel_api::{
    DebugRegisters, GeneralRegisters, ProgramRegisters, RegisterImage, RegisterSet,
    ThreadRegisters, ThreadSettings,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::address_space::AddressSpace;
use crate::stream::{LaneHandle, Stream};
use crate::universe::Universe;
use crate::writer::{Completer, EventWriter};

/// Why a thread left its normal run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Stop,
    Panic,
    Breakpoint,
    PageFault,
    SuperCall(u32),
}

impl Interrupt {
    /// The user-visible observation for this interrupt.
    pub fn observation(&self) -> Observation {
        match self {
            Interrupt::Stop => Observation::Stop,
            Interrupt::Panic => Observation::Panic,
            Interrupt::Breakpoint => Observation::Breakpoint,
            Interrupt::PageFault => Observation::PageFault,
            Interrupt::SuperCall(n) => Observation::SuperCall(*n),
        }
    }
}

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Runnable,
    Stopped,
    Blocked,
    Interrupted(Interrupt),
    Exited,
}

/// The register image of a thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor {
    pub program: ProgramRegisters,
    pub general: GeneralRegisters,
    pub thread_area: ThreadRegisters,
    pub debug: DebugRegisters,
}

struct ThreadState {
    run: RunState,
    executor: Executor,
    observers: Vec<Completer>,
    io_ports: BTreeSet<u64>,
    full_io: bool,
}

/// A kernel thread object.
pub struct Thread {
    id: ThreadId,
    settings: ThreadSettings,
    universe: Arc<Universe>,
    space: Arc<AddressSpace>,
    superior: LaneHandle,
    inferior: LaneHandle,
    state: Mutex<ThreadState>,
}

impl Thread {
    pub fn create(
        universe: Arc<Universe>,
        space: Arc<AddressSpace>,
        ip: u64,
        sp: u64,
        settings: ThreadSettings,
    ) -> Arc<Thread> {
        let (superior, inferior) = Stream::create();
        let mut executor = Executor::default();
        executor.program = ProgramRegisters { ip, sp };
        Arc::new(Thread {
            id: ThreadId::new(),
            settings,
            universe,
            space,
            superior,
            inferior,
            state: Mutex::new(ThreadState {
                run: if settings.start_stopped {
                    RunState::Stopped
                } else {
                    RunState::Runnable
                },
                executor,
                observers: Vec::new(),
                io_ports: BTreeSet::new(),
                full_io: false,
            }),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn universe(&self) -> &Arc<Universe> {
        &self.universe
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// The lane the creator uses to talk to this thread.
    pub fn superior_lane(&self) -> &LaneHandle {
        &self.superior
    }

    /// The lane the thread itself uses.
    pub fn inferior_lane(&self) -> &LaneHandle {
        &self.inferior
    }

    pub fn run_state(&self) -> RunState {
        self.state.lock().expect("thread lock").run
    }

    /// Parks an observation; it completes on the next interruption event.
    pub fn submit_observe(&self, completer: Completer) {
        let mut state = self.state.lock().expect("thread lock");
        state.observers.push(completer);
    }

    /// Delivers an interruption: the thread leaves the running state and
    /// every parked observer completes with the mapped observation.
    pub fn raise(&self, interrupt: Interrupt) {
        let observers = {
            let mut state = self.state.lock().expect("thread lock");
            state.run = if self.settings.traps_fatal
                && !matches!(interrupt, Interrupt::SuperCall(_))
            {
                RunState::Exited
            } else {
                RunState::Interrupted(interrupt)
            };
            std::mem::take(&mut state.observers)
        };
        let observation = interrupt.observation().encode();
        for completer in observers {
            completer.complete(EventWriter::Observe {
                error: core_types::error::CODE_NONE,
                observation,
            });
        }
    }

    /// Moves a stopped or interrupted thread back to runnable.
    pub fn resume(&self) -> KernelResult<()> {
        let mut state = self.state.lock().expect("thread lock");
        match state.run {
            RunState::Stopped | RunState::Interrupted(_) => {
                state.run = RunState::Runnable;
                Ok(())
            }
            RunState::Runnable => Ok(()),
            RunState::Blocked | RunState::Exited => Err(KernelError::IllegalArgs),
        }
    }

    pub(crate) fn mark_blocked(&self) {
        let mut state = self.state.lock().expect("thread lock");
        if state.run == RunState::Runnable {
            state.run = RunState::Blocked;
        }
    }

    pub(crate) fn mark_runnable(&self) {
        let mut state = self.state.lock().expect("thread lock");
        if state.run == RunState::Blocked {
            state.run = RunState::Runnable;
        }
    }

    /// Reads one register set out of the executor image.
    pub fn load_registers(&self, set: RegisterSet) -> RegisterImage {
        let state = self.state.lock().expect("thread lock");
        match set {
            RegisterSet::Program => RegisterImage::Program(state.executor.program),
            RegisterSet::General => RegisterImage::General(state.executor.general),
            RegisterSet::Thread => RegisterImage::Thread(state.executor.thread_area),
            RegisterSet::Debug => RegisterImage::Debug(state.executor.debug),
        }
    }

    /// Writes one register set.
    ///
    /// A thread storing into its own image may only touch the program and
    /// thread-area sets while it runs; general and debug stores require the
    /// target to be interrupted, where the image is quiescent.
    pub fn store_registers(&self, image: RegisterImage, self_store: bool) -> KernelResult<()> {
        let mut state = self.state.lock().expect("thread lock");
        if self_store
            && matches!(image, RegisterImage::General(_) | RegisterImage::Debug(_))
            && !matches!(state.run, RunState::Interrupted(_))
        {
            return Err(KernelError::IllegalArgs);
        }
        match image {
            RegisterImage::Program(program) => state.executor.program = program,
            RegisterImage::General(general) => state.executor.general = general,
            RegisterImage::Thread(thread_area) => state.executor.thread_area = thread_area,
            RegisterImage::Debug(debug) => state.executor.debug = debug,
        }
        Ok(())
    }

    /// Fast path for the fs-base register.
    pub fn write_fs_base(&self, value: u64) {
        let mut state = self.state.lock().expect("thread lock");
        state.executor.thread_area.fs_base = value;
    }

    /// Grants access to a set of I/O ports.
    pub fn enable_ports(&self, ports: impl IntoIterator<Item = u64>) {
        let mut state = self.state.lock().expect("thread lock");
        state.io_ports.extend(ports);
    }

    /// Grants access to the whole port range.
    pub fn enable_full_io(&self) {
        let mut state = self.state.lock().expect("thread lock");
        state.full_io = true;
    }

    pub fn can_use_port(&self, port: u64) -> bool {
        let state = self.state.lock().expect("thread lock");
        state.full_io || state.io_ports.contains(&port)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Dropping the thread cancels its pending observes.
        let observers = {
            let mut state = self.state.lock().expect("thread lock");
            std::mem::take(&mut state.observers)
        };
        for completer in observers {
            completer.complete(EventWriter::Observe {
                error: KernelError::ClosedRemotely.code(),
                observation: 0,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(settings: ThreadSettings) -> Arc<Thread> {
        Thread::create(Universe::new(), AddressSpace::new(), 0x1000, 0x2000, settings)
    }

    fn default_settings() -> ThreadSettings {
        ThreadSettings::parse(0).unwrap()
    }

    fn collect() -> (Completer, Arc<Mutex<Vec<EventWriter>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        (Completer::Collect(sink.clone()), sink)
    }

    #[test]
    fn test_initial_run_state() {
        assert_eq!(thread(default_settings()).run_state(), RunState::Runnable);
        let stopped = ThreadSettings::parse(kernel_api::flags::THREAD_START_STOPPED).unwrap();
        assert_eq!(thread(stopped).run_state(), RunState::Stopped);
    }

    #[test]
    fn test_program_registers_from_create() {
        let thread = thread(default_settings());
        match thread.load_registers(RegisterSet::Program) {
            RegisterImage::Program(program) => {
                assert_eq!(program.ip, 0x1000);
                assert_eq!(program.sp, 0x2000);
            }
            _ => panic!("wrong register image"),
        }
    }

    #[test]
    fn test_observe_completes_on_interrupt() {
        let thread = thread(default_settings());
        let (completer, sink) = collect();
        thread.submit_observe(completer);
        assert!(sink.lock().unwrap().is_empty());

        thread.raise(Interrupt::Breakpoint);
        let writers = sink.lock().unwrap();
        assert_eq!(writers.len(), 1);
        assert!(matches!(
            writers[0],
            EventWriter::Observe { error: 0, observation }
                if Observation::decode(observation) == Some(Observation::Breakpoint)
        ));
    }

    #[test]
    fn test_observe_maps_supercalls() {
        let thread = thread(default_settings());
        let (completer, sink) = collect();
        thread.submit_observe(completer);
        thread.raise(Interrupt::SuperCall(9));
        let writers = sink.lock().unwrap();
        assert!(matches!(
            writers[0],
            EventWriter::Observe { observation, .. }
                if Observation::decode(observation) == Some(Observation::SuperCall(9))
        ));
    }

    #[test]
    fn test_observe_fires_once_per_submission() {
        let thread = thread(default_settings());
        let (completer, sink) = collect();
        thread.submit_observe(completer);
        thread.raise(Interrupt::Breakpoint);
        thread.resume().unwrap();
        thread.raise(Interrupt::Stop);
        assert_eq!(sink.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_resume_after_interrupt() {
        let thread = thread(default_settings());
        thread.raise(Interrupt::Stop);
        assert!(matches!(thread.run_state(), RunState::Interrupted(_)));
        thread.resume().unwrap();
        assert_eq!(thread.run_state(), RunState::Runnable);
    }

    #[test]
    fn test_traps_fatal_exits() {
        let settings = ThreadSettings::parse(kernel_api::flags::THREAD_TRAPS_FATAL).unwrap();
        let thread = thread(settings);
        thread.raise(Interrupt::PageFault);
        assert_eq!(thread.run_state(), RunState::Exited);
        assert!(thread.resume().is_err());
    }

    #[test]
    fn test_self_store_of_general_registers_gated() {
        let thread = thread(default_settings());
        let image = RegisterImage::General(GeneralRegisters::default());
        assert_eq!(
            thread.store_registers(image, true),
            Err(KernelError::IllegalArgs)
        );
        // Allowed once interrupted.
        thread.raise(Interrupt::Breakpoint);
        assert!(thread.store_registers(image, true).is_ok());
        // Program stores are always allowed.
        let program = RegisterImage::Program(ProgramRegisters { ip: 1, sp: 2 });
        assert!(thread.store_registers(program, true).is_ok());
    }

    #[test]
    fn test_store_and_load_round_trip() {
        let thread = thread(default_settings());
        let mut general = GeneralRegisters::default();
        general.words[3] = 0xdead;
        thread
            .store_registers(RegisterImage::General(general), false)
            .unwrap();
        match thread.load_registers(RegisterSet::General) {
            RegisterImage::General(loaded) => assert_eq!(loaded.words[3], 0xdead),
            _ => panic!("wrong register image"),
        }
    }

    #[test]
    fn test_write_fs_base() {
        let thread = thread(default_settings());
        thread.write_fs_base(0x7000);
        match thread.load_registers(RegisterSet::Thread) {
            RegisterImage::Thread(thread_area) => assert_eq!(thread_area.fs_base, 0x7000),
            _ => panic!("wrong register image"),
        }
    }

    #[test]
    fn test_io_port_grants() {
        let thread = thread(default_settings());
        assert!(!thread.can_use_port(0x60));
        thread.enable_ports([0x60, 0x64]);
        assert!(thread.can_use_port(0x60));
        assert!(!thread.can_use_port(0x3f8));
        thread.enable_full_io();
        assert!(thread.can_use_port(0x3f8));
    }

    #[test]
    fn test_drop_cancels_observers() {
        let (completer, sink) = collect();
        {
            let thread = thread(default_settings());
            thread.submit_observe(completer);
        }
        let writers = sink.lock().unwrap();
        assert_eq!(writers.len(), 1);
        assert!(matches!(
            writers[0],
            EventWriter::Observe { error, .. } if error == KernelError::ClosedRemotely.code()
        ));
    }
}
