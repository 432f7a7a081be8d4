//! Scheduler glue
//!
//! The kernel core does not impose a scheduling policy; it only keeps the
//! bookkeeping the primitives demand: which threads exist, which are
//! runnable, and a deterministic round-robin order for yield. Events are
//! recorded for tests to assert against.

use core_types::ThreadId;
use std::collections::{HashMap, VecDeque};

/// A scheduling decision or transition, kept for test inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleEvent {
    Attached { thread: ThreadId, runnable: bool },
    Deferred { thread: ThreadId },
    Blocked { thread: ThreadId },
    Unblocked { thread: ThreadId },
    Resumed { thread: ThreadId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedState {
    Runnable,
    Waiting,
}

/// Run-queue bookkeeping.
pub struct Scheduler {
    run_queue: VecDeque<ThreadId>,
    threads: HashMap<ThreadId, SchedState>,
    events: Vec<ScheduleEvent>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            run_queue: VecDeque::new(),
            threads: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Registers a new thread.
    pub fn attach(&mut self, thread: ThreadId, runnable: bool) {
        if runnable {
            self.threads.insert(thread, SchedState::Runnable);
            self.run_queue.push_back(thread);
        } else {
            self.threads.insert(thread, SchedState::Waiting);
        }
        self.events.push(ScheduleEvent::Attached { thread, runnable });
    }

    /// A voluntary yield: the thread rotates to the back of the queue.
    pub fn defer(&mut self, thread: ThreadId) {
        if self.threads.get(&thread) == Some(&SchedState::Runnable) {
            self.run_queue.retain(|id| *id != thread);
            self.run_queue.push_back(thread);
        }
        self.events.push(ScheduleEvent::Deferred { thread });
    }

    /// The thread entered a wait (futex, fault, pending pairing).
    pub fn block(&mut self, thread: ThreadId) {
        self.threads.insert(thread, SchedState::Waiting);
        self.run_queue.retain(|id| *id != thread);
        self.events.push(ScheduleEvent::Blocked { thread });
    }

    /// The thread's wait was satisfied.
    pub fn unblock(&mut self, thread: ThreadId) {
        if self.threads.insert(thread, SchedState::Runnable) == Some(SchedState::Waiting) {
            self.run_queue.push_back(thread);
        }
        self.events.push(ScheduleEvent::Unblocked { thread });
    }

    /// An explicit resume of a stopped thread.
    pub fn resume(&mut self, thread: ThreadId) {
        if self.threads.insert(thread, SchedState::Runnable) != Some(SchedState::Runnable) {
            self.run_queue.push_back(thread);
        }
        self.events.push(ScheduleEvent::Resumed { thread });
    }

    /// Removes a thread entirely.
    pub fn detach(&mut self, thread: ThreadId) {
        self.threads.remove(&thread);
        self.run_queue.retain(|id| *id != thread);
    }

    /// The next thread in round-robin order.
    pub fn front(&self) -> Option<ThreadId> {
        self.run_queue.front().copied()
    }

    pub fn runnable_count(&self) -> usize {
        self.run_queue.len()
    }

    pub fn events(&self) -> &[ScheduleEvent] {
        &self.events
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&ScheduleEvent) -> bool,
    {
        self.events.iter().any(predicate)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
