//! Thread observations and descriptor tags

use serde::{Deserialize, Serialize};
use std::fmt;

/// User-visible classification of why a thread was interrupted.
///
/// The kernel maps its internal interrupt reasons to exactly these tags when
/// completing an observe submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Observation {
    /// The thread was stopped.
    Stop,
    /// The thread panicked.
    Panic,
    /// The thread hit a breakpoint.
    Breakpoint,
    /// The thread faulted on a memory access.
    PageFault,
    /// The thread issued supercall `n`.
    SuperCall(u32),
}

const OBSERVE_STOP: u32 = 1;
const OBSERVE_PANIC: u32 = 2;
const OBSERVE_BREAKPOINT: u32 = 3;
const OBSERVE_PAGE_FAULT: u32 = 4;
const OBSERVE_SUPER_CALL: u32 = 0x8000_0000;

impl Observation {
    /// Encodes the observation for a completion record.
    pub fn encode(&self) -> u32 {
        match self {
            Observation::Stop => OBSERVE_STOP,
            Observation::Panic => OBSERVE_PANIC,
            Observation::Breakpoint => OBSERVE_BREAKPOINT,
            Observation::PageFault => OBSERVE_PAGE_FAULT,
            Observation::SuperCall(n) => OBSERVE_SUPER_CALL + n,
        }
    }

    /// Decodes a record's observation field.
    pub fn decode(value: u32) -> Option<Observation> {
        match value {
            OBSERVE_STOP => Some(Observation::Stop),
            OBSERVE_PANIC => Some(Observation::Panic),
            OBSERVE_BREAKPOINT => Some(Observation::Breakpoint),
            OBSERVE_PAGE_FAULT => Some(Observation::PageFault),
            value if value >= OBSERVE_SUPER_CALL => {
                Some(Observation::SuperCall(value - OBSERVE_SUPER_CALL))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observation::Stop => write!(f, "stop"),
            Observation::Panic => write!(f, "panic"),
            Observation::Breakpoint => write!(f, "breakpoint"),
            Observation::PageFault => write!(f, "page-fault"),
            Observation::SuperCall(n) => write!(f, "supercall+{}", n),
        }
    }
}

/// Variant tag of a descriptor, as reported by descriptor-info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorTag {
    Universe,
    Memory,
    Space,
    Thread,
    Lane,
    Irq,
    Io,
}

impl fmt::Display for DescriptorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DescriptorTag::Universe => "universe",
            DescriptorTag::Memory => "memory",
            DescriptorTag::Space => "space",
            DescriptorTag::Thread => "thread",
            DescriptorTag::Lane => "lane",
            DescriptorTag::Irq => "irq",
            DescriptorTag::Io => "io",
        };
        write!(f, "{}", name)
    }
}
