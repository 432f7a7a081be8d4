//! Thread register sets
//!
//! A thread's executor image is introspected and mutated through four
//! register sets. The images here are architecture-neutral: the general set
//! is a fixed array of machine words, the thread set carries the two
//! thread-area base registers.

use serde::{Deserialize, Serialize};

/// Number of general-purpose registers in an executor image.
pub const GENERAL_REGISTER_COUNT: usize = 16;

/// Which register set a load/store operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterSet {
    /// Instruction and stack pointer.
    Program,
    /// General-purpose registers.
    General,
    /// Thread-area bases.
    Thread,
    /// Debug state (watchpoint).
    Debug,
}

/// Instruction and stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgramRegisters {
    pub ip: u64,
    pub sp: u64,
}

/// General-purpose register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralRegisters {
    pub words: [u64; GENERAL_REGISTER_COUNT],
}

impl Default for GeneralRegisters {
    fn default() -> Self {
        Self {
            words: [0; GENERAL_REGISTER_COUNT],
        }
    }
}

/// Thread-area base registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThreadRegisters {
    pub fs_base: u64,
    pub gs_base: u64,
}

/// Debug state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugRegisters {
    /// Address watched for writes; zero disarms.
    pub watch: u64,
}

/// A register image for one set, used by load/store-registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterImage {
    Program(ProgramRegisters),
    General(GeneralRegisters),
    Thread(ThreadRegisters),
    Debug(DebugRegisters),
}

impl RegisterImage {
    /// The set this image belongs to.
    pub fn set(&self) -> RegisterSet {
        match self {
            RegisterImage::Program(_) => RegisterSet::Program,
            RegisterImage::General(_) => RegisterSet::General,
            RegisterImage::Thread(_) => RegisterSet::Thread,
            RegisterImage::Debug(_) => RegisterSet::Debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_set_tags() {
        assert_eq!(
            RegisterImage::Program(ProgramRegisters::default()).set(),
            RegisterSet::Program
        );
        assert_eq!(
            RegisterImage::General(GeneralRegisters::default()).set(),
            RegisterSet::General
        );
        assert_eq!(
            RegisterImage::Thread(ThreadRegisters::default()).set(),
            RegisterSet::Thread
        );
        assert_eq!(
            RegisterImage::Debug(DebugRegisters::default()).set(),
            RegisterSet::Debug
        );
    }

    #[test]
    fn test_general_default_is_zeroed() {
        let general = GeneralRegisters::default();
        assert!(general.words.iter().all(|&word| word == 0));
    }
}
