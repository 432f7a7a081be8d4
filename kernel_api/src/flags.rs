//! Numeric flag words and their validated, typed forms
//!
//! Syscalls accept raw `u32` flag words; the kernel parses them into the
//! typed settings structs here before any side effect. Parsing rejects
//! unknown bits and ill-formed combinations with *illegal-args*.

use core_types::{ForkPolicy, KernelError, KernelResult, Protection, VirtAddr};
use serde::{Deserialize, Serialize};

// Mapping flags.
pub const MAP_READ_ONLY: u32 = 1 << 0;
pub const MAP_READ_WRITE: u32 = 1 << 1;
pub const MAP_READ_EXECUTE: u32 = 1 << 2;
pub const MAP_DROP_AT_FORK: u32 = 1 << 3;
pub const MAP_SHARE_AT_FORK: u32 = 1 << 4;
pub const MAP_COPY_ON_WRITE_AT_FORK: u32 = 1 << 5;
pub const MAP_DONT_REQUIRE_BACKING: u32 = 1 << 6;

const MAP_PROTECTION_MASK: u32 = MAP_READ_ONLY | MAP_READ_WRITE | MAP_READ_EXECUTE;
const MAP_FORK_MASK: u32 = MAP_DROP_AT_FORK | MAP_SHARE_AT_FORK | MAP_COPY_ON_WRITE_AT_FORK;
const MAP_ALL: u32 = MAP_PROTECTION_MASK | MAP_FORK_MASK | MAP_DONT_REQUIRE_BACKING;

// Memory allocation flags.
pub const ALLOCATE_CONTINUOUS: u32 = 1 << 0;
pub const ALLOCATE_ON_DEMAND: u32 = 1 << 1;

const ALLOCATE_ALL: u32 = ALLOCATE_CONTINUOUS | ALLOCATE_ON_DEMAND;

// Thread creation flags.
pub const THREAD_EXCLUSIVE: u32 = 1 << 0;
pub const THREAD_TRAPS_FATAL: u32 = 1 << 1;
pub const THREAD_START_STOPPED: u32 = 1 << 2;

const THREAD_ALL: u32 = THREAD_EXCLUSIVE | THREAD_TRAPS_FATAL | THREAD_START_STOPPED;

/// Where a new mapping is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Map exactly at the given page-aligned address.
    Fixed(VirtAddr),
    /// Let the kernel choose the highest free range.
    PreferTop,
}

/// Validated mapping settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSettings {
    pub protection: Protection,
    pub fork_policy: ForkPolicy,
    pub placement: Placement,
    pub dont_require_backing: bool,
}

impl MapSettings {
    /// Parses a raw flag word plus placement hint.
    ///
    /// Exactly one protection bit must be set. At most one fork-policy bit
    /// may be set; the default policy is copy-on-write. A non-null hint
    /// selects fixed placement and must be page-aligned.
    pub fn parse(flags: u32, hint: Option<VirtAddr>) -> KernelResult<MapSettings> {
        if flags & !MAP_ALL != 0 {
            return Err(KernelError::IllegalArgs);
        }

        let protection = match flags & MAP_PROTECTION_MASK {
            MAP_READ_ONLY => Protection::ReadOnly,
            MAP_READ_WRITE => Protection::ReadWrite,
            MAP_READ_EXECUTE => Protection::ReadExecute,
            _ => return Err(KernelError::IllegalArgs),
        };

        let fork_policy = match flags & MAP_FORK_MASK {
            0 | MAP_COPY_ON_WRITE_AT_FORK => ForkPolicy::CopyOnWrite,
            MAP_DROP_AT_FORK => ForkPolicy::Drop,
            MAP_SHARE_AT_FORK => ForkPolicy::Share,
            _ => return Err(KernelError::IllegalArgs),
        };

        let placement = match hint {
            Some(addr) => {
                if !addr.is_aligned() {
                    return Err(KernelError::IllegalArgs);
                }
                Placement::Fixed(addr)
            }
            None => Placement::PreferTop,
        };

        Ok(MapSettings {
            protection,
            fork_policy,
            placement,
            dont_require_backing: flags & MAP_DONT_REQUIRE_BACKING != 0,
        })
    }
}

/// Validated allocation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateSettings {
    pub continuous: bool,
    pub on_demand: bool,
}

impl AllocateSettings {
    pub fn parse(flags: u32) -> KernelResult<AllocateSettings> {
        if flags & !ALLOCATE_ALL != 0 {
            return Err(KernelError::IllegalArgs);
        }
        let continuous = flags & ALLOCATE_CONTINUOUS != 0;
        let on_demand = flags & ALLOCATE_ON_DEMAND != 0;
        if continuous && on_demand {
            return Err(KernelError::IllegalArgs);
        }
        Ok(AllocateSettings {
            continuous,
            on_demand,
        })
    }
}

/// Validated thread-creation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSettings {
    pub exclusive: bool,
    pub traps_fatal: bool,
    pub start_stopped: bool,
}

impl ThreadSettings {
    pub fn parse(flags: u32) -> KernelResult<ThreadSettings> {
        if flags & !THREAD_ALL != 0 {
            return Err(KernelError::IllegalArgs);
        }
        Ok(ThreadSettings {
            exclusive: flags & THREAD_EXCLUSIVE != 0,
            traps_fatal: flags & THREAD_TRAPS_FATAL != 0,
            start_stopped: flags & THREAD_START_STOPPED != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::PAGE_SIZE;

    #[test]
    fn test_map_requires_exactly_one_protection() {
        assert!(MapSettings::parse(0, None).is_err());
        assert!(MapSettings::parse(MAP_READ_ONLY | MAP_READ_WRITE, None).is_err());
        let settings = MapSettings::parse(MAP_READ_WRITE, None).unwrap();
        assert_eq!(settings.protection, Protection::ReadWrite);
    }

    #[test]
    fn test_map_fork_policy_default_is_copy_on_write() {
        let settings = MapSettings::parse(MAP_READ_ONLY, None).unwrap();
        assert_eq!(settings.fork_policy, ForkPolicy::CopyOnWrite);

        let settings = MapSettings::parse(MAP_READ_ONLY | MAP_SHARE_AT_FORK, None).unwrap();
        assert_eq!(settings.fork_policy, ForkPolicy::Share);

        assert!(
            MapSettings::parse(MAP_READ_ONLY | MAP_SHARE_AT_FORK | MAP_DROP_AT_FORK, None).is_err()
        );
    }

    #[test]
    fn test_map_placement() {
        let settings = MapSettings::parse(MAP_READ_ONLY, None).unwrap();
        assert_eq!(settings.placement, Placement::PreferTop);

        let hint = VirtAddr::new(PAGE_SIZE * 8);
        let settings = MapSettings::parse(MAP_READ_ONLY, Some(hint)).unwrap();
        assert_eq!(settings.placement, Placement::Fixed(hint));

        assert!(MapSettings::parse(MAP_READ_ONLY, Some(VirtAddr::new(123))).is_err());
    }

    #[test]
    fn test_map_rejects_unknown_bits() {
        assert!(MapSettings::parse(MAP_READ_ONLY | 1 << 20, None).is_err());
    }

    #[test]
    fn test_allocate_flags() {
        let settings = AllocateSettings::parse(ALLOCATE_CONTINUOUS).unwrap();
        assert!(settings.continuous);
        assert!(!settings.on_demand);
        assert!(AllocateSettings::parse(ALLOCATE_CONTINUOUS | ALLOCATE_ON_DEMAND).is_err());
        assert!(AllocateSettings::parse(1 << 9).is_err());
    }

    #[test]
    fn test_thread_flags() {
        let settings =
            ThreadSettings::parse(THREAD_EXCLUSIVE | THREAD_START_STOPPED).unwrap();
        assert!(settings.exclusive);
        assert!(!settings.traps_fatal);
        assert!(settings.start_stopped);
        assert!(ThreadSettings::parse(1 << 7).is_err());
    }
}
