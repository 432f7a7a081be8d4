//! Addresses, pages, and mapping attributes
//!
//! ## Design Notes
//!
//! - Virtual and physical addresses are distinct newtypes; mixing them is a
//!   compile error.
//! - All memory-object and mapping sizes are in bytes and must be
//!   page-aligned at the syscall boundary.
//! - Protection is exactly one of read-only, read-write, read-execute; the
//!   fork policy of a region is chosen at map time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Page size in bytes. The whole kernel assumes a single page size.
pub const PAGE_SIZE: u64 = 4096;

/// Returns true if the value is a multiple of the page size.
pub fn is_page_aligned(value: u64) -> bool {
    value % PAGE_SIZE == 0
}

/// Number of pages covering `length` bytes (which must be page-aligned).
pub fn page_count(length: u64) -> u64 {
    length / PAGE_SIZE
}

/// A virtual address within some address space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct VirtAddr(u64);

impl VirtAddr {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Rounds down to the containing page boundary.
    pub fn page_base(&self) -> VirtAddr {
        VirtAddr(self.0 - self.0 % PAGE_SIZE)
    }

    /// Offset within the containing page.
    pub fn page_offset(&self) -> u64 {
        self.0 % PAGE_SIZE
    }

    pub fn is_aligned(&self) -> bool {
        is_page_aligned(self.0)
    }

    pub fn checked_add(&self, offset: u64) -> Option<VirtAddr> {
        self.0.checked_add(offset).map(VirtAddr)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v:{:#x}", self.0)
    }
}

/// A physical address in the frame pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub fn page_base(&self) -> PhysAddr {
        PhysAddr(self.0 - self.0 % PAGE_SIZE)
    }

    pub fn page_offset(&self) -> u64 {
        self.0 % PAGE_SIZE
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p:{:#x}", self.0)
    }
}

/// Mapping protection; exactly one variant per region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
    ReadExecute,
}

impl Protection {
    pub fn allows(&self, access: AccessType) -> bool {
        match access {
            AccessType::Read => true,
            AccessType::Write => matches!(self, Protection::ReadWrite),
            AccessType::Execute => matches!(self, Protection::ReadExecute),
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protection::ReadOnly => write!(f, "r--"),
            Protection::ReadWrite => write!(f, "rw-"),
            Protection::ReadExecute => write!(f, "r-x"),
        }
    }
}

/// What happens to a mapped region when its address space is forked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForkPolicy {
    /// The region does not exist in the child.
    Drop,
    /// Parent and child share the same memory object.
    Share,
    /// Both sides keep a snapshot view; the first write to a page copies it.
    CopyOnWrite,
}

impl fmt::Display for ForkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkPolicy::Drop => write!(f, "drop"),
            ForkPolicy::Share => write!(f, "share"),
            ForkPolicy::CopyOnWrite => write!(f, "copy-on-write"),
        }
    }
}

/// Kind of memory access being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Read => write!(f, "read"),
            AccessType::Write => write!(f, "write"),
            AccessType::Execute => write!(f, "execute"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(PAGE_SIZE * 3));
        assert!(!is_page_aligned(PAGE_SIZE + 1));
    }

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(0), 0);
        assert_eq!(page_count(PAGE_SIZE * 5), 5);
    }

    #[test]
    fn test_virt_addr_page_math() {
        let addr = VirtAddr::new(PAGE_SIZE * 2 + 17);
        assert_eq!(addr.page_base(), VirtAddr::new(PAGE_SIZE * 2));
        assert_eq!(addr.page_offset(), 17);
        assert!(!addr.is_aligned());
        assert!(addr.page_base().is_aligned());
    }

    #[test]
    fn test_protection_allows() {
        assert!(Protection::ReadOnly.allows(AccessType::Read));
        assert!(!Protection::ReadOnly.allows(AccessType::Write));
        assert!(Protection::ReadWrite.allows(AccessType::Write));
        assert!(!Protection::ReadWrite.allows(AccessType::Execute));
        assert!(Protection::ReadExecute.allows(AccessType::Execute));
    }

    #[test]
    fn test_display() {
        assert_eq!(Protection::ReadWrite.to_string(), "rw-");
        assert_eq!(ForkPolicy::CopyOnWrite.to_string(), "copy-on-write");
        assert_eq!(VirtAddr::new(0x1000).to_string(), "v:0x1000");
    }
}
