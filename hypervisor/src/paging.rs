//! The module containing the building blocks shared by the page-table views:
//! the x86-64 page-table entry layout, virtual-address decomposition and the
//! page protection value.
//!
//! All references to external resources (denoted with "See:") refers to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! at <https://www.intel.com/sdm/> unless otherwise stated.

use bitfield::bitfield;
use core::ops::BitOr;

/// A view that resolves virtual addresses to physical addresses. Implemented
/// by both the OS page-table walker and the hypervisor-owned host page table
/// so that mapping routines can be fed from either.
pub trait VirtualToPhysical {
    /// Translates `address` to the physical address it maps to. The address
    /// must be mapped in the view.
    fn virtual_to_physical(&self, address: u64) -> u64;
}

bitfield! {
    /// An entry of any level of a 4-level x86-64 page table.
    ///
    /// See: 4.5 4-LEVEL PAGING AND 5-LEVEL PAGING
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Pte(u64);
    impl Debug;
    pub present, set_present: 0;
    pub write, set_write: 1;
    pub user, set_user: 2;
    pub write_through, set_write_through: 3;
    pub cache_disable, set_cache_disable: 4;
    pub accessed, set_accessed: 5;
    pub dirty, set_dirty: 6;
    // The large bit at a PDPTE maps 1GB, at a PDE 2MB.
    pub large, set_large: 7;
    pub global, set_global: 8;
    pub u64, page_number, set_page_number: 51, 12;
    pub execute_disable, set_execute_disable: 63;
}

bitfield! {
    /// The index and offset fields of a canonical x86-64 virtual address.
    ///
    /// See: Figure 4-8. Linear-Address Translation to a 4-KByte Page using
    ///      4-Level Paging
    #[derive(Clone, Copy)]
    pub struct VirtualAddress(u64);
    impl Debug;
    // The offset within a 4KB page.
    pub u64, offset, _: 11, 0;
    // The offset within a 2MB large page.
    pub u64, large_offset, _: 20, 0;
    // The offset within a 1GB huge page.
    pub u64, huge_offset, _: 29, 0;
    // The page-table index.
    pub u64, pt_index, _: 20, 12;
    // The page-directory index.
    pub u64, pd_index, _: 29, 21;
    // The page-directory-pointer-table index.
    pub u64, pdpt_index, _: 38, 30;
    // The PML4 index.
    pub u64, pml4_index, _: 47, 39;
}

/// The three-bit protection of a leaf mapping. `write` sets the writable
/// bit, absence of `execute` sets the execute-disable bit; read is implied
/// by presence.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Protection(u8);

impl Protection {
    /// The page may be read.
    pub const READ: Self = Self(1);

    /// The page may be written.
    pub const WRITE: Self = Self(1 << 1);

    /// The page may be executed.
    pub const EXECUTE: Self = Self(1 << 2);

    /// Returns true if every right of `other` is included in `self`.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for Protection {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{Pte, Protection, VirtualAddress};

    #[test]
    fn virtual_address_decomposition() {
        // 0xffff_8000_1234_5678: pml4 256, pdpt 0, pd 145, pt 69, offset 0x678.
        let address = VirtualAddress(0xffff_8000_1234_5678);
        assert_eq!(address.pml4_index(), 256);
        assert_eq!(address.pdpt_index(), 0);
        assert_eq!(address.pd_index(), 0x1234_5678 >> 21);
        assert_eq!(address.pt_index(), (0x1234_5678 >> 12) & 0x1ff);
        assert_eq!(address.offset(), 0x678);
        assert_eq!(address.large_offset(), 0x1234_5678 & 0x1f_ffff);
        assert_eq!(address.huge_offset(), 0x1234_5678 & 0x3fff_ffff);
    }

    #[test]
    fn pte_bits_round_trip() {
        let mut pte = Pte(0);
        pte.set_present(true);
        pte.set_write(true);
        pte.set_page_number(0xabcde);
        pte.set_execute_disable(true);

        assert_eq!(pte.0 & 1, 1);
        assert_eq!(pte.0 & 2, 2);
        assert_eq!((pte.0 >> 12) & 0xf_ffff_ffff, 0xabcde);
        assert_eq!(pte.0 >> 63, 1);
        assert!(!pte.large());
    }

    #[test]
    fn protection_contains() {
        let rw = Protection::READ | Protection::WRITE;
        assert!(rw.contains(Protection::WRITE));
        assert!(!rw.contains(Protection::EXECUTE));
        let rwx = rw | Protection::EXECUTE;
        assert!(rwx.contains(Protection::EXECUTE));
    }
}
