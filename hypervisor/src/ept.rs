//! The module containing the [`Ept`] type: the extended page tables that
//! identity-map guest physical memory and hide the hypervisor module.
//!
//! The hierarchy is fully preallocated: one EPML4 (a single entry covering
//! 512GB), one EPDPT, 512 page directories of 2MB large-page entries, and a
//! pool of page tables consumed when a 2MB entry covering a module page has
//! to be demoted to 4KB granularity.
//!
//! See: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)

use crate::config::EPT_TABLE_COUNT;
use crate::error::LaunchError;
use crate::mtrr::Mtrr;
use crate::paging::VirtualToPhysical;
use crate::small_map::SmallMap;
use bitfield::bitfield;
use x86::current::paging::BASE_PAGE_SHIFT;

/// The number of entries in one EPT structure.
const ENTRY_COUNT: usize = 512;

bitfield! {
    /// An entry of any level of the extended page tables.
    ///
    /// See: Table 29-6. Format of an EPT Page-Table Entry that Maps a
    ///      4-KByte Page
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Epte(u64);
    impl Debug;
    pub read, set_read: 0;
    pub write, set_write: 1;
    pub execute, set_execute: 2;
    // Meaningful in leaf entries only.
    pub u8, memory_type, set_memory_type: 5, 3;
    // At a PDE, maps a 2MB page.
    pub large, set_large: 7;
    pub accessed, set_accessed: 8;
    // User-mode execute when mode-based execute control is enabled.
    pub execute_user, set_execute_user: 10;
    pub u64, page_number, set_page_number: 51, 12;
    pub u64, large_page_number, set_large_page_number: 51, 21;
}

bitfield! {
    /// The EPT pointer, ie, the VMCS field locating the EPML4.
    ///
    /// See: 25.6.11 Extended-Page-Table Pointer (EPTP)
    #[derive(Clone, Copy)]
    pub struct EptPointer(u64);
    impl Debug;
    pub u8, memory_type, set_memory_type: 2, 0;
    // The page-walk length, minus one.
    pub u8, walk_length_minus_one, set_walk_length_minus_one: 5, 3;
    pub u64, page_number, set_page_number: 51, 12;
}

/// The preallocated extended page table hierarchy.
#[repr(C, align(4096))]
pub struct Ept {
    /// The EPT PML4. Only the first entry, covering 512GB, is populated.
    epml4: [Epte; ENTRY_COUNT],

    /// The EPT page-directory pointer table; every entry points at one of
    /// [`Self::epds`].
    epdpt: [Epte; ENTRY_COUNT],

    /// The EPT page directories, initially all 2MB large-page entries.
    epds: [[Epte; ENTRY_COUNT]; ENTRY_COUNT],

    /// The pool of EPT page tables used to demote large pages.
    tables: [[Epte; ENTRY_COUNT]; EPT_TABLE_COUNT],

    /// How many of [`Self::tables`] have been consumed.
    used_tables: usize,
}

impl Ept {
    /// Creates an empty hierarchy.
    pub const fn new() -> Self {
        Self {
            epml4: [Epte(0); ENTRY_COUNT],
            epdpt: [Epte(0); ENTRY_COUNT],
            epds: [[Epte(0); ENTRY_COUNT]; ENTRY_COUNT],
            tables: [[Epte(0); ENTRY_COUNT]; EPT_TABLE_COUNT],
            used_tables: 0,
        }
    }

    /// The virtual address of the EPML4.
    pub fn epml4_address(&self) -> u64 {
        self.epml4.as_ptr() as u64
    }

    /// Builds the identity map of the first 512GB of guest physical memory
    /// at 2MB granularity, with memory types taken from `mtrrs` (write-back
    /// where no range matches). Structure addresses are translated to
    /// physical through `view`.
    pub fn build_identity_map(&mut self, mtrrs: &[Mtrr], view: &impl VirtualToPhysical) {
        let epdpt_physical = view.virtual_to_physical(self.epdpt.as_ptr() as u64);
        let epml4e = &mut self.epml4[0];
        epml4e.set_read(true);
        epml4e.set_write(true);
        epml4e.set_execute(true);
        epml4e.set_execute_user(true);
        epml4e.set_page_number(epdpt_physical >> BASE_PAGE_SHIFT);

        for i in 0..ENTRY_COUNT {
            let epd_physical = view.virtual_to_physical(self.epds[i].as_ptr() as u64);
            let epdpte = &mut self.epdpt[i];
            epdpte.set_read(true);
            epdpte.set_write(true);
            epdpte.set_execute(true);
            epdpte.set_execute_user(true);
            epdpte.set_page_number(epd_physical >> BASE_PAGE_SHIFT);
        }

        let mut large_page_number = 0u64;
        for epd in &mut self.epds {
            for epde in epd.iter_mut() {
                let physical_address = large_page_number << 21;
                epde.set_read(true);
                epde.set_write(true);
                epde.set_execute(true);
                epde.set_execute_user(true);
                epde.set_large(true);
                epde.set_large_page_number(large_page_number);
                epde.set_memory_type(Mtrr::lookup(mtrrs, physical_address).bits() as u8);
                large_page_number += 1;
            }
        }
    }

    /// Strips read, write, execute and user-execute from every page of the
    /// module at `[base, base + size)`, demoting the owning 2MB entries to
    /// 4KB granularity as needed.
    ///
    /// Pages are processed in ascending order, so consecutive pages sharing
    /// a 2MB region reuse the table allocated when the region was first
    /// demoted: the region's entry is no longer large on the second visit
    /// and is found again through `module_map`, which covers every module
    /// page including the pool itself.
    pub fn protect_region<const N: usize>(
        &mut self,
        base: u64,
        size: usize,
        view: &impl VirtualToPhysical,
        module_map: &SmallMap<N>,
    ) -> Result<(), LaunchError> {
        let pages = size >> BASE_PAGE_SHIFT;
        for i in 0..pages {
            let address = base + ((i as u64) << BASE_PAGE_SHIFT);
            let physical_address = view.virtual_to_physical(address);
            let epd_index = (physical_address >> 30) as usize;
            let epde_index = ((physical_address >> 21) & 0x1ff) as usize;
            let epte_index = ((physical_address >> 12) & 0x1ff) as usize;

            let epde = self.epds[epd_index][epde_index];
            if !epde.large() {
                // Already demoted; locate the table through the module map.
                let table_physical = epde.page_number() << BASE_PAGE_SHIFT;
                let Some(table_address) = module_map.find(table_physical) else {
                    debug_assert!(false, "demoted EPT table missing from module map");
                    continue;
                };
                let table_index =
                    (table_address.wrapping_sub(self.tables.as_ptr() as u64) >> BASE_PAGE_SHIFT)
                        as usize;
                Self::strip(&mut self.tables[table_index][epte_index]);
                continue;
            }

            if self.used_tables == EPT_TABLE_COUNT {
                return Err(LaunchError::OutOfEptEntries);
            }
            let table_index = self.used_tables;
            self.used_tables += 1;

            // Synthesize 512 RWX entries identity-mapping the 2MB region
            // with the memory type the large entry carried.
            let memory_type = epde.memory_type();
            let first_page = epde.large_page_number() << 9;
            for (j, entry) in self.tables[table_index].iter_mut().enumerate() {
                *entry = Epte(0);
                entry.set_read(true);
                entry.set_write(true);
                entry.set_execute(true);
                entry.set_execute_user(true);
                entry.set_page_number(first_page + j as u64);
                entry.set_memory_type(memory_type);
            }

            // Swing the large entry over to the freshly built table.
            let table_physical =
                view.virtual_to_physical(self.tables[table_index].as_ptr() as u64);
            let mut demoted = epde;
            demoted.set_large(false);
            demoted.set_memory_type(0);
            demoted.set_page_number(table_physical >> BASE_PAGE_SHIFT);
            self.epds[epd_index][epde_index] = demoted;

            Self::strip(&mut self.tables[table_index][epte_index]);
        }

        Ok(())
    }

    /// Returns a copy of the leaf entry covering the guest physical address:
    /// the 2MB entry, or the 4KB entry when the region was demoted (located
    /// through `module_map` the same way the protector does).
    pub fn leaf_entry_for<const N: usize>(
        &self,
        physical_address: u64,
        module_map: &SmallMap<N>,
    ) -> Epte {
        let epde = self.epds[(physical_address >> 30) as usize]
            [((physical_address >> 21) & 0x1ff) as usize];
        if epde.large() {
            return epde;
        }
        let table_physical = epde.page_number() << BASE_PAGE_SHIFT;
        let Some(table_address) = module_map.find(table_physical) else {
            return epde;
        };
        let table_index = (table_address.wrapping_sub(self.tables.as_ptr() as u64)
            >> BASE_PAGE_SHIFT) as usize;
        self.tables[table_index][((physical_address >> 12) & 0x1ff) as usize]
    }

    /// Clears all access rights of an entry, leaving the translation and
    /// memory type in place.
    fn strip(entry: &mut Epte) {
        entry.set_read(false);
        entry.set_write(false);
        entry.set_execute(false);
        entry.set_execute_user(false);
    }
}

impl Default for Ept {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Ept {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ept")
            .field("epml4", &self.epml4_address())
            .field("used_tables", &self.used_tables)
            .finish_non_exhaustive()
    }
}
