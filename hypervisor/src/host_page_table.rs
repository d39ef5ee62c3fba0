//! The module containing the [`HostPageTable`] type, the self-contained
//! 4-level page table the hypervisor host runs on after the CR3 switch.
//!
//! The table owns all of its levels as plain arrays: one PML4, one PDPT, two
//! page directories and a full page-table fan-out for each directory. That
//! covers 2GB of host virtual address space, split between the table's own
//! self-map and the mapped module. Cross-level references hold physical
//! frame numbers only; the bootstrap self-map resolves them through an OS
//! view, after which the table can resolve them through itself.

use crate::paging::{Protection, Pte, VirtualAddress, VirtualToPhysical};
use core::mem::size_of;
use x86::current::paging::BASE_PAGE_SHIFT;

/// The number of entries in one table page.
const ENTRY_COUNT: usize = 512;

/// The number of page directories (and page-table fan-outs) the table owns.
const PD_COUNT: usize = 2;

/// The physical addresses of the intermediate tables used for one mapping.
#[derive(Clone, Copy)]
struct TableFrames {
    pdpt: u64,
    pd: u64,
    pt: u64,
}

/// The hypervisor-owned page table.
#[derive(Debug)]
#[repr(C, align(4096))]
pub struct HostPageTable {
    /// The page-map level 4. Entirely routed to the single [`Self::pdpt`].
    pml4: [Pte; ENTRY_COUNT],

    /// The page-directory pointer table. Partitioned so that each half
    /// routes to one of the two page directories.
    pdpt: [Pte; ENTRY_COUNT],

    /// The page directories.
    pds: [[Pte; ENTRY_COUNT]; PD_COUNT],

    /// One page table per page-directory entry, per page directory.
    pts: [[[Pte; ENTRY_COUNT]; ENTRY_COUNT]; PD_COUNT],
}

impl HostPageTable {
    /// Creates a table with no mappings.
    pub const fn new() -> Self {
        Self {
            pml4: [Pte(0); ENTRY_COUNT],
            pdpt: [Pte(0); ENTRY_COUNT],
            pds: [[Pte(0); ENTRY_COUNT]; PD_COUNT],
            pts: [[[Pte(0); ENTRY_COUNT]; ENTRY_COUNT]; PD_COUNT],
        }
    }

    /// The virtual address of the PML4, ie, the value to place into CR3
    /// (after translating to physical).
    pub fn pml4_address(&self) -> u64 {
        self.pml4.as_ptr() as u64
    }

    /// Which page directory serves the given PDPT index.
    fn pd_index(pdpt_index: u64) -> usize {
        (pdpt_index as usize) / (ENTRY_COUNT / PD_COUNT)
    }

    /// Resolves the physical addresses of the intermediate tables serving
    /// `address` through `view`.
    fn table_frames(&self, address: u64, view: &impl VirtualToPhysical) -> TableFrames {
        let address = VirtualAddress(address);
        let pd_index = Self::pd_index(address.pdpt_index());
        TableFrames {
            pdpt: view.virtual_to_physical(self.pdpt.as_ptr() as u64),
            pd: view.virtual_to_physical(self.pds[pd_index].as_ptr() as u64),
            pt: view
                .virtual_to_physical(self.pts[pd_index][address.pd_index() as usize].as_ptr() as u64),
        }
    }

    /// Writes the four entries that make `address` translate to
    /// `physical_address` with `protection`. Intermediate entries are made
    /// present and writable; the leaf carries the protection bits.
    fn install(
        &mut self,
        address: u64,
        physical_address: u64,
        protection: Protection,
        frames: TableFrames,
    ) {
        let address = VirtualAddress(address);
        let pd_index = Self::pd_index(address.pdpt_index());

        let pml4e = &mut self.pml4[address.pml4_index() as usize];
        pml4e.set_page_number(frames.pdpt >> BASE_PAGE_SHIFT);
        pml4e.set_write(true);
        pml4e.set_present(true);

        let pdpte = &mut self.pdpt[address.pdpt_index() as usize];
        pdpte.set_page_number(frames.pd >> BASE_PAGE_SHIFT);
        pdpte.set_write(true);
        pdpte.set_present(true);

        let pde = &mut self.pds[pd_index][address.pd_index() as usize];
        pde.set_page_number(frames.pt >> BASE_PAGE_SHIFT);
        pde.set_write(true);
        pde.set_present(true);

        let pte = &mut self.pts[pd_index][address.pd_index() as usize][address.pt_index() as usize];
        pte.set_page_number(physical_address >> BASE_PAGE_SHIFT);
        pte.set_write(protection.contains(Protection::WRITE));
        pte.set_execute_disable(!protection.contains(Protection::EXECUTE));
        pte.set_present(true);
    }

    /// Installs a 4KB mapping, resolving the table frames through the table
    /// itself. The self-map must already be in place.
    pub fn map_page(&mut self, address: u64, physical_address: u64, protection: Protection) {
        let frames = self.table_frames(address, &*self);
        self.install(address, physical_address, protection, frames);
    }

    /// Installs a 4KB mapping, resolving the table frames through `view`.
    /// Used while the table cannot yet translate its own structures.
    fn map_page_from(
        &mut self,
        address: u64,
        physical_address: u64,
        protection: Protection,
        view: &impl VirtualToPhysical,
    ) {
        let frames = self.table_frames(address, view);
        self.install(address, physical_address, protection, frames);
    }

    /// Maps `size` bytes (rounded up to whole pages) starting at `base`,
    /// resolving each page's physical address through `view`. Overlapping
    /// calls are permitted; the later call wins.
    pub fn map_from(
        &mut self,
        base: u64,
        size: usize,
        protection: Protection,
        view: &impl VirtualToPhysical,
    ) {
        let pages = (size + 0xfff) >> BASE_PAGE_SHIFT;
        for i in 0..pages {
            let address = base + (i << BASE_PAGE_SHIFT) as u64;
            let physical_address = view.virtual_to_physical(address);
            self.map_page(address, physical_address, protection);
        }
    }

    /// Maps the table's own four levels into itself, bootstrapping through
    /// `view`. This must precede any [`Self::map_page`]/[`Self::map_from`]
    /// call, which walk the table itself to locate its structures.
    pub fn map_self(&mut self, view: &impl VirtualToPhysical) {
        let ranges = [
            (self.pml4.as_ptr() as u64, size_of::<[Pte; ENTRY_COUNT]>()),
            (self.pdpt.as_ptr() as u64, size_of::<[Pte; ENTRY_COUNT]>()),
            (
                self.pds.as_ptr() as u64,
                size_of::<[[Pte; ENTRY_COUNT]; PD_COUNT]>(),
            ),
            (
                self.pts.as_ptr() as u64,
                size_of::<[[[Pte; ENTRY_COUNT]; ENTRY_COUNT]; PD_COUNT]>(),
            ),
        ];
        for (base, size) in ranges {
            let pages = size >> BASE_PAGE_SHIFT;
            for i in 0..pages {
                let address = base + (i << BASE_PAGE_SHIFT) as u64;
                let physical_address = view.virtual_to_physical(address);
                self.map_page_from(
                    address,
                    physical_address,
                    Protection::READ | Protection::WRITE,
                    view,
                );
            }
        }
    }

    /// Returns a copy of the leaf entry translating `address`. For a large
    /// mapping this is the PDPTE or PDE itself.
    pub fn leaf_entry(&self, address: u64) -> Pte {
        let address = VirtualAddress(address);
        let pdpte = self.pdpt[address.pdpt_index() as usize];
        if pdpte.large() {
            return pdpte;
        }
        let pd_index = Self::pd_index(address.pdpt_index());
        let pde = self.pds[pd_index][address.pd_index() as usize];
        if pde.large() {
            return pde;
        }
        self.pts[pd_index][address.pd_index() as usize][address.pt_index() as usize]
    }
}

impl VirtualToPhysical for HostPageTable {
    /// Walks the owned structures directly. The address must have been
    /// mapped; there is no present check on this internal-only path.
    fn virtual_to_physical(&self, address: u64) -> u64 {
        let address = VirtualAddress(address);

        let pdpte = self.pdpt[address.pdpt_index() as usize];
        if pdpte.large() {
            return (pdpte.page_number() << BASE_PAGE_SHIFT) + address.huge_offset();
        }

        let pd_index = Self::pd_index(address.pdpt_index());
        let pde = self.pds[pd_index][address.pd_index() as usize];
        if pde.large() {
            return (pde.page_number() << BASE_PAGE_SHIFT) + address.large_offset();
        }

        let pte = self.pts[pd_index][address.pd_index() as usize][address.pt_index() as usize];
        (pte.page_number() << BASE_PAGE_SHIFT) + address.offset()
    }
}

impl Default for HostPageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::HostPageTable;
    use crate::paging::{Protection, VirtualToPhysical};

    /// A view that pretends physical == virtual.
    struct IdentityView;

    impl VirtualToPhysical for IdentityView {
        fn virtual_to_physical(&self, address: u64) -> u64 {
            address
        }
    }

    fn boxed_table() -> Box<HostPageTable> {
        // The table is a few megabytes; keep it off the test thread stack.
        unsafe { Box::<HostPageTable>::new_zeroed().assume_init() }
    }

    #[test]
    fn self_map_makes_the_table_self_translating() {
        let mut table = boxed_table();
        table.map_self(&IdentityView);

        for address in [
            table.pml4_address(),
            table.pml4_address() + 0x1000,
            table.pml4_address() + 0x4000,
        ] {
            assert_eq!(table.virtual_to_physical(address), address);
        }
    }

    #[test]
    fn translation_is_a_left_inverse_of_map_page() {
        let mut table = boxed_table();
        table.map_self(&IdentityView);

        let address = table.pml4_address() + 0x20_0000;
        table.map_page(address, 0x7654_3000, Protection::READ | Protection::EXECUTE);

        assert_eq!(table.virtual_to_physical(address), 0x7654_3000);
        assert_eq!(table.virtual_to_physical(address + 0x123), 0x7654_3123);
    }

    #[test]
    fn leaf_entry_reflects_the_requested_protection() {
        let mut table = boxed_table();
        table.map_self(&IdentityView);
        let base = table.pml4_address();

        table.map_page(base + 0x40_0000, 0x1000, Protection::READ);
        let read_only = table.leaf_entry(base + 0x40_0000);
        assert!(read_only.present());
        assert!(!read_only.write());
        assert!(read_only.execute_disable());

        table.map_page(
            base + 0x41_0000,
            0x2000,
            Protection::READ | Protection::WRITE | Protection::EXECUTE,
        );
        let rwx = table.leaf_entry(base + 0x41_0000);
        assert!(rwx.present());
        assert!(rwx.write());
        assert!(!rwx.execute_disable());
    }

    #[test]
    fn map_from_rounds_up_and_later_calls_win() {
        let mut table = boxed_table();
        table.map_self(&IdentityView);
        let base = table.pml4_address() + 0x50_0000;

        // 0x1800 bytes must produce two page mappings.
        table.map_from(base, 0x1800, Protection::READ, &IdentityView);
        assert_eq!(table.virtual_to_physical(base + 0x1000), base + 0x1000);
        assert!(table.leaf_entry(base).execute_disable());

        // Remapping the same range flips the protection.
        table.map_from(
            base,
            0x1800,
            Protection::READ | Protection::EXECUTE,
            &IdentityView,
        );
        assert!(!table.leaf_entry(base).execute_disable());
        assert!(!table.leaf_entry(base + 0x1000).execute_disable());
    }
}
