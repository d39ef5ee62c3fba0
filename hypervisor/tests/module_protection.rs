//! Cross-module test of the memory setup a launch performs on CPU 0: build
//! the host page table over a synthetic module region, record the module's
//! physical-to-virtual mapping, build the EPT identity map and hide the
//! module, then check the resulting mappings page by page.
//!
//! Physical addresses are simulated by offsetting into a small window so
//! the EPT indexing stays within bounds; everything else runs the real
//! code paths.

use lhv::ept::Ept;
use lhv::host_page_table::HostPageTable;
use lhv::mtrr::{MemoryType, Mtrr};
use lhv::paging::{Protection, VirtualToPhysical};
use lhv::small_map::SmallMap;

/// The "physical" address the synthetic module region starts at. 2MB
/// aligned, like a real load address need not be page-table friendly.
const MODULE_PHYSICAL_BASE: u64 = 0x40_0000;

const PAGE_SIZE: u64 = 0x1000;

/// Everything a launch touches, in one contiguous allocation standing in
/// for the module image: the host page table, the EPT hierarchy (whose
/// demotion pool must be inside the module for the protector to find it),
/// and some trailing payload so the module does not end on a 2MB boundary.
#[repr(C)]
struct Arena {
    host_page_table: HostPageTable,
    ept: Ept,
    payload: [u8; 0x8000],
}

/// Translates arena-virtual addresses to the simulated physical window.
struct OffsetView {
    arena_base: u64,
}

impl VirtualToPhysical for OffsetView {
    fn virtual_to_physical(&self, address: u64) -> u64 {
        address - self.arena_base + MODULE_PHYSICAL_BASE
    }
}

struct Setup {
    arena: Box<Arena>,
    map: Box<SmallMap<16384>>,
    module_base: u64,
    module_size: usize,
}

fn build_and_protect() -> Setup {
    let mut arena = unsafe { Box::<Arena>::new_zeroed().assume_init() };
    let module_base = &*arena as *const Arena as u64;
    let module_size = core::mem::size_of::<Arena>();
    assert_eq!(module_size % PAGE_SIZE as usize, 0);
    // The interesting boundary case: the module ends inside a 2MB region.
    assert_ne!(module_size % 0x20_0000, 0);

    let os_view = OffsetView {
        arena_base: module_base,
    };

    // CPU 0 order: self-map, module map, physical-to-virtual map, EPT
    // identity map, module protection.
    arena.host_page_table.map_self(&os_view);
    arena.host_page_table.map_from(
        module_base,
        module_size,
        Protection::READ | Protection::WRITE | Protection::EXECUTE,
        &os_view,
    );

    let mut map = Box::new(SmallMap::<16384>::new());
    for i in 0..(module_size as u64 / PAGE_SIZE) {
        let address = module_base + i * PAGE_SIZE;
        map.insert(arena.host_page_table.virtual_to_physical(address), address);
    }

    let mtrrs = [Mtrr::empty(); 8];
    arena.ept.build_identity_map(&mtrrs, &arena.host_page_table);
    arena
        .ept
        .protect_region(module_base, module_size, &arena.host_page_table, &map)
        .expect("the module spans few enough 2MB regions for the pool");

    Setup {
        arena,
        map,
        module_base,
        module_size,
    }
}

#[test]
fn every_module_page_is_host_mapped_rwx_and_guest_inaccessible() {
    let setup = build_and_protect();
    let arena = &setup.arena;

    for i in 0..(setup.module_size as u64 / PAGE_SIZE) {
        let address = setup.module_base + i * PAGE_SIZE;
        let physical = MODULE_PHYSICAL_BASE + i * PAGE_SIZE;

        // The host page table maps the page onto its frame with RWX.
        assert_eq!(arena.host_page_table.virtual_to_physical(address), physical);
        let host_entry = arena.host_page_table.leaf_entry(address);
        assert!(host_entry.present(), "page {i} present");
        assert!(host_entry.write(), "page {i} writable");
        assert!(!host_entry.execute_disable(), "page {i} executable");

        // The EPT entry for the frame denies every kind of access but
        // keeps the identity translation.
        let ept_entry = arena.ept.leaf_entry_for(physical, &setup.map);
        assert!(!ept_entry.large());
        assert!(
            !ept_entry.read()
                && !ept_entry.write()
                && !ept_entry.execute()
                && !ept_entry.execute_user(),
            "page {i} must be inaccessible to the guest"
        );
        assert_eq!(ept_entry.page_number(), physical >> 12);
    }
}

#[test]
fn guest_memory_outside_the_module_stays_accessible() {
    let setup = build_and_protect();
    let arena = &setup.arena;

    // A region the module never touched is still one large RWX write-back
    // mapping.
    let untouched = arena.ept.leaf_entry_for(0x4000_0000, &setup.map);
    assert!(untouched.large());
    assert!(untouched.read() && untouched.write() && untouched.execute());
    assert!(untouched.execute_user());
    assert_eq!(
        u64::from(untouched.memory_type()),
        MemoryType::WriteBack.bits()
    );
    assert_eq!(untouched.large_page_number(), 0x4000_0000 >> 21);

    // The 2MB region the module ends in was demoted; the frames past the
    // module keep full access at 4KB granularity with the original memory
    // type and translation.
    let tail_physical = MODULE_PHYSICAL_BASE + setup.module_size as u64;
    let tail = arena.ept.leaf_entry_for(tail_physical, &setup.map);
    assert!(!tail.large());
    assert!(tail.read() && tail.write() && tail.execute() && tail.execute_user());
    assert_eq!(u64::from(tail.memory_type()), MemoryType::WriteBack.bits());
    assert_eq!(tail.page_number(), tail_physical >> 12);

    // The page right below the module, in the region before the module
    // start, is untouched as well.
    let below = arena.ept.leaf_entry_for(MODULE_PHYSICAL_BASE - 0x20_0000, &setup.map);
    assert!(below.large());
    assert!(below.read());
}
