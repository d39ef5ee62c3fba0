//! The module containing the MTRR (memory type range register) reader.
//!
//! EPT entries carry a memory type, and synthesizing them without honoring
//! the MTRRs would change the cacheability the OS relies on (eg, turn
//! uncacheable device memory into write-back). The hypervisor reads the
//! variable-range MTRRs once and consults them for every 2MB region it maps.
//!
//! See: 12.11 MEMORY TYPE RANGE REGISTERS (MTRRS)

use crate::x86_instructions::rdmsr;
use bitfield::bitfield;
use x86::msr::{IA32_MTRRCAP, IA32_MTRR_PHYSBASE0};

/// The number of variable-range descriptors kept. Processors may report
/// more; the excess is ignored.
pub const MTRR_COUNT: usize = 8;

/// Memory types encodable in MTRRs and EPT entries.
///
/// See: Table 12-8. Memory Types That Can Be Encoded in MTRRs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MemoryType {
    /// Strong uncacheable.
    #[default]
    Uncacheable = 0,

    /// Write combining.
    WriteCombining = 1,

    /// Write through.
    WriteThrough = 4,

    /// Write protected.
    WriteProtected = 5,

    /// Write back.
    WriteBack = 6,
}

impl MemoryType {
    /// Decodes the 3-bit hardware encoding. Encodings the architecture
    /// reserves collapse to uncacheable, the most conservative type.
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => MemoryType::WriteCombining,
            4 => MemoryType::WriteThrough,
            5 => MemoryType::WriteProtected,
            6 => MemoryType::WriteBack,
            _ => MemoryType::Uncacheable,
        }
    }

    /// The 3-bit hardware encoding.
    pub fn bits(self) -> u64 {
        self as u64
    }
}

bitfield! {
    /// The IA32_MTRRCAP register.
    ///
    /// See: Figure 12-5. IA32_MTRRCAP Register
    #[derive(Clone, Copy)]
    pub struct MtrrCapabilities(u64);
    impl Debug;
    // The number of variable range registers.
    pub u8, variable_range_count, _: 7, 0;
    pub fixed_range_supported, _: 8;
    pub write_combining_supported, _: 10;
}

bitfield! {
    /// An IA32_MTRR_PHYSBASEn register.
    ///
    /// See: Figure 12-6. IA32_MTRR_PHYSBASEn and IA32_MTRR_PHYSMASKn
    ///      Variable-Range Register Pair
    #[derive(Clone, Copy)]
    pub struct MtrrPhysicalBase(u64);
    impl Debug;
    // The memory type of the range.
    pub u8, memory_type, _: 7, 0;
    // The base, in 4KB frames.
    pub u64, page_number, _: 51, 12;
}

bitfield! {
    /// An IA32_MTRR_PHYSMASKn register. An address is inside the range when
    /// `address & mask == base & mask`.
    #[derive(Clone, Copy)]
    pub struct MtrrPhysicalMask(u64);
    impl Debug;
    // True when the range register pair is in use.
    pub valid, _: 11;
    // The mask, in 4KB frames.
    pub u64, physical_mask, _: 51, 12;
}

/// One decoded variable-range MTRR.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mtrr {
    /// The physical base address of the range.
    pub physical_base: u64,

    /// The size of the range in bytes; zero when the mask was zero.
    pub size: u64,

    /// The memory type the range assigns.
    pub memory_type: MemoryType,

    /// Whether the range register pair is enabled.
    pub valid: bool,
}

impl Mtrr {
    /// An unused descriptor.
    pub const fn empty() -> Self {
        Self {
            physical_base: 0,
            size: 0,
            memory_type: MemoryType::Uncacheable,
            valid: false,
        }
    }

    /// Decodes one PHYSBASE/PHYSMASK register pair.
    ///
    /// The mask works as `address & mask == base & mask`, so each trailing
    /// zero frame bit doubles the covered size, starting from one 4KB page.
    /// A zero mask would cover everything by that rule; it is treated as a
    /// zero-size range that never matches.
    pub fn from_registers(base: u64, mask: u64) -> Self {
        let base = MtrrPhysicalBase(base);
        let mask = MtrrPhysicalMask(mask);
        let size = if mask.physical_mask() == 0 {
            0
        } else {
            0x1000u64 << mask.physical_mask().trailing_zeros()
        };
        Self {
            physical_base: base.page_number() << 12,
            size,
            memory_type: MemoryType::from_bits(base.memory_type()),
            valid: mask.valid(),
        }
    }

    /// Returns the memory type for the 2MB region starting at
    /// `physical_address`: the first valid descriptor whose range overlaps
    /// the region, or write-back when none does.
    pub fn lookup(table: &[Mtrr], physical_address: u64) -> MemoryType {
        const LARGE_PAGE_MASK: u64 = (1 << 21) - 1;

        table
            .iter()
            .find(|mtrr| {
                mtrr.valid
                    && mtrr.size != 0
                    && physical_address + LARGE_PAGE_MASK >= mtrr.physical_base
                    && physical_address < mtrr.physical_base + mtrr.size
            })
            .map_or(MemoryType::WriteBack, |mtrr| mtrr.memory_type)
    }
}

/// Reads the variable-range MTRRs into `table`. Descriptors beyond the
/// processor's reported count stay empty.
pub fn read_variable_mtrrs(table: &mut [Mtrr; MTRR_COUNT]) {
    let capabilities = MtrrCapabilities(rdmsr(IA32_MTRRCAP));
    let count = usize::from(capabilities.variable_range_count()).min(MTRR_COUNT);
    for (i, mtrr) in table.iter_mut().enumerate().take(count) {
        let base = rdmsr(IA32_MTRR_PHYSBASE0 + 2 * i as u32);
        let mask = rdmsr(IA32_MTRR_PHYSBASE0 + 2 * i as u32 + 1);
        *mtrr = Mtrr::from_registers(base, mask);
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryType, Mtrr};

    fn physbase(base: u64, memory_type: u8) -> u64 {
        base | u64::from(memory_type)
    }

    fn physmask(mask: u64, valid: bool) -> u64 {
        mask | (u64::from(valid) << 11)
    }

    #[test]
    fn size_is_a_power_of_two_and_at_least_one_page() {
        // A mask with no trailing zero frame bits: the minimum 4KB range.
        let mtrr = Mtrr::from_registers(physbase(0x8000_0000, 0), physmask(0xf_ffff_f000, true));
        assert_eq!(mtrr.size, 0x1000);

        // Each trailing zero frame bit doubles the size.
        let mtrr = Mtrr::from_registers(physbase(0x8000_0000, 0), physmask(0xf_ff00_0000, true));
        assert_eq!(mtrr.size, 0x100_0000);
        assert!(mtrr.size.is_power_of_two());
        assert!(mtrr.size >= 0x1000);
    }

    #[test]
    fn zero_mask_never_matches() {
        let zero = Mtrr::from_registers(physbase(0x1000_0000, 0), physmask(0, true));
        assert_eq!(zero.size, 0);

        let table = [zero; 1];
        // Even an address right below the base, which would pass the naive
        // overlap check, must fall through to the write-back default.
        assert_eq!(Mtrr::lookup(&table, 0x0fe0_0000), MemoryType::WriteBack);
        assert_eq!(Mtrr::lookup(&table, 0x1000_0000), MemoryType::WriteBack);
    }

    #[test]
    fn lookup_returns_first_overlapping_valid_range() {
        let mut table = [Mtrr::empty(); 4];
        // 16MB of uncacheable at 2GB, but marked invalid.
        table[0] = Mtrr::from_registers(
            physbase(0x8000_0000, 0),
            physmask(0xf_ff00_0000, false),
        );
        // 16MB of write-combining at 2GB, valid.
        table[1] = Mtrr::from_registers(physbase(0x8000_0000, 1), physmask(0xf_ff00_0000, true));
        // Overlapping write-through; first match must win.
        table[2] = Mtrr::from_registers(physbase(0x8000_0000, 4), physmask(0xf_ff00_0000, true));

        assert_eq!(Mtrr::lookup(&table, 0x8000_0000), MemoryType::WriteCombining);
        assert_eq!(Mtrr::lookup(&table, 0x80e0_0000), MemoryType::WriteCombining);
        // Just past the end of the ranges.
        assert_eq!(Mtrr::lookup(&table, 0x8100_0000), MemoryType::WriteBack);
    }

    #[test]
    fn region_partially_overlapping_a_small_range_matches() {
        // 1MB of uncacheable in the middle of the 2MB region at 0x8000_0000.
        let mut table = [Mtrr::empty(); 1];
        table[0] = Mtrr::from_registers(physbase(0x8010_0000, 0), physmask(0xf_fff0_0000, true));
        assert_eq!(table[0].size, 0x10_0000);

        assert_eq!(Mtrr::lookup(&table, 0x8000_0000), MemoryType::Uncacheable);
        // The regions on either side do not touch the range.
        assert_eq!(Mtrr::lookup(&table, 0x7fe0_0000), MemoryType::WriteBack);
        assert_eq!(Mtrr::lookup(&table, 0x8020_0000), MemoryType::WriteBack);
    }
}
