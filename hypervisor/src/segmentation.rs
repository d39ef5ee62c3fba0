//! The module containing the [`SegmentDescriptor`] type.
//!
//! The launch engine reads descriptors out of the (intermediate copy of the)
//! OS GDT to derive the guest segment state for the VMCS, and writes the two
//! descriptors (64-bit code, 64-bit TSS) that make up the host GDT.
//!
//! See: 3.4.5 Segment Descriptors

use bitfield::bitfield;

/// The type field of a 64-bit execute/read code segment.
const TYPE_CODE_EXECUTE_READ: u8 = 0b1010;

/// The type field of an available 64-bit TSS.
const TYPE_TSS_AVAILABLE: u8 = 0b1001;

bitfield! {
    /// The lower 8 bytes every descriptor has.
    ///
    /// See: Figure 3-8. Segment Descriptor
    #[derive(Clone, Copy, Default)]
    pub struct DescriptorFields(u64);
    impl Debug;
    pub u64, limit_low, set_limit_low: 15, 0;
    // Base bits 23:0.
    pub u64, base_low, set_base_low: 39, 16;
    pub u8, descriptor_type, set_descriptor_type: 43, 40;
    // The S bit: set for code/data, clear for system descriptors.
    pub code_or_data, set_code_or_data: 44;
    pub u8, privilege_level, set_privilege_level: 46, 45;
    pub present, set_present: 47;
    pub u64, limit_high, set_limit_high: 51, 48;
    pub available, set_available: 52;
    pub long_mode, set_long_mode: 53;
    pub default_size, set_default_size: 54;
    pub granularity, set_granularity: 55;
    // Base bits 31:24.
    pub u64, base_high, set_base_high: 63, 56;
}

/// A segment descriptor together with the extension qword system
/// descriptors carry in 64-bit mode.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentDescriptor {
    fields: DescriptorFields,
    /// Base bits 63:32 (system descriptors only).
    extension: u64,
}

impl SegmentDescriptor {
    /// Reads the descriptor `selector` refers to out of the table at
    /// `table_base`. A null selector yields an empty descriptor, which
    /// reports itself unusable.
    pub fn from_table(table_base: u64, selector: u16) -> Self {
        if selector == 0 {
            return Self::default();
        }
        let address = table_base + u64::from(selector & !0x3);
        // Safety: the selector was loaded from a descriptor-table register,
        // so it indexes within the table it was read with.
        let fields = DescriptorFields(unsafe { *(address as *const u64) });
        let extension = if fields.code_or_data() {
            0
        } else {
            // System descriptors are 16 bytes in 64-bit mode.
            // See: Figure 8-4. Format of TSS and LDT Descriptors in 64-bit Mode
            unsafe { *((address + 8) as *const u64) }
        };
        Self { fields, extension }
    }

    /// The 20-bit limit field.
    pub fn limit(&self) -> u64 {
        self.fields.limit_low() | (self.fields.limit_high() << 16)
    }

    /// The 32-bit base field.
    pub fn base(&self) -> u64 {
        self.fields.base_low() | (self.fields.base_high() << 24)
    }

    /// The base field, extended to 64 bits for system descriptors.
    pub fn base_extended(&self) -> u64 {
        self.base() | (self.extension & 0xffff_ffff) << 32
    }

    /// The base as the VMCS wants it: system descriptors (TSS, LDT) use the
    /// 64-bit extended base, code and data descriptors the 32-bit one.
    pub fn context_dependent_base(&self) -> u64 {
        if self.fields.code_or_data() {
            self.base()
        } else {
            self.base_extended()
        }
    }

    /// The access-rights byte pair in the VMCS encoding: descriptor bits
    /// 55:40 with the "segment unusable" flag at bit 16 for non-present
    /// descriptors.
    ///
    /// See: 25.4.1 Guest Register State
    pub fn vmx_access_rights(&self) -> u64 {
        const UNUSABLE: u64 = 1 << 16;

        // Bits 11:8 are the descriptor's limit bits 19:16 and are reserved
        // in the VMCS encoding.
        let rights = (self.fields.0 >> 40) & 0b1111_0000_1111_1111;
        if self.fields.present() {
            rights
        } else {
            rights | UNUSABLE
        }
    }

    /// Builds the flat 64-bit ring-0 code descriptor for the host GDT.
    pub fn host_code() -> u64 {
        let mut fields = DescriptorFields(0);
        fields.set_limit_low(0xffff);
        fields.set_limit_high(0xf);
        fields.set_descriptor_type(TYPE_CODE_EXECUTE_READ);
        fields.set_code_or_data(true);
        fields.set_privilege_level(0);
        fields.set_present(true);
        fields.set_long_mode(true);
        fields.set_default_size(false);
        fields.set_granularity(true);
        fields.0
    }

    /// Builds the 16-byte available-TSS descriptor for the host GDT.
    pub fn host_task_state(base: u64, limit: u64) -> (u64, u64) {
        let mut fields = DescriptorFields(0);
        fields.set_limit_low(limit & 0xffff);
        fields.set_limit_high((limit >> 16) & 0xf);
        fields.set_base_low(base & 0xff_ffff);
        fields.set_base_high((base >> 24) & 0xff);
        fields.set_descriptor_type(TYPE_TSS_AVAILABLE);
        fields.set_code_or_data(false);
        fields.set_privilege_level(0);
        fields.set_present(true);
        (fields.0, base >> 32)
    }
}

#[cfg(test)]
mod tests {
    use super::SegmentDescriptor;

    #[test]
    fn null_selector_is_unusable() {
        let descriptor = SegmentDescriptor::from_table(0, 0);
        assert_eq!(descriptor.vmx_access_rights(), 1 << 16);
        assert_eq!(descriptor.limit(), 0);
        assert_eq!(descriptor.context_dependent_base(), 0);
    }

    #[test]
    fn parses_a_code_descriptor() {
        // A flat 64-bit ring-0 code segment at table index 2, read with
        // varying RPL bits in the selector.
        let table: [u64; 4] = [0, 0, SegmentDescriptor::host_code(), 0];
        for selector in [0x10u16, 0x13] {
            let descriptor = SegmentDescriptor::from_table(table.as_ptr() as u64, selector);
            assert_eq!(descriptor.limit(), 0xfffff);
            assert_eq!(descriptor.context_dependent_base(), 0);
            // Present, type 0xa, S, L and G visible in the access rights.
            let rights = descriptor.vmx_access_rights();
            assert_eq!(rights & 0xf, 0xa);
            assert_ne!(rights & (1 << 4), 0, "S bit");
            assert_ne!(rights & (1 << 7), 0, "present");
            assert_ne!(rights & (1 << 13), 0, "long mode");
            assert_eq!(rights & (1 << 16), 0, "usable");
        }
    }

    #[test]
    fn parses_a_system_descriptor_with_extended_base() {
        let base = 0xffff_8000_1234_5678u64;
        let (low, high) = SegmentDescriptor::host_task_state(base, 103);
        let table: [u64; 4] = [0, low, high, 0];

        let descriptor = SegmentDescriptor::from_table(table.as_ptr() as u64, 0x8);
        assert_eq!(descriptor.limit(), 103);
        assert_eq!(descriptor.context_dependent_base(), base);
        // System descriptors have the S bit clear in the access rights.
        assert_eq!(descriptor.vmx_access_rights() & (1 << 4), 0);
        assert_eq!(descriptor.vmx_access_rights() & 0xf, 0b1001);
    }
}
