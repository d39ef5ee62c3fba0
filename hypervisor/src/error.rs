//! The module containing the [`LaunchError`] type.
//!
//! Launch failures are reported to the external loader as numeric codes in
//! the caller's `rax`, so the discriminants here are ABI and must not change.

use core::fmt;

/// Reasons a per-CPU launch can fail. Every failure unwinds the scope guards
/// and returns the CPU to the state the OS saw at entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum LaunchError {
    /// The VMXON instruction failed, eg, because `IA32_FEATURE_CONTROL` is
    /// locked with VMX disabled.
    VmxonFailed = 1,

    /// The VMCLEAR instruction failed on the per-CPU VMCS region.
    VmclearFailed = 2,

    /// The VMPTRLD instruction failed on the per-CPU VMCS region.
    VmptrldFailed = 3,

    /// The module has more pages than the physical-to-virtual map can hold.
    PhysicalToVirtualCapacity = 4,

    /// The preallocated EPT pool was exhausted while demoting large pages.
    OutOfEptEntries = 5,
}

impl LaunchError {
    /// The numeric code reported to the loader. Zero is reserved for success.
    pub fn code(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            LaunchError::VmxonFailed => "vmxon failed",
            LaunchError::VmclearFailed => "vmclear failed",
            LaunchError::VmptrldFailed => "vmptrld failed",
            LaunchError::PhysicalToVirtualCapacity => {
                "physical to virtual capacity exceeded"
            }
            LaunchError::OutOfEptEntries => "out of EPT entries",
        };
        f.write_str(message)
    }
}

#[cfg(test)]
mod tests {
    use super::LaunchError;

    #[test]
    fn codes_are_abi_stable() {
        assert_eq!(LaunchError::VmxonFailed.code(), 1);
        assert_eq!(LaunchError::VmclearFailed.code(), 2);
        assert_eq!(LaunchError::VmptrldFailed.code(), 3);
        assert_eq!(LaunchError::PhysicalToVirtualCapacity.code(), 4);
        assert_eq!(LaunchError::OutOfEptEntries.code(), 5);
    }
}
