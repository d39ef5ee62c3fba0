//! The module containing the VMX plumbing: the VMXON/VMCS region layout,
//! wrappers over the VMX instructions, capability-MSR adjustment and the
//! assembly stubs entered on VM launch, VM resume and VM exit.
//!
//! All references to external resources (denoted with "See:") refers to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! at <https://www.intel.com/sdm/> unless otherwise stated.

use crate::context::{restore_cpu_context, Context};
use crate::error::LaunchError;
use core::arch::global_asm;
use core::mem::size_of;

/// A 4KB region given to the processor with VMXON or VMPTRLD. The first 32
/// bits hold the revision identifier read from `IA32_VMX_BASIC`; the rest is
/// processor-owned.
///
/// See: 25.2 FORMAT OF THE VMCS REGION
/// See: 25.11.5 VMXON Region
#[derive(derivative::Derivative)]
#[derivative(Debug)]
#[repr(C, align(4096))]
pub(crate) struct VmxRegion {
    pub(crate) revision_id: u32,
    abort_indicator: u32,
    #[derivative(Debug = "ignore")]
    data: [u8; 0x1000 - 2 * size_of::<u32>()],
}
const _: () = assert!(size_of::<VmxRegion>() == 0x1000);

impl VmxRegion {
    /// Creates a zeroed region.
    pub(crate) const fn new() -> Self {
        Self {
            revision_id: 0,
            abort_indicator: 0,
            data: [0; 0x1000 - 2 * size_of::<u32>()],
        }
    }
}

// VM-execution, VM-exit and VM-entry control bits requested by the launch
// engine.
// See: 25.6 VM-EXECUTION CONTROL FIELDS
//      25.7 VM-EXIT CONTROL FIELDS
//      25.8 VM-ENTRY CONTROL FIELDS
pub(crate) const PRIMARY_CTLS_USE_MSR_BITMAPS: u64 = 1 << 28;
pub(crate) const PRIMARY_CTLS_ACTIVATE_SECONDARY_CONTROLS: u64 = 1 << 31;
pub(crate) const SECONDARY_CTLS_ENABLE_EPT: u64 = 1 << 1;
pub(crate) const SECONDARY_CTLS_ENABLE_RDTSCP: u64 = 1 << 3;
pub(crate) const SECONDARY_CTLS_ENABLE_VPID: u64 = 1 << 5;
pub(crate) const SECONDARY_CTLS_ENABLE_INVPCID: u64 = 1 << 12;
pub(crate) const SECONDARY_CTLS_ENABLE_XSAVES: u64 = 1 << 20;
pub(crate) const SECONDARY_CTLS_MODE_BASED_EXECUTE: u64 = 1 << 22;
pub(crate) const EXIT_CTLS_HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;
pub(crate) const ENTRY_CTLS_IA32E_MODE_GUEST: u64 = 1 << 9;

/// The basic exit reason for the CPUID instruction.
///
/// See: Table C-1. Basic Exit Reasons
pub(crate) const EXIT_REASON_CPUID: u64 = 10;

/// Consults a VMX capability MSR value and returns `desired` with the bits
/// the processor fixes to one set and the bits it fixes to zero cleared.
///
/// The capability MSR is two 32-bit halves: the low half is the "allowed
/// 0" settings (a set bit there must be set in the control), the high half
/// the "allowed 1" settings (a clear bit there must stay clear).
///
/// See: A.3.1 Pin-Based VM-Execution Controls
pub(crate) fn adjust_msr(capability: u64, desired: u64) -> u64 {
    let mut value = desired;
    value &= capability >> 32;
    value |= capability & 0xffff_ffff;
    value
}

/// Enters VMX root operation with the given 4KB region.
pub(crate) fn vmxon(region_physical: u64) -> Result<(), LaunchError> {
    // Safety: this project runs at CPL0 and the region is initialized with
    // the revision identifier.
    unsafe { x86::bits64::vmx::vmxon(region_physical) }.map_err(|_| LaunchError::VmxonFailed)
}

/// Leaves VMX root operation. Failure means VMX was already off, which is
/// exactly the state the caller wants.
pub(crate) fn vmxoff() {
    // Safety: this project runs at CPL0.
    let _ = unsafe { x86::bits64::vmx::vmxoff() };
}

/// Clears the given VMCS region.
pub(crate) fn vmclear(region_physical: u64) -> Result<(), LaunchError> {
    // Safety: this project runs at CPL0 and in VMX root operation.
    unsafe { x86::bits64::vmx::vmclear(region_physical) }.map_err(|_| LaunchError::VmclearFailed)
}

/// Makes the given VMCS region current and active.
pub(crate) fn vmptrld(region_physical: u64) -> Result<(), LaunchError> {
    // Safety: this project runs at CPL0 and in VMX root operation.
    unsafe { x86::bits64::vmx::vmptrld(region_physical) }.map_err(|_| LaunchError::VmptrldFailed)
}

/// Reads a field of the current VMCS. `None` when there is no current VMCS
/// or the field does not exist.
pub(crate) fn vmread(field: u32) -> Option<u64> {
    // Safety: this project runs at CPL0 and in VMX root operation.
    unsafe { x86::bits64::vmx::vmread(field) }.ok()
}

/// Writes a field of the current VMCS. Failures are ignored like the
/// hardware ignores unknown fields; the subsequent VMLAUNCH reports an
/// inconsistent VMCS anyway.
pub(crate) fn vmwrite(field: u32, value: u64) {
    // Safety: this project runs at CPL0 and in VMX root operation.
    let _ = unsafe { x86::bits64::vmx::vmwrite(field, value) };
}

extern "C" {
    /// Executes VMLAUNCH. Entered with a restored context whose RIP points
    /// here; on success the guest runs and this never returns.
    fn lhv_vmlaunch();

    /// Executes VMRESUME. Entered the same way from the exit dispatcher.
    fn lhv_vmresume();

    /// The VM-exit trampoline the VMCS host RIP points at.
    fn lhv_vm_exit_entry();
}

global_asm!(include_str!("vmx_exit.S"));

/// The address to patch into a context that should execute VMLAUNCH.
pub(crate) fn vmlaunch_address() -> u64 {
    lhv_vmlaunch as usize as u64
}

/// The address to patch into a context that should execute VMRESUME.
pub(crate) fn vmresume_address() -> u64 {
    lhv_vmresume as usize as u64
}

/// The VMCS host-RIP value: where the processor transfers control on VM
/// exit.
pub(crate) fn vm_exit_entry_address() -> u64 {
    lhv_vm_exit_entry as usize as u64
}

/// The tail of the VM-exit trampoline: resumes the host context captured by
/// the launch engine, re-entering it with its VM-exit flag observable as
/// set.
#[no_mangle]
extern "C" fn lhv_vm_exit_landing(host_context: &Context) -> ! {
    restore_cpu_context(host_context)
}

#[cfg(test)]
mod tests {
    use super::adjust_msr;

    #[test]
    fn adjust_msr_applies_fixed_bits() {
        // Low half: bits 0 and 4 must be 1. High half: only bits 0..=7 may
        // be 1.
        let capability = (0xffu64 << 32) | 0b1_0001;

        // A desired bit outside the allowed-1 mask is dropped; required
        // bits appear even when not requested.
        assert_eq!(adjust_msr(capability, 1 << 9), 0b1_0001);
        // A desired bit within the mask survives.
        assert_eq!(adjust_msr(capability, 1 << 5), 0b11_0001);
        // Nothing requested still yields the required bits.
        assert_eq!(adjust_msr(capability, 0), 0b1_0001);
    }
}
