//! The module containing the [`Hypervisor`] type: the per-CPU launch engine
//! that turns the running OS into a guest, and the VM-exit dispatcher that
//! services it afterwards.
//!
//! All references to external resources (denoted with "See:") refers to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! at <https://www.intel.com/sdm/> unless otherwise stated.

use crate::config::{DESCRIPTOR_TABLE_SLOTS, MAX_CPUS, MAX_MODULE_SIZE, STACK_SIZE};
use crate::context::{capture_cpu_context, restore_cpu_context, Context};
use crate::ept::{Ept, EptPointer};
use crate::error::LaunchError;
use crate::guard::ScopeGuard;
use crate::host_page_table::HostPageTable;
use crate::logger::init_uart_logger;
use crate::module_region::find_module_region;
use crate::mtrr::{read_variable_mtrrs, MemoryType, Mtrr, MTRR_COUNT};
use crate::os_page_table::{OsPageTable, PhysicalToVirtual};
use crate::paging::{Protection, VirtualToPhysical};
use crate::segmentation::SegmentDescriptor;
use crate::small_map::SmallMap;
use crate::vmx::{
    adjust_msr, vm_exit_entry_address, vmclear, vmlaunch_address, vmptrld, vmread,
    vmresume_address, vmwrite, vmxoff, vmxon, VmxRegion, ENTRY_CTLS_IA32E_MODE_GUEST,
    EXIT_CTLS_HOST_ADDRESS_SPACE_SIZE, EXIT_REASON_CPUID, PRIMARY_CTLS_ACTIVATE_SECONDARY_CONTROLS,
    PRIMARY_CTLS_USE_MSR_BITMAPS, SECONDARY_CTLS_ENABLE_EPT, SECONDARY_CTLS_ENABLE_INVPCID,
    SECONDARY_CTLS_ENABLE_RDTSCP, SECONDARY_CTLS_ENABLE_VPID, SECONDARY_CTLS_ENABLE_XSAVES,
    SECONDARY_CTLS_MODE_BASED_EXECUTE,
};
use crate::x86_instructions::{
    cpuid, cr0, cr0_write, cr3, cr3_write, cr4, cr4_write, disable_interrupts, dr7,
    enable_interrupts, lgdt, rdmsr, segment_limit, sgdt, sidt, sldt, task_register,
};
use crate::Page;
use core::arch::x86_64::CpuidResult;
use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, error, info};
use spin::Once;
use x86::controlregs::{Cr0, Cr4};
use x86::current::paging::BASE_PAGE_SHIFT;
use x86::dtables::DescriptorTablePointer;
use x86::msr;
use x86::vmx::vmcs;

/// The first of the VMX capability MSRs cached at startup.
const VMX_MSR_RANGE_BEGIN: u32 = msr::IA32_VMX_BASIC;

/// The number of VMX capability MSRs cached, `[0x480, 0x492)`.
const VMX_MSR_RANGE_SIZE: usize = 0x12;

/// The CPUID leaf reserved for hypervisor vendor identification.
const CPUID_HYPERVISOR_VENDOR_LEAF: u64 = 0x4000_0000;

/// The "hypervisor present" bit in CPUID.1:ECX.
const CPUID_HYPERVISOR_PRESENT: u32 = 1 << 31;

/// The vendor signature returned from [`CPUID_HYPERVISOR_VENDOR_LEAF`]:
/// "ZppZppZppZpp" across EBX, ECX and EDX.
const HYPERVISOR_SIGNATURE: (u32, u32, u32) = (0x5a70_705a, 0x705a_7070, 0x7070_5a70);

/// A private stack one CPU launches on.
#[repr(C, align(4096))]
struct CpuStack([u8; STACK_SIZE]);

impl CpuStack {
    const ZERO: Self = Self([0; STACK_SIZE]);
}

/// Backing storage for a GDT or an IDT, sized for the architectural
/// maximum limit.
#[repr(C, align(4096))]
struct DescriptorTable([u64; DESCRIPTOR_TABLE_SLOTS]);

impl DescriptorTable {
    const ZERO: Self = Self([0; DESCRIPTOR_TABLE_SLOTS]);
}

/// The 64-bit task state segment.
///
/// See: Figure 8-11. 64-Bit TSS Format
#[repr(C, align(16))]
struct TaskStateSegment([u32; 26]);

/// A captured GDTR or IDTR value.
#[derive(Clone, Copy, Debug, Default)]
struct DescriptorTableRegister {
    base: u64,
    limit: u16,
}

/// Loads the GDTR from a captured register value.
fn load_gdt(register: DescriptorTableRegister) {
    let pointer = DescriptorTablePointer::<u64> {
        limit: register.limit,
        base: register.base as *const u64,
    };
    lgdt(&pointer);
}

/// The state of the hypervisor: shared structures built once on CPU 0 and
/// per-CPU structures indexed by launch order.
///
/// Everything lives inside this object, and the object lives inside the
/// module image, so protecting the module from the guest hides all of it.
#[repr(C, align(4096))]
pub struct Hypervisor {
    /// The index of the next unused private stack.
    available_stack_index: usize,

    /// The VPID assigned to the next launch; starts at 1 (0 tags the host)
    /// and is incremented per launch. Launches are serialized by the
    /// loader, so plain increments suffice.
    next_virtual_processor: u64,

    /// The contiguous virtual address range of the module image.
    module_base: u64,
    module_size: usize,

    /// The view of the OS page table; valid during initialization only.
    os_page_table: OsPageTable,

    /// The page table the host runs on after the CR3 switch.
    host_page_table: HostPageTable,

    /// Physical page address -> virtual address for every module page.
    module_physical_to_virtual: SmallMap<{ MAX_MODULE_SIZE >> 12 }>,

    /// Control and debug register state captured at entry.
    guest_cr0: u64,
    guest_cr3: u64,
    guest_cr4: u64,
    guest_dr7: u64,

    /// Fixed-bit-adjusted control register values for VMX root operation.
    host_cr0: u64,
    host_cr3: u64,
    host_cr4: u64,

    /// The OS descriptor-table registers captured at entry.
    gdtr: DescriptorTableRegister,
    idtr: DescriptorTableRegister,

    guest_ldtr: u16,
    guest_tr: u16,
    host_cs: u16,
    host_tr: u16,

    ia32_debug_control: u64,
    ia32_gs_base: u64,

    /// The VMX capability MSRs, read once on CPU 0.
    vmx_msrs: [u64; VMX_MSR_RANGE_SIZE],

    /// The variable-range MTRRs, read once on CPU 0.
    mtrrs: [Mtrr; MTRR_COUNT],

    /// The host GDT: null, code, and a 16-byte TSS descriptor.
    host_gdt: DescriptorTable,

    /// The host IDT. Left empty; interrupts stay disabled in root mode.
    host_idt: DescriptorTable,

    /// The pages the host FS and GS bases point at.
    fs_data: Page,
    gs_data: Page,

    /// The task state segment the host TR refers to.
    host_tss: TaskStateSegment,

    /// Per-CPU copies of the OS GDT, kept in host-mapped memory so the
    /// table stays readable between the CR3 switch and the launch.
    intermediate_gdt: [DescriptorTable; MAX_CPUS],

    /// The extended page tables shared by all CPUs.
    ept: Ept,

    /// The per-CPU VMXON regions.
    vmxon_regions: [VmxRegion; MAX_CPUS],

    /// The per-CPU VMCS regions.
    vmcs_regions: [VmxRegion; MAX_CPUS],

    /// All zero: no MSR access causes a VM exit.
    msr_bitmap: Page,

    /// Physical addresses resolved for the current CPU's launch.
    vmxon_physical: u64,
    vmcs_physical: u64,
    epml4_physical: u64,
    msr_bitmap_physical: u64,

    /// The private launch stacks.
    stacks: [CpuStack; MAX_CPUS],
}

/// A cell whose content is synchronized externally: the loader guarantees
/// exactly one CPU runs inside the hypervisor at a time.
#[repr(transparent)]
struct RacyCell<T>(UnsafeCell<T>);

// Safety: see `RacyCell`.
unsafe impl<T> Sync for RacyCell<T> {}

/// The singleton. All-zero at rest so it lands in `.bss` inside the module
/// image.
static HYPERVISOR: RacyCell<Hypervisor> = RacyCell(UnsafeCell::new(Hypervisor::new()));

/// Guards the one-time fixup of the zero state.
static CREATED: Once<()> = Once::new();

impl Hypervisor {
    /// Creates an all-zero state.
    const fn new() -> Self {
        const ZERO_REGION: VmxRegion = VmxRegion::new();
        Self {
            available_stack_index: 0,
            next_virtual_processor: 0,
            module_base: 0,
            module_size: 0,
            os_page_table: OsPageTable::empty(),
            host_page_table: HostPageTable::new(),
            module_physical_to_virtual: SmallMap::new(),
            guest_cr0: 0,
            guest_cr3: 0,
            guest_cr4: 0,
            guest_dr7: 0,
            host_cr0: 0,
            host_cr3: 0,
            host_cr4: 0,
            gdtr: DescriptorTableRegister { base: 0, limit: 0 },
            idtr: DescriptorTableRegister { base: 0, limit: 0 },
            guest_ldtr: 0,
            guest_tr: 0,
            host_cs: 0,
            host_tr: 0,
            ia32_debug_control: 0,
            ia32_gs_base: 0,
            vmx_msrs: [0; VMX_MSR_RANGE_SIZE],
            mtrrs: [Mtrr::empty(); MTRR_COUNT],
            host_gdt: DescriptorTable::ZERO,
            host_idt: DescriptorTable::ZERO,
            fs_data: Page::new(),
            gs_data: Page::new(),
            host_tss: TaskStateSegment([0; 26]),
            intermediate_gdt: [DescriptorTable::ZERO; MAX_CPUS],
            ept: Ept::new(),
            vmxon_regions: [ZERO_REGION; MAX_CPUS],
            vmcs_regions: [ZERO_REGION; MAX_CPUS],
            msr_bitmap: Page::new(),
            vmxon_physical: 0,
            vmcs_physical: 0,
            epml4_physical: 0,
            msr_bitmap_physical: 0,
            stacks: [CpuStack::ZERO; MAX_CPUS],
        }
    }

    /// Returns the process-wide instance, initializing it on the first
    /// call. There is no teardown; the module is never unloaded cleanly.
    ///
    /// # Safety
    ///
    /// The caller must uphold the loader contract: one CPU inside the
    /// hypervisor at a time, CPU 0 first.
    pub unsafe fn create_once() -> &'static mut Hypervisor {
        CREATED.call_once(|| {
            init_uart_logger();
            // Safety: this is the first entry; nothing else references the
            // state yet.
            let hypervisor = unsafe { &mut *HYPERVISOR.0.get() };
            hypervisor.next_virtual_processor = 1;
        });
        // Safety: serialized per the function contract.
        unsafe { &mut *HYPERVISOR.0.get() }
    }

    /// Launches the hypervisor on the current CPU, on a private stack.
    ///
    /// `caller_context.rdi` holds the zero-based CPU identifier and
    /// `caller_context.rsi` the physical-to-virtual translator. On success
    /// the caller context is resumed as a guest with `rax = 0`; on failure
    /// it is resumed un-virtualized with `rax` holding the error code.
    pub fn launch_on_cpu(&mut self, caller_context: &mut Context) -> ! {
        let stack_base = self.stacks[self.available_stack_index].0.as_mut_ptr();
        let stack_top =
            unsafe { stack_base.add(STACK_SIZE - size_of::<Context>()) }.cast::<Context>();

        // Copy the caller context to the top of the private stack and enter
        // the stack-switched half of the launch with it.
        unsafe { ptr::write(stack_top, *caller_context) };
        let launch_context = caller_context;
        launch_context.rip = launch_on_cpu_private_stack as usize as u64;
        launch_context.rsp = stack_top as u64 - size_of::<u64>() as u64;
        launch_context.rdi = ptr::from_mut(self) as u64;
        launch_context.rsi = stack_top as u64;
        self.available_stack_index += 1;
        restore_cpu_context(launch_context)
    }

    /// The launch sequence proper. Returns only on failure; on success the
    /// OS is resumed as a guest and control never comes back.
    fn main(&mut self, caller_context: &mut Context) -> Result<(), LaunchError> {
        let cpu = caller_context.rdi as usize;
        // Safety: `rsi` is either a valid translator or zero, and zero maps
        // to `None` through the fn-pointer niche.
        let translate: Option<PhysicalToVirtual> =
            unsafe { core::mem::transmute(caller_context.rsi) };

        disable_interrupts();
        let _restore_interrupts = ScopeGuard::new(enable_interrupts);

        self.initialize_registers();

        if cpu == 0 {
            self.initialize_module_region();
            self.os_page_table = OsPageTable::new(self.guest_cr3, translate);
            self.initialize_host_page_table();
            self.initialize_module_physical_to_virtual()?;
            self.initialize_host_gdt();
        }

        self.initialize_intermediate_gdt(cpu);
        self.load_intermediate_gdt(cpu);
        let os_gdtr = self.gdtr;
        let _restore_gdt = ScopeGuard::new(move || load_gdt(os_gdtr));

        cr3_write(self.host_cr3);
        let guest_cr3 = self.guest_cr3;
        let _restore_cr3 = ScopeGuard::new(move || cr3_write(guest_cr3));

        if cpu == 0 {
            self.initialize_vmx_msrs();
            self.initialize_host_control_registers();
            read_variable_mtrrs(&mut self.mtrrs);
            self.ept.build_identity_map(&self.mtrrs, &self.host_page_table);
            self.protect_module()?;
            debug!("one-time initialization complete");
        }

        self.initialize_vmx();
        self.enter_root_mode()?;
        let _turn_off_vmx = ScopeGuard::new(vmxoff);

        self.setup_vmcs(cpu, caller_context);
        self.vm_launch(caller_context);

        // Reached only when the exit dispatcher could not read the exit
        // reason; report the launch as failed.
        Err(LaunchError::VmxonFailed)
    }

    /// Captures the control, debug, segment-table and MSR state of the OS.
    fn initialize_registers(&mut self) {
        self.guest_cr0 = cr0().bits() as u64;
        self.guest_cr3 = cr3();
        self.guest_cr4 = cr4().bits() as u64;
        self.guest_dr7 = dr7();

        self.ia32_debug_control = rdmsr(msr::IA32_DEBUGCTL);
        self.ia32_gs_base = rdmsr(msr::IA32_GS_BASE);

        let mut gdtr = DescriptorTablePointer::<u64>::default();
        sgdt(&mut gdtr);
        self.gdtr = DescriptorTableRegister {
            base: gdtr.base as u64,
            limit: gdtr.limit,
        };

        let mut idtr = DescriptorTablePointer::<u64>::default();
        sidt(&mut idtr);
        self.idtr = DescriptorTableRegister {
            base: idtr.base as u64,
            limit: idtr.limit,
        };

        self.guest_ldtr = sldt();
        self.guest_tr = task_register();
    }

    /// Finds the module's own image in memory.
    fn initialize_module_region(&mut self) {
        let (base, size) = find_module_region();
        self.module_base = base;
        self.module_size = size;
        info!("module at {base:#x}, {size:#x} bytes");
    }

    /// Builds the host page table: its self-map, then the whole module with
    /// RWX, and derives the host CR3 from it.
    fn initialize_host_page_table(&mut self) {
        self.host_page_table.map_self(&self.os_page_table);
        self.host_page_table.map_from(
            self.module_base,
            self.module_size,
            Protection::READ | Protection::WRITE | Protection::EXECUTE,
            &self.os_page_table,
        );
        self.host_cr3 = self
            .host_page_table
            .virtual_to_physical(self.host_page_table.pml4_address())
            | (self.guest_cr3 & 0xfff);
    }

    /// Records the physical frame of every module page so structures inside
    /// the module can later be found by physical address alone.
    fn initialize_module_physical_to_virtual(&mut self) -> Result<(), LaunchError> {
        let number_of_pages = self.module_size >> BASE_PAGE_SHIFT;
        if number_of_pages > self.module_physical_to_virtual.capacity() {
            return Err(LaunchError::PhysicalToVirtualCapacity);
        }
        for i in 0..number_of_pages {
            let address = self.module_base + ((i as u64) << BASE_PAGE_SHIFT);
            let physical_address = self.host_page_table.virtual_to_physical(address);
            self.module_physical_to_virtual.insert(physical_address, address);
        }
        Ok(())
    }

    /// Builds the host GDT: a flat 64-bit code descriptor at index 1 and a
    /// 16-byte TSS descriptor at indices 2-3.
    ///
    /// "The selector fields for CS and TR cannot be 0000H."
    /// See: 27.2.3 Checks on Host Segment and Descriptor-Table Registers
    fn initialize_host_gdt(&mut self) {
        const CS_INDEX: usize = 1;
        const TR_INDEX: usize = 2;

        self.host_gdt.0[CS_INDEX] = SegmentDescriptor::host_code();
        self.host_cs = (CS_INDEX << 3) as u16;

        let tss_base = ptr::addr_of!(self.host_tss) as u64;
        let tss_limit = size_of::<TaskStateSegment>() as u64 - 1;
        let (low, high) = SegmentDescriptor::host_task_state(tss_base, tss_limit);
        self.host_gdt.0[TR_INDEX] = low;
        self.host_gdt.0[TR_INDEX + 1] = high;
        self.host_tr = (TR_INDEX << 3) as u16;
    }

    /// Copies the OS GDT into this CPU's intermediate GDT.
    fn initialize_intermediate_gdt(&mut self, cpu: usize) {
        let bytes = usize::from(self.gdtr.limit) + 1;
        // Safety: the OS GDT is `bytes` long and the slot is sized for the
        // architectural maximum.
        unsafe {
            ptr::copy_nonoverlapping(
                self.gdtr.base as *const u8,
                self.intermediate_gdt[cpu].0.as_mut_ptr().cast::<u8>(),
                bytes,
            );
        };
    }

    /// Loads this CPU's intermediate GDT. The contents equal the OS GDT but
    /// the copy is in module memory, which the host page table maps.
    fn load_intermediate_gdt(&mut self, cpu: usize) {
        load_gdt(DescriptorTableRegister {
            base: self.intermediate_gdt[cpu].0.as_ptr() as u64,
            limit: self.gdtr.limit,
        });
    }

    /// Caches the VMX capability MSRs.
    fn initialize_vmx_msrs(&mut self) {
        for (i, slot) in self.vmx_msrs.iter_mut().enumerate() {
            *slot = rdmsr(VMX_MSR_RANGE_BEGIN + i as u32);
        }
    }

    /// Returns a cached VMX capability MSR value.
    fn cached_vmx_msr(&self, msr: u32) -> u64 {
        self.vmx_msrs[(msr - VMX_MSR_RANGE_BEGIN) as usize]
    }

    /// Derives the host CR0/CR4 from the guest values and the fixed-bit
    /// requirements of VMX operation.
    ///
    /// See: A.7 VMX-FIXED BITS IN CR0
    /// See: A.8 VMX-FIXED BITS IN CR4
    fn initialize_host_control_registers(&mut self) {
        self.host_cr0 = (self.guest_cr0
            & (self.cached_vmx_msr(msr::IA32_VMX_CR0_FIXED1) & 0xffff_ffff))
            | (self.cached_vmx_msr(msr::IA32_VMX_CR0_FIXED0) & 0xffff_ffff);
        self.host_cr4 = (self.guest_cr4
            & (self.cached_vmx_msr(msr::IA32_VMX_CR4_FIXED1) & 0xffff_ffff))
            | (self.cached_vmx_msr(msr::IA32_VMX_CR4_FIXED0) & 0xffff_ffff);
    }

    /// Hides the module from the guest.
    fn protect_module(&mut self) -> Result<(), LaunchError> {
        self.ept.protect_region(
            self.module_base,
            self.module_size,
            &self.host_page_table,
            &self.module_physical_to_virtual,
        )
    }

    /// Prepares this CPU's VMXON/VMCS regions and resolves the physical
    /// addresses the VMCS needs.
    fn initialize_vmx(&mut self) {
        let index = (self.next_virtual_processor - 1) as usize;

        // "Software can discover the VMCS revision identifier that a
        //  processor uses by reading the VMX capability MSR IA32_VMX_BASIC."
        // See: 25.2 FORMAT OF THE VMCS REGION
        let revision_id = self.cached_vmx_msr(msr::IA32_VMX_BASIC) as u32;
        self.vmxon_regions[index].revision_id = revision_id;
        self.vmcs_regions[index].revision_id = revision_id;

        self.vmxon_physical = self
            .host_page_table
            .virtual_to_physical(ptr::addr_of!(self.vmxon_regions[index]) as u64);
        self.vmcs_physical = self
            .host_page_table
            .virtual_to_physical(ptr::addr_of!(self.vmcs_regions[index]) as u64);
        self.epml4_physical = self
            .host_page_table
            .virtual_to_physical(self.ept.epml4_address());
        self.msr_bitmap_physical = self
            .host_page_table
            .virtual_to_physical(ptr::addr_of!(self.msr_bitmap) as u64);
    }

    /// Enters VMX root operation and makes this CPU's VMCS current. Every
    /// step is guarded; a failure leaves CR0, CR4 and the VMX state exactly
    /// as they were.
    fn enter_root_mode(&mut self) -> Result<(), LaunchError> {
        let saved_cr0 = cr0();
        let saved_cr4 = cr4();

        cr0_write(Cr0::from_bits_truncate(self.host_cr0 as usize));
        let restore_cr0 = ScopeGuard::new(move || cr0_write(saved_cr0));

        cr4_write(Cr4::from_bits_truncate(self.host_cr4 as usize));
        let restore_cr4 = ScopeGuard::new(move || cr4_write(saved_cr4));

        vmxon(self.vmxon_physical)?;
        let turn_off_vmx = ScopeGuard::new(vmxoff);

        vmclear(self.vmcs_physical)?;
        vmptrld(self.vmcs_physical)?;

        turn_off_vmx.cancel();
        restore_cr4.cancel();
        restore_cr0.cancel();
        Ok(())
    }

    /// Populates every VMCS field except guest/host RIP and RSP, which the
    /// launch sequence owns.
    fn setup_vmcs(&mut self, cpu: usize, guest_context: &Context) {
        // An all-ones link pointer means no shadow VMCS.
        vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);
        vmwrite(vmcs::control::VPID, self.next_virtual_processor);

        let mut eptp = EptPointer(0);
        eptp.set_memory_type(MemoryType::WriteBack.bits() as u8);
        eptp.set_walk_length_minus_one(3);
        eptp.set_page_number(self.epml4_physical >> BASE_PAGE_SHIFT);
        vmwrite(vmcs::control::EPTP_FULL, eptp.0);

        vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, self.msr_bitmap_physical);

        vmwrite(
            vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
            adjust_msr(
                self.cached_vmx_msr(msr::IA32_VMX_PROCBASED_CTLS2),
                SECONDARY_CTLS_ENABLE_EPT
                    | SECONDARY_CTLS_ENABLE_VPID
                    | SECONDARY_CTLS_ENABLE_RDTSCP
                    | SECONDARY_CTLS_ENABLE_INVPCID
                    | SECONDARY_CTLS_ENABLE_XSAVES
                    | SECONDARY_CTLS_MODE_BASED_EXECUTE,
            ),
        );
        vmwrite(
            vmcs::control::PINBASED_EXEC_CONTROLS,
            adjust_msr(self.cached_vmx_msr(msr::IA32_VMX_TRUE_PINBASED_CTLS), 0),
        );
        vmwrite(
            vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            adjust_msr(
                self.cached_vmx_msr(msr::IA32_VMX_TRUE_PROCBASED_CTLS),
                PRIMARY_CTLS_ACTIVATE_SECONDARY_CONTROLS | PRIMARY_CTLS_USE_MSR_BITMAPS,
            ),
        );
        vmwrite(
            vmcs::control::VMEXIT_CONTROLS,
            adjust_msr(
                self.cached_vmx_msr(msr::IA32_VMX_TRUE_EXIT_CTLS),
                EXIT_CTLS_HOST_ADDRESS_SPACE_SIZE,
            ),
        );
        vmwrite(
            vmcs::control::VMENTRY_CONTROLS,
            adjust_msr(
                self.cached_vmx_msr(msr::IA32_VMX_TRUE_ENTRY_CTLS),
                ENTRY_CTLS_IA32E_MODE_GUEST,
            ),
        );

        // Guest segment state comes from the captured selectors resolved
        // against the intermediate GDT; host selectors are the fresh host
        // GDT's.
        let gdt_base = self.intermediate_gdt[cpu].0.as_ptr() as u64;

        let descriptor = SegmentDescriptor::from_table(gdt_base, guest_context.cs);
        vmwrite(vmcs::guest::CS_SELECTOR, u64::from(guest_context.cs));
        vmwrite(vmcs::guest::CS_LIMIT, descriptor.limit());
        vmwrite(vmcs::guest::CS_ACCESS_RIGHTS, descriptor.vmx_access_rights());
        vmwrite(vmcs::guest::CS_BASE, descriptor.context_dependent_base());
        vmwrite(vmcs::host::CS_SELECTOR, u64::from(self.host_cs));

        let descriptor = SegmentDescriptor::from_table(gdt_base, guest_context.ds);
        vmwrite(vmcs::guest::DS_SELECTOR, u64::from(guest_context.ds));
        vmwrite(vmcs::guest::DS_LIMIT, descriptor.limit());
        vmwrite(vmcs::guest::DS_ACCESS_RIGHTS, descriptor.vmx_access_rights());
        vmwrite(vmcs::guest::DS_BASE, descriptor.context_dependent_base());
        vmwrite(vmcs::host::DS_SELECTOR, 0);

        let descriptor = SegmentDescriptor::from_table(gdt_base, guest_context.es);
        vmwrite(vmcs::guest::ES_SELECTOR, u64::from(guest_context.es));
        vmwrite(vmcs::guest::ES_LIMIT, descriptor.limit());
        vmwrite(vmcs::guest::ES_ACCESS_RIGHTS, descriptor.vmx_access_rights());
        vmwrite(vmcs::guest::ES_BASE, descriptor.context_dependent_base());
        vmwrite(vmcs::host::ES_SELECTOR, 0);

        let descriptor = SegmentDescriptor::from_table(gdt_base, guest_context.fs);
        vmwrite(vmcs::guest::FS_SELECTOR, u64::from(guest_context.fs));
        vmwrite(vmcs::guest::FS_LIMIT, descriptor.limit());
        vmwrite(vmcs::guest::FS_ACCESS_RIGHTS, descriptor.vmx_access_rights());
        vmwrite(vmcs::guest::FS_BASE, descriptor.context_dependent_base());
        vmwrite(vmcs::host::FS_BASE, ptr::addr_of!(self.fs_data) as u64);
        vmwrite(vmcs::host::FS_SELECTOR, 0);

        let descriptor = SegmentDescriptor::from_table(gdt_base, guest_context.gs);
        vmwrite(vmcs::guest::GS_SELECTOR, u64::from(guest_context.gs));
        vmwrite(vmcs::guest::GS_LIMIT, descriptor.limit());
        vmwrite(vmcs::guest::GS_ACCESS_RIGHTS, descriptor.vmx_access_rights());
        // The OS may be mid-SWAPGS; the MSR holds the live base regardless
        // of what the descriptor says.
        vmwrite(vmcs::guest::GS_BASE, self.ia32_gs_base);
        vmwrite(vmcs::host::GS_BASE, ptr::addr_of!(self.gs_data) as u64);
        vmwrite(vmcs::host::GS_SELECTOR, 0);

        let descriptor = SegmentDescriptor::from_table(gdt_base, guest_context.ss);
        vmwrite(vmcs::guest::SS_SELECTOR, u64::from(guest_context.ss));
        vmwrite(vmcs::guest::SS_LIMIT, descriptor.limit());
        vmwrite(vmcs::guest::SS_ACCESS_RIGHTS, descriptor.vmx_access_rights());
        vmwrite(vmcs::guest::SS_BASE, descriptor.context_dependent_base());
        vmwrite(vmcs::host::SS_SELECTOR, 0);

        let descriptor = SegmentDescriptor::from_table(gdt_base, self.guest_tr);
        vmwrite(vmcs::guest::TR_SELECTOR, u64::from(self.guest_tr));
        vmwrite(vmcs::guest::TR_LIMIT, u64::from(segment_limit(self.guest_tr)));
        vmwrite(vmcs::guest::TR_ACCESS_RIGHTS, descriptor.vmx_access_rights());
        vmwrite(vmcs::guest::TR_BASE, descriptor.context_dependent_base());
        vmwrite(vmcs::host::TR_BASE, ptr::addr_of!(self.host_tss) as u64);
        vmwrite(vmcs::host::TR_SELECTOR, u64::from(self.host_tr));

        let descriptor = SegmentDescriptor::from_table(gdt_base, self.guest_ldtr);
        vmwrite(vmcs::guest::LDTR_SELECTOR, u64::from(self.guest_ldtr));
        vmwrite(vmcs::guest::LDTR_LIMIT, descriptor.limit());
        vmwrite(vmcs::guest::LDTR_ACCESS_RIGHTS, descriptor.vmx_access_rights());
        vmwrite(vmcs::guest::LDTR_BASE, descriptor.context_dependent_base());

        vmwrite(vmcs::guest::GDTR_BASE, self.gdtr.base);
        vmwrite(vmcs::guest::GDTR_LIMIT, u64::from(self.gdtr.limit));
        vmwrite(vmcs::host::GDTR_BASE, self.host_gdt.0.as_ptr() as u64);

        vmwrite(vmcs::guest::IDTR_BASE, self.idtr.base);
        vmwrite(vmcs::guest::IDTR_LIMIT, u64::from(self.idtr.limit));
        vmwrite(vmcs::host::IDTR_BASE, self.host_idt.0.as_ptr() as u64);

        // The guest runs with the adjusted control registers; the read
        // shadows preserve what it believes it runs with.
        vmwrite(vmcs::control::CR0_READ_SHADOW, self.guest_cr0);
        vmwrite(vmcs::guest::CR0, self.host_cr0);
        vmwrite(vmcs::host::CR0, self.host_cr0);

        vmwrite(vmcs::guest::CR3, self.guest_cr3);
        vmwrite(vmcs::host::CR3, self.host_cr3);

        vmwrite(vmcs::control::CR4_READ_SHADOW, self.guest_cr4);
        vmwrite(vmcs::guest::CR4, self.host_cr4);
        vmwrite(vmcs::host::CR4, self.host_cr4);

        vmwrite(vmcs::guest::IA32_DEBUGCTL_FULL, self.ia32_debug_control);
        vmwrite(vmcs::guest::DR7, self.guest_dr7);
        vmwrite(vmcs::guest::RFLAGS, guest_context.rflags);
    }

    /// Launches the guest.
    ///
    /// This is the checkpoint-and-branch heart of the engine. A host
    /// context is captured here; the first pass arms `vm_exit_flag` and
    /// restores the caller context onto the VMLAUNCH stub, entering the
    /// guest. Every VM exit lands on the trampoline, which restores the
    /// captured host context: execution re-appears right after the capture
    /// with the flag set, and the exit is dispatched.
    ///
    /// Returns only if the dispatcher gave up reading the exit reason.
    fn vm_launch(&mut self, guest_context: &mut Context) {
        /// The stack the host runs on across VM exits.
        #[repr(C, align(16))]
        struct LaunchStack([u8; 0x1500]);

        let mut launch_stack = LaunchStack([0; 0x1500]);
        let stack_end = launch_stack.0.as_mut_ptr() as u64 + size_of::<LaunchStack>() as u64;
        let host_rsp = stack_end - 2 * size_of::<Context>() as u64;
        let local_guest_context = host_rsp as *mut Context;
        let host_context = (host_rsp + size_of::<Context>() as u64) as *mut Context;
        // Safety: both slots are inside `launch_stack`, properly aligned.
        unsafe {
            ptr::write(local_guest_context, Context::new());
            ptr::write(host_context, Context::new());
        }

        // On VM exit the processor loads RSP with the guest-context slot
        // and jumps to the trampoline, which fills that slot.
        vmwrite(vmcs::host::RIP, vm_exit_entry_address());
        vmwrite(vmcs::host::RSP, host_rsp);
        vmwrite(vmcs::guest::RIP, guest_context.rip);
        vmwrite(vmcs::guest::RSP, guest_context.rsp);

        // False on the launch pass, true when re-entered after a VM exit.
        // Release/Acquire keeps the flag update on the correct side of the
        // capture on both passes.
        let vm_exit_flag = AtomicBool::new(false);

        // Keep the flag and the guest context reachable from the captured
        // context so their stack slots cannot be considered dead across the
        // capture/restore pair.
        // Safety: the slots were initialized above.
        unsafe {
            (*host_context).rax = ptr::addr_of!(vm_exit_flag) as u64;
            (*host_context).rbx = ptr::from_mut(guest_context) as u64;
        }

        capture_cpu_context(unsafe { &mut *host_context });

        if vm_exit_flag.load(Ordering::Acquire) {
            // A VM exit brought us back here.
            self.dispatch_vm_exit(unsafe { &mut *local_guest_context });
            return;
        }

        // Patch the captured context into a valid host state: the host GDT
        // knows only the host code selector.
        unsafe {
            (*host_context).cs = self.host_cs;
            (*host_context).ds = 0;
            (*host_context).es = 0;
            (*host_context).fs = 0;
            (*host_context).gs = 0;
            (*host_context).ss = 0;
        }

        self.next_virtual_processor += 1;
        vm_exit_flag.store(true, Ordering::Release);

        // Resume the caller context onto the VMLAUNCH stub: interrupts stay
        // disabled (host RFLAGS), and the guest itself starts with rax = 0,
        // the success return value of the launch.
        guest_context.rip = vmlaunch_address();
        guest_context.rflags = unsafe { (*host_context).rflags };
        guest_context.rax = 0;
        restore_cpu_context(guest_context)
    }

    /// Handles one VM exit and resumes the guest. Returns only when the
    /// exit reason cannot be read, letting the launch unwind.
    fn dispatch_vm_exit(&mut self, guest_context: &mut Context) {
        let Some(exit_reason) = vmread(vmcs::ro::EXIT_REASON) else {
            return;
        };
        guest_context.rip = vmread(vmcs::guest::RIP).unwrap_or(0);

        // Only CPUID is reworked; everything else passes through. The
        // controls request almost no exits in the first place.
        if (exit_reason & 0xff) == EXIT_REASON_CPUID {
            let result = masked_cpuid(
                guest_context.rax,
                cpuid(guest_context.rax as u32, guest_context.rcx as u32),
            );
            guest_context.rax = u64::from(result.eax);
            guest_context.rbx = u64::from(result.ebx);
            guest_context.rcx = u64::from(result.ecx);
            guest_context.rdx = u64::from(result.edx);
        }

        // Move the guest past the intercepted instruction and resume it.
        guest_context.rip += vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN).unwrap_or(0);
        vmwrite(vmcs::guest::RIP, guest_context.rip);

        guest_context.rip = vmresume_address();
        restore_cpu_context(guest_context)
    }
}

/// Runs [`Hypervisor::main`] on the private stack and resumes the caller
/// with the result in `rax`. Entered via a crafted context, so the
/// arguments arrive as raw pointers in `rdi` and `rsi`.
extern "C" fn launch_on_cpu_private_stack(
    hypervisor: *mut Hypervisor,
    caller_context: *mut Context,
) -> ! {
    // Safety: both pointers were produced from live references by
    // `launch_on_cpu` an instant ago.
    let (hypervisor, caller_context) = unsafe { (&mut *hypervisor, &mut *caller_context) };
    caller_context.rax = match hypervisor.main(caller_context) {
        Ok(()) => 0,
        Err(error_code) => {
            error!("launch failed: {error_code}");
            error_code.code()
        }
    };
    restore_cpu_context(caller_context)
}

/// Applies the hypervisor's CPUID edits to a raw CPUID result: leaf 1
/// reports a hypervisor as present, and the vendor leaf returns the
/// signature.
fn masked_cpuid(leaf: u64, mut result: CpuidResult) -> CpuidResult {
    if leaf == 1 {
        result.ecx |= CPUID_HYPERVISOR_PRESENT;
    } else if leaf == CPUID_HYPERVISOR_VENDOR_LEAF {
        result.ebx = HYPERVISOR_SIGNATURE.0;
        result.ecx = HYPERVISOR_SIGNATURE.1;
        result.edx = HYPERVISOR_SIGNATURE.2;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::{masked_cpuid, Hypervisor};
    use crate::config::MAX_MODULE_SIZE;
    use crate::error::LaunchError;
    use core::arch::x86_64::CpuidResult;

    fn boxed_hypervisor() -> Box<Hypervisor> {
        // The state is well over 10MB; keep it off the test thread stack.
        let mut hypervisor = unsafe { Box::<Hypervisor>::new_zeroed().assume_init() };
        hypervisor.next_virtual_processor = 1;
        hypervisor
    }

    #[test]
    fn module_of_exactly_map_capacity_is_accepted() {
        let mut hypervisor = boxed_hypervisor();
        hypervisor.module_size = MAX_MODULE_SIZE;
        assert!(hypervisor.initialize_module_physical_to_virtual().is_ok());
    }

    #[test]
    fn module_one_page_over_map_capacity_is_rejected() {
        let mut hypervisor = boxed_hypervisor();
        hypervisor.module_size = MAX_MODULE_SIZE + 0x1000;
        assert_eq!(
            hypervisor.initialize_module_physical_to_virtual(),
            Err(LaunchError::PhysicalToVirtualCapacity)
        );
        // Nothing was recorded on the failure path.
        assert!(hypervisor.module_physical_to_virtual.is_empty());
    }

    fn raw(eax: u32, ebx: u32, ecx: u32, edx: u32) -> CpuidResult {
        CpuidResult { eax, ebx, ecx, edx }
    }

    #[test]
    fn leaf_1_reports_a_hypervisor() {
        let result = masked_cpuid(1, raw(0x000a_0655, 2, 0x7ffa_fbff & !(1 << 31), 0xbfeb_fbff));
        assert_ne!(result.ecx & (1 << 31), 0);
        // The rest of the leaf is untouched.
        assert_eq!(result.eax, 0x000a_0655);
        assert_eq!(result.edx, 0xbfeb_fbff);
    }

    #[test]
    fn leaf_0_keeps_the_real_bit_31() {
        let result = masked_cpuid(0, raw(0x16, 0x756e_6547, 0x6c65_746e, 0x4965_6e69));
        assert_eq!(result.ecx, 0x6c65_746e);
    }

    #[test]
    fn vendor_leaf_returns_the_signature() {
        let result = masked_cpuid(0x4000_0000, raw(0, 0, 0, 0));
        assert_eq!(result.ebx, 0x5a70_705a);
        assert_eq!(result.ecx, 0x705a_7070);
        assert_eq!(result.edx, 0x7070_5a70);

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&result.ebx.to_le_bytes());
        bytes[4..8].copy_from_slice(&result.ecx.to_le_bytes());
        bytes[8..].copy_from_slice(&result.edx.to_le_bytes());
        assert_eq!(&bytes, b"ZppZppZppZpp");
    }

    #[test]
    fn other_leaves_pass_through() {
        let result = masked_cpuid(0x8000_0000, raw(0x8000_0008, 1, 2, 3));
        assert_eq!(result.ebx, 1);
        assert_eq!(result.ecx, 2);
        assert_eq!(result.edx, 3);
    }
}
