//! The module containing various constants that may be modified by developers.

/// The logging level.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Debug;

/// The maximum number of logical processors the hypervisor can virtualize.
/// Per-CPU state (stacks, VMXON/VMCS regions, intermediate GDTs) is sized by
/// this.
pub const MAX_CPUS: usize = 16;

/// The maximum size of the hypervisor module image in bytes. The
/// physical-to-virtual map holds one entry per module page.
pub const MAX_MODULE_SIZE: usize = 50 * 1024 * 1024;

/// The size of the private stack each CPU launches on.
pub const STACK_SIZE: usize = 512 * 1024;

/// The number of preallocated EPT page tables available for demoting 2MB
/// large pages into 4KB mappings while hiding the module.
pub const EPT_TABLE_COUNT: usize = 1024;

/// The number of 8-byte slots reserved for the host GDT, the host IDT and
/// each intermediate GDT. 0x2000 slots cover the architectural maximum GDT
/// limit of 0xffff.
pub const DESCRIPTOR_TABLE_SLOTS: usize = 0x2000;
