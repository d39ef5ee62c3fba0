//! The module containing the image entry point.
//!
//! The external loader pins the current thread to a CPU and calls
//! [`lhv_module_entry`] with the CPU identifier in `rdi` and the
//! physical-to-virtual translator in `rsi`. The stub captures the complete
//! caller context on the caller's stack, patches its RIP/RSP to the
//! caller's resume point, and hands it to the launch engine. On success the
//! context is resumed as a guest; either way the caller observes an
//! ordinary function return with the result in `rax`.

use crate::context::Context;
use crate::hypervisor::Hypervisor;
use core::arch::global_asm;

global_asm!(include_str!("entry.S"));

/// Receives the captured caller context from the entry stub.
#[no_mangle]
extern "C" fn lhv_hypervisor_main(caller_context: &mut Context) -> ! {
    // Safety: the loader contract serializes entries and starts with CPU 0.
    let hypervisor = unsafe { Hypervisor::create_once() };
    hypervisor.launch_on_cpu(caller_context)
}
