//! The module containing the [`Context`] type and the capture/restore
//! primitives.
//!
//! A [`Context`] is the complete unprivileged execution state of a
//! processor. Capturing writes the state as of the capture call site;
//! restoring re-enters exactly that site (or any patched RIP/RSP) and never
//! returns. The pair is the checkpoint-and-branch primitive the launch
//! engine is built on: the code after a capture runs twice, and a flag
//! distinguishes the first pass from the re-entry.
//!
//! The layout is byte-for-byte fixed because the capture and restore
//! routines are assembly; every offset is asserted below.

use core::arch::global_asm;
use core::mem::{offset_of, size_of};

/// The unprivileged execution state of a processor.
#[derive(derivative::Derivative, Clone, Copy)]
#[derivative(Debug)]
#[repr(C, align(16))]
pub struct Context {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    /// The XMM registers.
    #[derivative(Debug = "ignore")]
    pub xmm: [[u64; 2]; 16],
    /// The FXSAVE area (x87/SSE state).
    #[derivative(Debug = "ignore")]
    pub fxsave: [u8; 0x200],
    pub mxcsr: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
}

impl Context {
    /// Creates an all-zero context.
    pub const fn new() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            xmm: [[0; 2]; 16],
            fxsave: [0; 0x200],
            mxcsr: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// The assembly below hard-codes these offsets.
const _: () = assert!(size_of::<Context>() == 0x3a0);
const _: () = assert!(offset_of!(Context, rsp) == 0x20);
const _: () = assert!(offset_of!(Context, rip) == 0x80);
const _: () = assert!(offset_of!(Context, rflags) == 0x88);
const _: () = assert!(offset_of!(Context, xmm) == 0x90);
const _: () = assert!(offset_of!(Context, fxsave) == 0x190);
const _: () = assert!(offset_of!(Context, mxcsr) == 0x390);
const _: () = assert!(offset_of!(Context, cs) == 0x394);
const _: () = assert!(offset_of!(Context, ss) == 0x39e);

extern "C" {
    /// Writes the execution state as of this very call into `context`, such
    /// that restoring it resumes right after the call with all registers
    /// intact.
    fn lhv_capture_context(context: &mut Context);

    /// Loads the complete execution state from `context`. Never returns.
    fn lhv_restore_context(context: &Context) -> !;
}

global_asm!(include_str!("context.S"));

/// Captures the execution state at the call site into `context`.
//
// inline_always: the checkpoint must record the caller's own frame. Behind
// a real call, the recorded RIP/RSP would point into this wrapper's frame,
// whose return slot is long overwritten by the time the checkpoint is
// resumed.
#[allow(clippy::inline_always)]
#[inline(always)]
pub(crate) fn capture_cpu_context(context: &mut Context) {
    // Safety: the routine only writes the pointed-to context.
    unsafe { lhv_capture_context(context) };
}

/// Restores the execution state from `context`; execution continues at
/// `context.rip` and never returns here.
pub(crate) fn restore_cpu_context(context: &Context) -> ! {
    // Safety: the context describes a valid execution state, by construction
    // either captured earlier or patched to enter a known routine.
    unsafe { lhv_restore_context(context) }
}

#[cfg(test)]
mod tests {
    use super::{capture_cpu_context, restore_cpu_context, Context};
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn capture_records_current_selectors_and_stack() {
        let mut context = Context::new();
        capture_cpu_context(&mut context);

        let stack_probe = &context as *const _ as u64;
        // The captured RSP is a plausible current-stack address: within a
        // few pages of a local.
        assert!(context.rsp.abs_diff(stack_probe) < 0x10_0000);
        // Code and stack selectors are whatever this process runs with.
        let (cs, ss): (u16, u16);
        unsafe {
            core::arch::asm!("mov {:x}, cs", out(reg) cs, options(nomem, nostack));
            core::arch::asm!("mov {:x}, ss", out(reg) ss, options(nomem, nostack));
        }
        assert_eq!(context.cs, cs);
        assert_eq!(context.ss, ss);
        assert_ne!(context.rip, 0);
    }

    #[test]
    fn restore_resumes_right_after_the_capture_site() {
        // The checkpoint-and-branch pattern: the code after the capture runs
        // twice, once on the first pass and once re-entered by the restore.
        let passed_checkpoint = AtomicBool::new(false);
        let mut context = Context::new();

        capture_cpu_context(&mut context);
        if !passed_checkpoint.load(Ordering::Acquire) {
            passed_checkpoint.store(true, Ordering::Release);
            restore_cpu_context(&context);
        }
        assert!(passed_checkpoint.load(Ordering::Acquire));
    }
}
