//! A late-launch type-2 hypervisor core for Intel VT-x/EPT.
//!
//! The core is loaded into an already-running OS by an external loader as a
//! position-independent image. Called once per logical CPU with affinity
//! pinned, it captures the current execution context, builds its own page
//! table, GDT, IDT and TSS, identity-maps guest physical memory through
//! extended page tables while hiding its own image, enters VMX root
//! operation and resumes the OS as a guest of a minimal VMM. The VMM
//! intercepts almost nothing; it reworks CPUID to advertise itself and
//! passes everything else through.
//!
//! The loader provides, through the entry contract, an RWX allocation for
//! the image, a physical-to-virtual translator usable during
//! initialization, and strictly sequential per-CPU invocation starting at
//! CPU 0. See [`hypervisor::Hypervisor::launch_on_cpu`] for the ABI.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::cast_possible_truncation)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("This crate implements Intel VT-x and only targets x86-64.");

pub mod config;
pub mod context;
mod entry;
pub mod ept;
pub mod error;
mod guard;
pub mod host_page_table;
pub mod hypervisor;
mod logger;
pub mod module_region;
pub mod mtrr;
pub mod os_page_table;
pub mod paging;
#[cfg(all(not(test), target_os = "none"))]
mod panic;
pub mod segmentation;
pub mod small_map;
mod vmx;
mod x86_instructions;

use x86::current::paging::BASE_PAGE_SIZE;

/// The structure representing a single memory page (4KB).
#[derive(Clone, Copy, Debug)]
#[repr(C, align(4096))]
pub struct Page([u8; BASE_PAGE_SIZE]);
const _: () = assert!(core::mem::size_of::<Page>() == 0x1000);

impl Page {
    /// Creates a zeroed page.
    pub const fn new() -> Self {
        Self([0; BASE_PAGE_SIZE])
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}
