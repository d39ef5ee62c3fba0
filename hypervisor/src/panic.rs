//! The module containing the [`panic_handler`] function.

use crate::x86_instructions::{disable_interrupts, hlt};
use log::error;

#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    error!("{info}");
    loop {
        // Stop execution of the current processor as much as possible.
        disable_interrupts();
        hlt();
    }
}
