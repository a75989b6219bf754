//! 32-bit x86 protected-mode implementation of the architecture layer.
//!
//! Everything in this module tree assumes a single CPU running in ring 0
//! with paging controlled by [`crate::mm`]. Port I/O goes through the `x86`
//! crate; the handful of privileged instructions that crate cannot express
//! for 32-bit mode (control-register moves, `ltr`, flag save/restore) are
//! inline assembly here.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod multiboot;
pub mod serial;

use core::arch::asm;

pub use context::{pop_iret_context, restore_context, swap_context};
pub use gdt::set_kernel_stack;

use super::EFLAGS_IF;

/// Read a byte from an I/O port.
///
/// # Safety
/// Port reads can have device side effects; the caller must own the port.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    // SAFETY: forwarded contract; `in` itself has no memory effects.
    unsafe { x86::io::inb(port) }
}

/// Write a byte to an I/O port.
///
/// # Safety
/// Port writes program devices; the caller must own the port and uphold the
/// device's protocol.
#[inline]
pub unsafe fn outb(port: u16, value: u8) {
    // SAFETY: forwarded contract.
    unsafe { x86::io::outb(port, value) }
}

/// Write a 16-bit word to an I/O port.
///
/// # Safety
/// Same contract as [`outb`].
#[inline]
pub unsafe fn outw(port: u16, value: u16) {
    // SAFETY: forwarded contract.
    unsafe { x86::io::outw(port, value) }
}

/// Disable maskable interrupts.
#[inline]
pub fn disable_interrupts() {
    // SAFETY: `cli` in ring 0 cannot fault and touches no memory.
    unsafe { asm!("cli", options(nomem, nostack)) };
}

/// Enable maskable interrupts.
#[inline]
pub fn enable_interrupts() {
    // SAFETY: `sti` in ring 0 cannot fault and touches no memory.
    unsafe { asm!("sti", options(nomem, nostack)) };
}

/// Save EFLAGS and disable interrupts, returning the saved flags for a
/// later [`irq_restore`]. The save/restore pair nests correctly inside
/// regions that already run with interrupts off.
#[inline]
pub fn irq_save() -> usize {
    let flags: usize;
    // SAFETY: pushfd/pop is balanced within the block and cli cannot
    // fault in ring 0.
    unsafe {
        asm!("pushfd", "pop {}", "cli", out(reg) flags);
    }
    flags
}

/// Restore the interrupt flag from a value saved by [`irq_save`].
#[inline]
pub fn irq_restore(flags: usize) {
    if flags as u32 & EFLAGS_IF != 0 {
        enable_interrupts();
    }
}

/// Halt until the next interrupt with the caller's interrupt flag left as
/// is. Blocking reads use this with interrupts enabled.
#[inline]
pub fn halt() {
    // SAFETY: hlt resumes on the next interrupt; with IF clear this parks
    // until NMI, which is what a caller with interrupts off asked for.
    unsafe { asm!("hlt", options(nomem, nostack)) };
}

/// Halt until the next interrupt, re-disabling interrupts before returning.
/// This is the scheduler's idle suspension point.
#[inline]
pub fn wait_for_interrupt() {
    // SAFETY: sti;hlt is the canonical atomic idle sequence (sti takes
    // effect after the following instruction), cli restores the caller's
    // interrupts-off invariant.
    unsafe { asm!("sti", "hlt", "cli", options(nomem, nostack)) };
}

/// Current kernel stack pointer. Used by the PCB lookup, which relies on
/// every kernel stack being an aligned 8 KiB region.
#[inline]
pub fn stack_pointer() -> usize {
    let esp: usize;
    // SAFETY: reading ESP has no side effects.
    unsafe { asm!("mov {}, esp", out(reg) esp, options(nomem, nostack)) };
    esp
}

/// Load CR3 with the physical address of a page directory. Also serves as
/// the full (non-global) TLB flush after a page-directory edit.
///
/// # Safety
/// `base` must be the page-aligned physical address of a valid page
/// directory that maps the currently executing code and stack.
#[inline]
pub unsafe fn write_page_dir_base(base: usize) {
    // SAFETY: forwarded contract; the caller guarantees the directory is
    // live and covers the active kernel image.
    unsafe { asm!("mov cr3, {}", in(reg) base, options(nostack)) };
}

/// Turn on paging: load the directory base, enable 4 MiB pages (CR4.PSE),
/// set CR0.PG, then enable global pages (CR4.PGE, which must follow PG per
/// the manual).
///
/// # Safety
/// `page_dir_base` must identity-map the currently executing code, data and
/// stack; every memory access after CR0.PG is set goes through it.
pub unsafe fn enable_paging(page_dir_base: usize) {
    const CR4_PSE: usize = 1 << 4;
    const CR4_PGE: usize = 1 << 7;
    const CR0_PG: usize = 1 << 31;

    // SAFETY: the directory covers the running kernel per the contract;
    // the bit order (PSE, CR3, PG, then PGE) follows the manual.
    unsafe {
        let cr4: usize;
        asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack));
        asm!("mov cr4, {}", in(reg) cr4 | CR4_PSE, options(nostack));
        asm!("mov cr3, {}", in(reg) page_dir_base, options(nostack));
        let cr0: usize;
        asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
        asm!("mov cr0, {}", in(reg) cr0 | CR0_PG, options(nostack));
        asm!("mov cr4, {}", in(reg) cr4 | CR4_PSE | CR4_PGE, options(nostack));
    }
}

/// Halt forever with interrupts off. Terminal state for panics.
pub fn halt_forever() -> ! {
    disable_interrupts();
    loop {
        // SAFETY: hlt with IF clear parks the CPU until NMI/reset.
        unsafe { asm!("hlt", options(nomem, nostack)) };
    }
}
