//! Tick renderer: offscreen frames to the hardware text frame.
//!
//! Called from the timer handler once per tick. The foreground terminal's
//! back-buffer is copied into whichever of the two hardware-visible pages
//! is currently offscreen, and the VGA start-address register is flipped
//! to it: double buffering, so a tick can never show a half-copied frame.

use crate::arch;
#[cfg(target_arch = "x86")]
use crate::mm::VGA_MEM_BASE;
#[cfg(target_arch = "x86")]
use crate::terminal;
use crate::terminal::{NUM_COLS, NUM_ROWS};

/// CRTC register ports.
const CRTC_INDEX: u16 = 0x3D4;
const CRTC_DATA: u16 = 0x3D5;
/// CRTC register indices.
const REG_START_HIGH: u8 = 0x0C;
const REG_START_LOW: u8 = 0x0D;
const REG_CURSOR_HIGH: u8 = 0x0E;
const REG_CURSOR_LOW: u8 = 0x0F;

/// Bytes per rendered frame (two per cell).
const FRAME_BYTES: usize = 2 * NUM_COLS * NUM_ROWS;

/// The hardware-visible page most recently displayed; flipped every tick.
#[cfg(target_arch = "x86")]
static mut DISPLAY_PAGE: usize = VGA_MEM_BASE;

/// Point the VGA start address at one of the two display pages.
#[cfg(target_arch = "x86")]
fn set_vga_start(page: usize) {
    assert_eq!(page & 0xFFF, 0, "display page not 4 KiB aligned");
    assert!(
        (VGA_MEM_BASE..VGA_MEM_BASE + 0x8000).contains(&page),
        "display page outside VGA memory"
    );
    // The register addresses 16-bit words on the host side, hence the
    // shift by one.
    let offset = ((page - VGA_MEM_BASE) >> 1) as u16;
    // SAFETY: CRTC index/data writes; callers hold interrupts off so the
    // two-register update is not torn.
    unsafe {
        arch::outb(CRTC_INDEX, REG_START_HIGH);
        arch::outb(CRTC_DATA, (offset >> 8) as u8);
        arch::outb(CRTC_INDEX, REG_START_LOW);
        arch::outb(CRTC_DATA, offset as u8);
    }
}

/// Program the hardware cursor. Only the foreground terminal's cursor is
/// ever shown; callers check that and hold interrupts off.
pub fn update_hw_cursor(x: usize, y: usize) {
    let pos = (y * NUM_COLS + x) as u16;
    // SAFETY: CRTC index/data writes under the callers' interrupts-off
    // region.
    unsafe {
        arch::outb(CRTC_INDEX, REG_CURSOR_HIGH);
        arch::outb(CRTC_DATA, (pos >> 8) as u8);
        arch::outb(CRTC_INDEX, REG_CURSOR_LOW);
        arch::outb(CRTC_DATA, pos as u8);
    }
}

/// Copy the foreground terminal's frame to the offscreen display page and
/// flip the start address to it. Runs in the timer interrupt.
#[cfg(target_arch = "x86")]
pub fn do_render() {
    let foreground = terminal::foreground_id();
    // SAFETY: the render path is the only writer of the display pages and
    // of DISPLAY_PAGE, and it runs with interrupts off in the tick
    // handler; the source back-buffer is a fixed page that outlives the
    // copy.
    unsafe {
        let next = *(&raw const DISPLAY_PAGE) ^ 0x1000;
        let src = crate::terminal::frame_source(foreground);
        core::ptr::copy_nonoverlapping(src, next as *mut u8, FRAME_BYTES);
        set_vga_start(next);
        *(&raw mut DISPLAY_PAGE) = next;
    }
}

/// On the host there is no hardware frame to flip.
#[cfg(not(target_arch = "x86"))]
pub fn do_render() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_copy_size_matches_the_text_mode() {
        assert_eq!(FRAME_BYTES, 4000);
        // Both display pages fit inside one page each.
        assert!(FRAME_BYTES <= 4096);
        assert_eq!(crate::mm::DOUBLE_BUFFER_BASE, crate::mm::VGA_MEM_BASE + 0x1000);
    }
}
