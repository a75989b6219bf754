//! 8254 programmable interval timer: the scheduler's heartbeat.
//!
//! Channel 0 runs as a rate generator at [`TICK_HZ`]. Every tick renders
//! the foreground terminal to the hardware frame and then hands control to
//! the round-robin scheduler. EOI goes out first: the tick handler is the
//! one handler that deliberately causes a scheduling event, and the PIC
//! must be ready for the next tick before we swap stacks.

use crate::arch::{self, outb};
use crate::drivers::pic;
use crate::interrupt::{self, IrqHandlerNode, IrqStatus};
use crate::process;
use crate::sched;
use crate::terminal::render;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 3 (square-wave rate generator).
const PIT_MODE: u8 = 0x36;

const PIT_IRQ: usize = 0;
/// Input clock of the 8254 in Hz.
const PIT_INPUT_HZ: u32 = 1_193_182;
/// Scheduler tick rate.
pub const TICK_HZ: u32 = 50;

static mut HANDLER_NODE: IrqHandlerNode = IrqHandlerNode::new(tick_handler);

/// Program channel 0 and register the tick handler.
pub fn init() {
    arch::without_interrupts(|| {
        let divisor = (PIT_INPUT_HZ / TICK_HZ) as u16;
        // SAFETY: mode/divisor programming sequence on ports this driver
        // owns; lobyte then hibyte per the access mode just selected.
        unsafe {
            outb(PIT_COMMAND, PIT_MODE);
            outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
            outb(PIT_CHANNEL0, (divisor >> 8) as u8);
        }
        // SAFETY: HANDLER_NODE is static storage registered exactly once.
        unsafe { interrupt::register_irq_handler(PIT_IRQ, &raw mut HANDLER_NODE) };
        pic::enable_irq(PIT_IRQ);
    });
    log::info!("[PIT] {TICK_HZ} Hz tick");
}

fn tick_handler(_irq: u8) -> IrqStatus {
    pic::send_eoi(PIT_IRQ);

    render::do_render();

    // Until the first process has been started there is nothing to
    // schedule; the PCB under the boot stack reads as not present.
    if process::current_present() {
        sched::do_schedule(false);
    }

    IrqStatus::Handled
}
