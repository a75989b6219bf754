//! PS/2 keyboard driver.
//!
//! Scancodes are read from port 0x60 on IRQ 1 and decoded with the
//! `pc_keyboard` crate (scancode set 1, US 104-key layout). Decoded bytes
//! feed the foreground terminal's line discipline; a few chords act on the
//! kernel instead of the input stream:
//!
//! - Ctrl-L clears the foreground terminal,
//! - Ctrl-C kills every process on the foreground terminal with the
//!   terminated status,
//! - Alt-F1..F3 switch the foreground terminal.
//!
//! With `HandleControl::MapLettersToUnicode` the Ctrl chords arrive as
//! C0 control characters, so the handler never inspects raw modifier
//! state except for Alt.

use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, Keyboard, KeyState, ScancodeSet1};
use spin::Mutex;

use crate::arch::{self, inb};
use crate::drivers::pic;
use crate::interrupt::{self, IrqHandlerNode, IrqStatus};
use crate::process;
use crate::terminal;

const KEYBOARD_IRQ: usize = 1;
const KEYBOARD_DATA_PORT: u16 = 0x60;

/// Ctrl-C as mapped by `MapLettersToUnicode`.
const ETX: char = '\u{3}';
/// Backspace.
const BS: char = '\u{8}';
/// Ctrl-L.
const FF: char = '\u{c}';

lazy_static! {
    static ref KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> =
        Mutex::new(Keyboard::new(
            ScancodeSet1::new(),
            layouts::Us104Key,
            HandleControl::MapLettersToUnicode,
        ));
}

/// Alt is the one modifier the decode layer does not fold into characters;
/// track it from raw key events for the terminal-switch chords.
static mut ALT_HELD: bool = false;

static mut HANDLER_NODE: IrqHandlerNode = IrqHandlerNode::new(keyboard_handler);

/// Register the decoder on IRQ 1.
pub fn init() {
    arch::without_interrupts(|| {
        // SAFETY: HANDLER_NODE is static storage registered exactly once.
        unsafe { interrupt::register_irq_handler(KEYBOARD_IRQ, &raw mut HANDLER_NODE) };
        pic::enable_irq(KEYBOARD_IRQ);
    });
    log::info!("[KBD] PS/2 keyboard on IRQ {KEYBOARD_IRQ}");
}

fn keyboard_handler(_irq: u8) -> IrqStatus {
    // EOI goes out before anything that can tear down this stack: the
    // Ctrl-C path may never return here.
    pic::send_eoi(KEYBOARD_IRQ);

    // SAFETY: the data port read is the required acknowledgment of IRQ 1.
    let scancode = unsafe { inb(KEYBOARD_DATA_PORT) };

    let mut kill_foreground = false;
    {
        let mut keyboard = KEYBOARD.lock();
        let Ok(Some(event)) = keyboard.add_byte(scancode) else {
            return IrqStatus::Handled;
        };

        if matches!(event.code, KeyCode::LAlt | KeyCode::RAltGr) {
            // SAFETY: only this handler touches ALT_HELD, interrupts off.
            unsafe { *(&raw mut ALT_HELD) = event.state == KeyState::Down };
        }
        // SAFETY: as above.
        let alt = unsafe { *(&raw const ALT_HELD) };

        match keyboard.process_keyevent(event) {
            Some(DecodedKey::Unicode(ch)) => match ch {
                FF => terminal::clear_screen(terminal::foreground_id()),
                ETX => kill_foreground = true,
                BS => terminal::backspace(terminal::foreground_id()),
                ch if ch.is_ascii() => {
                    terminal::feed(ch as u8, terminal::foreground_id());
                }
                _ => {}
            },
            Some(DecodedKey::RawKey(key)) => {
                let target = match key {
                    KeyCode::F1 => Some(0),
                    KeyCode::F2 => Some(1),
                    KeyCode::F3 => Some(2),
                    _ => None,
                };
                if let (true, Some(tid)) = (alt, target) {
                    terminal::switch_foreground(tid);
                }
            }
            None => {}
        }
    }

    // The keyboard lock is released before teardown: the processes being
    // killed may themselves be blocked inside terminal reads.
    if kill_foreground && process::current_present() {
        process::kill_foreground(process::TERMINATED_STATUS);
    }

    IrqStatus::Handled
}
