//! Terminal multiplexer: three logical terminals sharing one screen.
//!
//! Each terminal owns an offscreen 80×25 text frame (a fixed low-memory
//! page, so the user vidmap can target it), a cursor, and a 128-byte
//! line-discipline buffer. Output always goes to the owning terminal's
//! offscreen frame; the renderer ([`render`]) copies the foreground frame
//! to the hardware every timer tick, which is what makes background
//! writes invisible until their terminal is switched in.
//!
//! Input is line-buffered: bytes accumulate until a newline closes the
//! line, at which point a blocked `stdin` read takes the whole buffer.

pub mod render;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch;
use crate::process;

pub const NUM_TERMINALS: usize = 3;
pub const NUM_COLS: usize = 80;
pub const NUM_ROWS: usize = 25;
/// Line-discipline capacity, newline included.
pub const LINE_BUFFER_SIZE: usize = 128;

/// Text attribute: light grey on black.
const ATTRIB: u8 = 0x07;
/// Tabs render and erase as four columns.
const TAB_WIDTH: usize = 4;

/// One VGA text-mode cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VgaChar {
    pub glyph: u8,
    pub attr: u8,
}

const BLANK: VgaChar = VgaChar {
    glyph: b' ',
    attr: ATTRIB,
};

/// An 80×25 text frame, one page per terminal so the vidmap page table can
/// point straight at it.
#[repr(C, align(4096))]
pub struct TextFrame(pub [[VgaChar; NUM_COLS]; NUM_ROWS]);

impl TextFrame {
    pub const fn blank() -> Self {
        Self([[BLANK; NUM_COLS]; NUM_ROWS])
    }

    fn clear(&mut self) {
        self.0 = [[BLANK; NUM_COLS]; NUM_ROWS];
    }

    /// Scroll one line up, blanking the bottom row.
    fn scroll(&mut self) {
        self.0.copy_within(1.., 0);
        self.0[NUM_ROWS - 1] = [BLANK; NUM_COLS];
    }
}

/// Cursor and line-discipline state of one logical terminal.
pub struct Terminal {
    cursor_x: usize,
    cursor_y: usize,
    buffer: [u8; LINE_BUFFER_SIZE],
    buffer_index: usize,
    input_ready: bool,
}

impl Terminal {
    pub const fn new() -> Self {
        Self {
            cursor_x: 0,
            cursor_y: 0,
            buffer: [0; LINE_BUFFER_SIZE],
            buffer_index: 0,
            input_ready: false,
        }
    }

    pub fn input_ready(&self) -> bool {
        self.input_ready
    }

    /// Put one byte at the cursor. Newline and carriage return start a new
    /// line, tab renders as four spaces, everything else is a glyph. The
    /// frame scrolls when the cursor runs off the bottom.
    pub fn putc(&mut self, frame: &mut TextFrame, c: u8) {
        match c {
            b'\t' => {
                for _ in 0..TAB_WIDTH {
                    self.putc(frame, b' ');
                }
                return;
            }
            b'\n' | b'\r' => {
                self.cursor_y += 1;
                self.cursor_x = 0;
            }
            _ => {
                frame.0[self.cursor_y][self.cursor_x] = VgaChar { glyph: c, attr: ATTRIB };
                self.cursor_x += 1;
                self.cursor_y += self.cursor_x / NUM_COLS;
                self.cursor_x %= NUM_COLS;
            }
        }
        if self.cursor_y >= NUM_ROWS {
            frame.scroll();
            self.cursor_y = NUM_ROWS - 1;
        }
    }

    /// Line-discipline byte arrival. A byte landing on a closed line first
    /// reopens it; a full buffer accepts only the closing newline.
    pub fn feed(&mut self, frame: &mut TextFrame, c: u8) {
        if self.input_ready {
            self.reset_line();
        }
        if c == 0 {
            return;
        }
        let fits = self.buffer_index < LINE_BUFFER_SIZE - 1
            || (self.buffer_index == LINE_BUFFER_SIZE - 1 && c == b'\n');
        if !fits {
            return;
        }
        self.buffer[self.buffer_index] = c;
        self.buffer_index += 1;
        self.putc(frame, c);
        if c == b'\n' {
            self.input_ready = true;
        }
    }

    /// Erase the last buffered byte: one displayed column, or four for a
    /// tab, wrapping to the end of the previous row as needed.
    pub fn backspace(&mut self, frame: &mut TextFrame) {
        if self.buffer_index == 0 {
            return;
        }
        self.buffer_index -= 1;
        let columns = if self.buffer[self.buffer_index] == b'\t' {
            TAB_WIDTH
        } else {
            1
        };
        for _ in 0..columns {
            if self.cursor_x == 0 {
                if self.cursor_y == 0 {
                    break;
                }
                self.cursor_y -= 1;
                self.cursor_x = NUM_COLS - 1;
            } else {
                self.cursor_x -= 1;
            }
            frame.0[self.cursor_y][self.cursor_x] = BLANK;
        }
    }

    /// Copy the closed line into `out` (up to its capacity), then reopen
    /// the buffer. Returns the bytes copied.
    pub fn take_line(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.buffer_index);
        out[..count].copy_from_slice(&self.buffer[..count]);
        self.reset_line();
        count
    }

    fn reset_line(&mut self) {
        self.buffer = [0; LINE_BUFFER_SIZE];
        self.buffer_index = 0;
        self.input_ready = false;
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor_x, self.cursor_y)
    }
}

static TERMINALS: [Mutex<Terminal>; NUM_TERMINALS] = [
    Mutex::new(Terminal::new()),
    Mutex::new(Terminal::new()),
    Mutex::new(Terminal::new()),
];

static FOREGROUND: AtomicUsize = AtomicUsize::new(0);

/// Offscreen frame of a terminal: a fixed physical page on the target so
/// the vidmap page table can reference it, plain static storage on the
/// host so the logic is testable.
#[cfg(target_arch = "x86")]
fn frame_ptr(tid: usize) -> *mut TextFrame {
    assert!(tid < NUM_TERMINALS, "terminal id {tid} out of bounds");
    (crate::mm::TERMINAL_BUFFER_BASE + tid * crate::mm::PAGE_SIZE) as *mut TextFrame
}

#[cfg(not(target_arch = "x86"))]
static mut HOST_FRAMES: [TextFrame; NUM_TERMINALS] = [
    TextFrame::blank(),
    TextFrame::blank(),
    TextFrame::blank(),
];

#[cfg(not(target_arch = "x86"))]
fn frame_ptr(tid: usize) -> *mut TextFrame {
    assert!(tid < NUM_TERMINALS, "terminal id {tid} out of bounds");
    // SAFETY: address-of only; dereferences are serialized by the
    // terminal's lock exactly as on the target.
    unsafe { (&raw mut HOST_FRAMES[0]).add(tid) }
}

/// Run `f` with a terminal's state and frame, interrupts off. All mutation
/// of terminal state funnels through here.
fn with_terminal<R>(tid: usize, f: impl FnOnce(&mut Terminal, &mut TextFrame) -> R) -> R {
    arch::without_interrupts(|| {
        let mut term = TERMINALS[tid].lock();
        // SAFETY: the frame belongs to terminal `tid`, and its lock is
        // held; the renderer only ever reads frames.
        let frame = unsafe { &mut *frame_ptr(tid) };
        f(&mut term, frame)
    })
}

/// Blank every terminal's offscreen frame.
pub fn init() {
    for tid in 0..NUM_TERMINALS {
        with_terminal(tid, |_, frame| frame.clear());
    }
}

/// The terminal currently shown on the hardware frame.
pub fn foreground_id() -> usize {
    FOREGROUND.load(Ordering::Relaxed)
}

/// Make `tid` the foreground terminal and restore its hardware cursor.
/// Output routing does not change: every process keeps writing to its own
/// terminal's offscreen frame, and the renderer picks up the new
/// foreground on the next tick.
pub fn switch_foreground(tid: usize) {
    if tid >= NUM_TERMINALS || tid == foreground_id() {
        return;
    }
    arch::without_interrupts(|| {
        FOREGROUND.store(tid, Ordering::Relaxed);
        let (x, y) = TERMINALS[tid].lock().cursor();
        render::update_hw_cursor(x, y);
    });
}

/// Byte arrival from the keyboard for terminal `tid`.
pub fn feed(c: u8, tid: usize) {
    with_terminal(tid, |term, frame| term.feed(frame, c));
    sync_hw_cursor(tid);
}

/// Keyboard backspace for terminal `tid`.
pub fn backspace(tid: usize) {
    with_terminal(tid, |term, frame| term.backspace(frame));
    sync_hw_cursor(tid);
}

/// Clear a terminal's frame and home its cursor.
pub fn clear_screen(tid: usize) {
    with_terminal(tid, |term, frame| {
        frame.clear();
        term.cursor_x = 0;
        term.cursor_y = 0;
    });
    sync_hw_cursor(tid);
}

/// Write a byte stream to terminal `tid`; returns the count written.
pub fn write_bytes(tid: usize, bytes: &[u8]) -> usize {
    with_terminal(tid, |term, frame| {
        for &c in bytes {
            term.putc(frame, c);
        }
    });
    sync_hw_cursor(tid);
    bytes.len()
}

/// Copy a closed input line from terminal `tid` into `out` without
/// blocking; the caller has already observed `input_ready`.
pub fn read_line(tid: usize, out: &mut [u8]) -> usize {
    with_terminal(tid, |term, _| term.take_line(out))
}

/// Raw view of a terminal's frame for the renderer's bulk copy.
#[cfg(target_arch = "x86")]
pub(crate) fn frame_source(tid: usize) -> *const u8 {
    frame_ptr(tid) as *const u8
}

fn sync_hw_cursor(tid: usize) {
    if tid != foreground_id() {
        return;
    }
    arch::without_interrupts(|| {
        let (x, y) = TERMINALS[tid].lock().cursor();
        render::update_hw_cursor(x, y);
    });
}

/// stdin driver read: block until the owning terminal closes a line, then
/// hand the whole buffer over and reopen it.
pub fn stdin_read(buf: &mut [u8]) -> i32 {
    let tid = process::current().1.terminal_id;
    loop {
        let ready = arch::without_interrupts(|| TERMINALS[tid].lock().input_ready());
        if ready {
            break;
        }
        arch::halt();
    }
    read_line(tid, buf) as i32
}

/// stdout driver write: render through the owning terminal.
pub fn stdout_write(buf: &[u8]) -> i32 {
    let tid = process::current().1.terminal_id;
    write_bytes(tid, buf) as i32
}

/// Install stdin and stdout on a fresh descriptor table.
pub fn install_std_fds(fds: &mut [crate::fd::FdEntry; crate::fd::FD_PER_PROC]) {
    fds[0].clear();
    fds[0].driver = crate::fd::FdDriver::Stdin;
    fds[0].present = true;
    fds[1].clear();
    fds[1].driver = crate::fd::FdDriver::Stdout;
    fds[1].present = true;
}

/// Allocate one shell per terminal and jump into the first. The boot stack
/// is abandoned here; it aliases the first shell's kernel stack.
pub fn start_shells() -> ! {
    arch::disable_interrupts();
    let first = process::allocate(None, b"shell", 0).expect("unable to start first shell");
    for tid in 1..NUM_TERMINALS {
        if process::allocate(None, b"shell", tid).is_none() {
            log::warn!("[TERM] no PCB free for shell on terminal {tid}");
        }
    }
    crate::sched::jump_to(first)
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;

    fn flat(frame: &TextFrame, row: usize) -> alloc::string::String {
        frame.0[row].iter().map(|c| c.glyph as char).collect()
    }

    #[test]
    fn echo_and_round_trip() {
        let mut term = Terminal::new();
        let mut frame = TextFrame::blank();
        for &c in b"hi\n" {
            term.feed(&mut frame, c);
        }
        assert!(term.input_ready());

        let mut out = [0u8; 8];
        let n = term.take_line(&mut out);
        assert_eq!(n, 3);
        assert_eq!(&out[..3], b"hi\n");
        assert!(!term.input_ready());
        // The bytes were echoed to the frame.
        assert!(flat(&frame, 0).starts_with("hi"));
    }

    #[test]
    fn short_reads_truncate_without_overflow() {
        let mut term = Terminal::new();
        let mut frame = TextFrame::blank();
        for &c in b"abcdef\n" {
            term.feed(&mut frame, c);
        }
        let mut out = [0u8; 4];
        assert_eq!(term.take_line(&mut out), 4);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn full_buffer_accepts_only_newline() {
        let mut term = Terminal::new();
        let mut frame = TextFrame::blank();
        for _ in 0..LINE_BUFFER_SIZE + 20 {
            term.feed(&mut frame, b'x');
        }
        assert_eq!(term.buffer_index, LINE_BUFFER_SIZE - 1);
        assert!(!term.input_ready());
        term.feed(&mut frame, b'\n');
        assert_eq!(term.buffer_index, LINE_BUFFER_SIZE);
        assert!(term.input_ready());
    }

    #[test]
    fn arrival_on_closed_line_reopens_it() {
        let mut term = Terminal::new();
        let mut frame = TextFrame::blank();
        for &c in b"old\n" {
            term.feed(&mut frame, c);
        }
        assert!(term.input_ready());
        term.feed(&mut frame, b'n');
        assert!(!term.input_ready());
        assert_eq!(term.buffer_index, 1);
        assert_eq!(term.buffer[0], b'n');
    }

    #[test]
    fn backspace_erases_tab_as_four_columns() {
        let mut term = Terminal::new();
        let mut frame = TextFrame::blank();
        term.feed(&mut frame, b'a');
        term.feed(&mut frame, b'\t');
        assert_eq!(term.cursor(), (5, 0));
        term.backspace(&mut frame);
        assert_eq!(term.cursor(), (1, 0));
        term.backspace(&mut frame);
        assert_eq!(term.cursor(), (0, 0));
        // Nothing left to erase; a further backspace is a no-op.
        term.backspace(&mut frame);
        assert_eq!(term.cursor(), (0, 0));
        assert_eq!(flat(&frame, 0).trim_end(), "");
    }

    #[test]
    fn backspace_wraps_to_previous_row() {
        let mut term = Terminal::new();
        let mut frame = TextFrame::blank();
        // Fill one row exactly; cursor wraps to the next row.
        for _ in 0..NUM_COLS {
            term.feed(&mut frame, b'w');
        }
        assert_eq!(term.cursor(), (0, 1));
        term.backspace(&mut frame);
        assert_eq!(term.cursor(), (NUM_COLS - 1, 0));
    }

    #[test]
    fn newline_scrolls_at_the_bottom() {
        let mut term = Terminal::new();
        let mut frame = TextFrame::blank();
        term.putc(&mut frame, b'A');
        for _ in 0..NUM_ROWS {
            term.putc(&mut frame, b'\n');
        }
        term.putc(&mut frame, b'B');
        // 'A' scrolled off; 'B' sits on the last row.
        assert_eq!(term.cursor().1, NUM_ROWS - 1);
        assert_eq!(frame.0[NUM_ROWS - 1][0].glyph, b'B');
        assert!(!flat(&frame, 0).contains('A'));
    }

    #[test]
    fn writes_to_background_terminals_stay_offscreen() {
        // write_bytes on terminal 0 must only touch terminal 0's frame.
        write_bytes(0, b"zero");
        write_bytes(1, b"one");
        // SAFETY: shared reads of the host frame statics after the writes
        // above completed.
        let f0 = unsafe { &*frame_ptr(0) };
        // SAFETY: as above.
        let f1 = unsafe { &*frame_ptr(1) };
        assert_eq!(f0.0[0][0].glyph, b'z');
        assert_eq!(f1.0[0][0].glyph, b'o');
    }
}
