//! Process manager: the PCB arena, process creation, and teardown.
//!
//! Kernel stacks are six contiguous 8 KiB regions growing down from
//! [`KERNEL_STACKS_TOP`]; each stack's lowest bytes overlay that process's
//! [`Pcb`]. The aliasing is load-bearing: masking any kernel stack pointer
//! down to its 8 KiB base yields the PCB of the process the stack belongs
//! to, so "the current process" is carried by stack identity rather than a
//! global, and switching stacks switches it atomically.
//!
//! PCB pointers are only ever taken with interrupts disabled or from the
//! owning process's own kernel thread; the arena owns all six slots and
//! liveness is exactly the `present` bit.

use core::ptr;

use crate::arch::{self, Context, UserIretFrame, EFLAGS_IF, EFLAGS_RESERVED, USER_CS, USER_DS};
use crate::fd::{FdEntry, FD_PER_PROC};
use crate::fs;
use crate::mm;
use crate::sched;
use crate::terminal;

/// Fixed arena size; allocation beyond it fails with −1, silently.
pub const NUM_PROCESSES: usize = 6;
/// 8 KiB kernel stacks.
pub const KERNEL_STACK_SIZE: usize = 1 << 13;
/// Stacks grow down from the top of the 4..8 MiB kernel page.
pub const KERNEL_STACKS_TOP: usize = 0x0080_0000;
/// Command line capacity, terminator included.
pub const ARG_LENGTH: usize = 128;

/// Largest status a user `halt` can report.
pub const MAX_USER_STATUS: i32 = 255;
/// Reported by `execute` when the child died on a CPU exception.
pub const EXCEPTION_STATUS: i32 = 256;
/// Reported by `execute` when the child was killed with Ctrl-C.
pub const TERMINATED_STATUS: i32 = 257;

/// Little-endian `\x7FELF`.
const ELF_MAGIC: u32 = 0x464C_457F;
/// Byte offset of the entry-point field in the ELF header.
const ELF_ENTRY_OFFSET: u32 = 24;

/// Per-process kernel state, living at the base of the process's stack.
#[repr(C)]
pub struct Pcb {
    /// Parent PID; `None` for a terminal's root shell. A non-owning index
    /// into the arena, which is what keeps parent/child links acyclic for
    /// the borrow checker: the arena owns, everyone else indexes.
    pub parent: Option<usize>,
    /// Saved kernel context while this process is switched out.
    pub context: Context,
    pub present: bool,
    /// Eligible for the round-robin scheduler.
    pub running: bool,
    /// Whether the process has an active video mapping.
    pub vidmap: bool,
    pub exit_code: i32,
    pub fds: [FdEntry; FD_PER_PROC],
    /// Command-line tail (after the program name), NUL-terminated.
    pub args: [u8; ARG_LENGTH],
    /// Program image inode.
    pub inode: u32,
    /// Terminal owning this process's stdin/stdout, `0..NUM_TERMINALS`.
    pub terminal_id: usize,
}

impl Pcb {
    pub const fn cleared() -> Self {
        Self {
            parent: None,
            context: Context::zeroed(),
            present: false,
            running: false,
            vidmap: false,
            exit_code: 0,
            fds: [const { FdEntry::closed() }; FD_PER_PROC],
            args: [0; ARG_LENGTH],
            inode: 0,
            terminal_id: 0,
        }
    }

    /// Stored argument bytes up to the terminator.
    pub fn arg_bytes(&self) -> &[u8] {
        let len = self.args.iter().position(|&b| b == 0).unwrap_or(0);
        &self.args[..len]
    }
}

/// Base address of the kernel stack containing `esp`.
pub fn stack_base_of(esp: usize) -> usize {
    // The minus one keeps an empty stack (esp at the next region's base)
    // inside its own region.
    (esp - 1) & !(KERNEL_STACK_SIZE - 1)
}

/// One past the top of a PID's kernel stack.
pub fn stack_top(pid: usize) -> usize {
    KERNEL_STACKS_TOP - pid * KERNEL_STACK_SIZE
}

fn pid_of_stack_base(base: usize) -> usize {
    (KERNEL_STACKS_TOP - base) / KERNEL_STACK_SIZE - 1
}

fn pcb_ptr(pid: usize) -> *mut Pcb {
    assert!(pid < NUM_PROCESSES, "PID {pid} outside the arena");
    (KERNEL_STACKS_TOP - (pid + 1) * KERNEL_STACK_SIZE) as *mut Pcb
}

/// Shared view of a PCB.
pub fn pcb(pid: usize) -> &'static Pcb {
    // SAFETY: the arena is initialized before any caller exists, and
    // shared reads of PCB fields are only acted upon inside
    // interrupts-off regions on the single CPU.
    unsafe { &*pcb_ptr(pid) }
}

/// Exclusive view of a PCB.
///
/// # Safety
/// The caller must hold interrupts disabled, or be the owning process
/// mutating its own PCB from its own kernel thread.
pub unsafe fn pcb_mut(pid: usize) -> &'static mut Pcb {
    // SAFETY: forwarded contract.
    unsafe { &mut *pcb_ptr(pid) }
}

/// PID of the process whose kernel stack we are running on.
pub fn current_pid() -> usize {
    pid_of_stack_base(stack_base_of(arch::stack_pointer()))
}

/// The current process: PID plus a shared view of its PCB.
pub fn current() -> (usize, &'static Pcb) {
    let pid = current_pid();
    (pid, pcb(pid))
}

/// Exclusive view of the current PCB. The owning kernel thread is the only
/// mutator of its own PCB outside teardown, which runs interrupts-off.
pub fn current_pcb_mut() -> &'static mut Pcb {
    // SAFETY: see above; stack identity makes this the owner's own PCB.
    unsafe { pcb_mut(current_pid()) }
}

/// Whether the PCB under the running stack is live. False until the first
/// process has been started, which is what keeps the timer from invoking
/// the scheduler during bring-up.
pub fn current_present() -> bool {
    current().1.present
}

/// Mark the whole arena free. Runs before interrupts are enabled, so the
/// boot stack (which aliases PID 0's stack) reads as not-present too.
pub fn init() {
    for pid in 0..NUM_PROCESSES {
        // SAFETY: early boot, single thread, arena memory is ours; the
        // write gives every slot a fully valid cleared state.
        unsafe { pcb_ptr(pid).write(Pcb::cleared()) };
    }
    log::info!(
        "[PROC] {} kernel stacks of {} KiB below {KERNEL_STACKS_TOP:#x}",
        NUM_PROCESSES,
        KERNEL_STACK_SIZE / 1024
    );
}

/// Split a command line into the program name and the argument tail:
/// leading whitespace, a name, whitespace, then everything up to the end.
fn parse_cmdline(cmdline: &[u8]) -> (&[u8], &[u8]) {
    let is_ws = |b: &u8| *b == b' ' || *b == b'\t';
    let name_start = cmdline.iter().position(|b| !is_ws(b)).unwrap_or(cmdline.len());
    let rest = &cmdline[name_start..];
    let name_end = rest.iter().position(is_ws).unwrap_or(rest.len());
    let (name, tail) = rest.split_at(name_end);
    let arg_start = tail.iter().position(|b| !is_ws(b)).unwrap_or(tail.len());
    (name, &tail[arg_start..])
}

/// Allocate and populate a PCB for `cmdline`, without running it.
///
/// Claims the first free slot, resolves and validates the program (a
/// regular file, ELF magic, small enough for the user window), stores the
/// argument tail, installs the terminal's stdin/stdout, and builds an
/// initial context that enters [`proc_entry`] on the fresh stack. Any
/// failure rolls the claimed slot back. Returns the new PID.
///
/// Interrupts must be disabled: a partially built PCB must not be seen by
/// the scheduler or by teardown sweeps.
pub fn allocate(parent: Option<usize>, cmdline: &[u8], terminal_id: usize) -> Option<usize> {
    if cmdline.len() > ARG_LENGTH - 1 {
        return None;
    }
    let pid = (0..NUM_PROCESSES).find(|&p| !pcb(p).present)?;
    // SAFETY: interrupts are off per the contract and the slot was free;
    // nothing else references it until `present` is set and we return.
    let new = unsafe { pcb_mut(pid) };
    *new = Pcb::cleared();
    new.present = true;
    new.running = true;
    new.parent = parent;
    new.terminal_id = terminal_id;

    let (name, args) = parse_cmdline(cmdline);

    let rollback = |new: &mut Pcb| {
        new.present = false;
        None::<usize>
    };

    let Some(dentry) = fs::image().dentry_by_name(name) else {
        return rollback(new);
    };
    if dentry.dtype != fs::TYPE_FILE {
        return rollback(new);
    }
    let mut magic = [0u8; 4];
    if fs::image().read_data(dentry.inode, 0, &mut magic) != 4 {
        return rollback(new);
    }
    if u32::from_le_bytes(magic) != ELF_MAGIC {
        return rollback(new);
    }
    let Some(length) = fs::image().file_length(dentry.inode) else {
        return rollback(new);
    };
    if length as usize > mm::USER_VMEM_END - mm::USER_PROG_START {
        return rollback(new);
    }
    new.inode = dentry.inode;
    new.args[..args.len()].copy_from_slice(args);
    new.args[args.len()] = 0;

    terminal::install_std_fds(&mut new.fds);

    // SAFETY: the stack region belongs to the just-claimed slot and no
    // thread of control runs on it yet (the boot stack aliases PID 0's
    // region, but only its deepest bytes, far below the top).
    unsafe {
        arch::make_context(&mut new.context, stack_top(pid) as *mut u8, proc_entry, &[]);
    }
    Some(pid)
}

/// First code a new process runs, on its own kernel stack.
///
/// Switches the address space to the new PID, copies the whole program
/// image into the user window, fabricates a ring-3 interrupt return frame
/// (user selectors, ELF entry point, stack at the top of the window,
/// interrupts enabled), points the TSS at this kernel stack, and performs
/// the one atomic pop-and-iret into user mode. Never returns.
extern "C" fn proc_entry(_buf: *mut u8, _len: u32) -> ! {
    // Context restore leaves interrupts disabled.
    arch::enable_interrupts();
    let (pid, pcb) = current();

    arch::without_interrupts(|| mm::set_user_page(pid));

    // SAFETY: the user window is now mapped for this PID and the image
    // was validated to fit below its top at allocation time.
    let user_image = unsafe {
        core::slice::from_raw_parts_mut(
            mm::USER_PROG_START as *mut u8,
            mm::USER_VMEM_END - mm::USER_PROG_START,
        )
    };
    if fs::image().read_data(pcb.inode, 0, user_image) < 0 {
        panic!("unable to read program image for PID {pid}");
    }

    // SAFETY: the header lies inside the image just copied.
    let entry_point =
        unsafe { ((mm::USER_PROG_START + ELF_ENTRY_OFFSET as usize) as *const u32).read() };

    let mut frame = UserIretFrame {
        base: arch::IretFrame::zeroed(),
        esp: mm::USER_VMEM_END as u32,
        ss: USER_DS as u32,
    };
    frame.base.ds = USER_DS as u32;
    frame.base.es = USER_DS as u32;
    frame.base.fs = USER_DS as u32;
    frame.base.gs = USER_DS as u32;
    frame.base.cs = USER_CS as u32;
    frame.base.eip = entry_point;
    // Only the interrupt flag and the always-one reserved bit; status
    // flags start clear.
    frame.base.eflags = EFLAGS_IF | EFLAGS_RESERVED;

    arch::disable_interrupts();
    arch::set_kernel_stack(stack_top(pid));
    // SAFETY: the frame is complete, lives on this kernel stack, and the
    // TSS now names this stack for the next kernel entry.
    unsafe { arch::pop_iret_context(&frame.base) }
}

/// Close every present descriptor, best-effort. A failing driver close is
/// logged and the sweep continues; the slots end up absent regardless.
fn close_all_fds(pcb: &mut Pcb) {
    for (i, fd) in pcb.fds.iter_mut().enumerate() {
        if fd.present {
            fd.present = false;
            if fd.close() != 0 {
                log::warn!("[PROC] close of fd {i} failed during teardown");
            }
        }
    }
}

/// Tear down the current process and leave its stack forever.
///
/// The exit code is parked in the PCB for the parent's `execute` to
/// collect. With a parent, control jumps straight back into it (it was
/// blocked in `execute`); an orphan self-clears and a fresh `shell` is
/// spawned on the same terminal. Returns only if the current PCB is not
/// present, which no syscall path can observe.
pub fn kill_current(exit_code: i32) {
    let pid = current_pid();
    if !pcb(pid).present {
        return;
    }
    // Interrupts stay off to the end: PCB pointers must not go stale
    // under a concurrent teardown, and we never return to this stack.
    arch::disable_interrupts();
    // SAFETY: interrupts are off.
    let process = unsafe { pcb_mut(pid) };
    process.exit_code = exit_code;
    process.running = false;
    close_all_fds(process);

    match process.parent {
        Some(parent) => {
            // SAFETY: interrupts are off; the parent is present, blocked
            // inside execute.
            unsafe { pcb_mut(parent).running = true };
            sched::jump_to(parent)
        }
        None => {
            let terminal_id = process.terminal_id;
            *process = Pcb::cleared();
            let Some(shell) = allocate(None, b"shell", terminal_id) else {
                panic!("unable to respawn shell on terminal {terminal_id}");
            };
            sched::jump_to(shell)
        }
    }
}

/// Tear down every running process owned by the foreground terminal.
///
/// Used by the Ctrl-C path. Applies the same per-process teardown as
/// [`kill_current`]; if the current process was among the victims, the
/// scheduler is entered jump-style so the dead stack is never resumed.
pub fn kill_foreground(exit_code: i32) {
    let foreground = terminal::foreground_id();
    let flags = arch::irq_save();

    let current = current_pid();
    let mut need_jump = false;
    for pid in 0..NUM_PROCESSES {
        // SAFETY: interrupts are off for the whole sweep.
        let process = unsafe { pcb_mut(pid) };
        if !(process.present && process.running && process.terminal_id == foreground) {
            continue;
        }
        if pid == current {
            need_jump = true;
        }
        process.exit_code = exit_code;
        process.running = false;
        close_all_fds(process);
        match process.parent {
            Some(parent) => {
                // SAFETY: interrupts are off.
                unsafe { pcb_mut(parent).running = true };
            }
            None => {
                let terminal_id = process.terminal_id;
                *process = Pcb::cleared();
                if allocate(None, b"shell", terminal_id).is_none() {
                    panic!("unable to respawn shell on terminal {terminal_id}");
                }
            }
        }
    }

    if need_jump {
        // Never returns; the current stack just died.
        sched::do_schedule(true);
    }
    arch::irq_restore(flags);
}

/// The `execute` system call: run a program and return its exit status.
pub fn sys_execute(arg1: u32, _arg2: u32, _arg3: u32) -> i32 {
    let cmd_ptr = arg1 as usize;
    if cmd_ptr == 0 {
        return -1;
    }
    let Ok(len) = mm::check_user_cstring(cmd_ptr, ARG_LENGTH - 1) else {
        return -1;
    };
    let mut cmdline = [0u8; ARG_LENGTH];
    // SAFETY: check_user_cstring walked exactly these bytes in the user
    // window.
    let user = unsafe { core::slice::from_raw_parts(cmd_ptr as *const u8, len) };
    cmdline[..len].copy_from_slice(user);

    // Interrupts off so the child cannot vanish between allocation and
    // switch, and so we are not left unrunnable without being scheduled
    // away for good.
    let flags = arch::irq_save();
    let parent = current_pid();
    let Some(child) = allocate(Some(parent), &cmdline[..len], pcb(parent).terminal_id) else {
        arch::irq_restore(flags);
        return -1;
    };
    // The parent sleeps until teardown of the child marks it running.
    // SAFETY: interrupts are off.
    unsafe { pcb_mut(parent).running = false };
    if sched::switch_to(child).is_err() {
        panic!("unable to switch to freshly allocated PID {child}");
    }

    // Back from the child's whole lifetime: reap it.
    let exit_code = pcb(child).exit_code;
    // SAFETY: interrupts are off again (switch_to restores them off).
    unsafe { pcb_mut(child).present = false };
    arch::irq_restore(flags);
    exit_code
}

/// The `halt` system call. The status is truncated to the low byte; the
/// reserved sentinels above 255 are produced only by the kernel itself.
pub fn sys_halt(arg1: u32, _arg2: u32, _arg3: u32) -> i32 {
    kill_current((arg1 & 0xFF) as i32);
    // Reached only if the current PCB was not present, which a syscall
    // cannot observe; the dispatcher still needs a value.
    0
}

/// The `getargs` system call: copy the stored argument tail, terminator
/// included. Fails on a bad buffer, an empty argument string, or a buffer
/// too small for tail plus terminator.
pub fn sys_getargs(arg1: u32, arg2: u32, _arg3: u32) -> i32 {
    let buf = arg1 as usize;
    let nbytes = arg2 as i32;
    if buf == 0 || nbytes < 0 {
        return -1;
    }
    if !mm::check_user_bounds(buf, nbytes as usize) {
        return -1;
    }
    let (_, pcb) = current();
    if !pcb.present {
        return -1;
    }
    let args = pcb.arg_bytes();
    if args.is_empty() || args.len() + 1 > nbytes as usize {
        return -1;
    }
    // SAFETY: the destination range was validated against the user window
    // and is at least args.len() + 1 bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(args.as_ptr(), buf as *mut u8, args.len());
        ptr::write((buf + args.len()) as *mut u8, 0);
    }
    0
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;

    #[test]
    fn stack_pcb_aliasing_round_trips() {
        for pid in 0..NUM_PROCESSES {
            let top = stack_top(pid);
            let base = KERNEL_STACKS_TOP - (pid + 1) * KERNEL_STACK_SIZE;
            // Any esp inside the stack maps back to its own base.
            for esp in [top, top - 4, base + 1, base + KERNEL_STACK_SIZE / 2] {
                assert_eq!(stack_base_of(esp), base, "esp {esp:#x}");
            }
            assert_eq!(pid_of_stack_base(base), pid);
        }
    }

    #[test]
    fn stacks_are_disjoint_and_descending() {
        let tops: alloc::vec::Vec<usize> = (0..NUM_PROCESSES).map(stack_top).collect();
        for pair in tops.windows(2) {
            assert_eq!(pair[0] - pair[1], KERNEL_STACK_SIZE);
        }
        assert_eq!(tops[0], KERNEL_STACKS_TOP);
    }

    #[test]
    fn cmdline_parsing_splits_name_and_tail() {
        assert_eq!(parse_cmdline(b"shell"), (&b"shell"[..], &b""[..]));
        assert_eq!(parse_cmdline(b"cat hello"), (&b"cat"[..], &b"hello"[..]));
        assert_eq!(
            parse_cmdline(b"  \tgrep  two words "),
            (&b"grep"[..], &b"two words "[..])
        );
        assert_eq!(parse_cmdline(b""), (&b""[..], &b""[..]));
        assert_eq!(parse_cmdline(b"   "), (&b""[..], &b""[..]));
    }

    #[test]
    fn cleared_pcb_holds_no_descriptors() {
        let pcb = Pcb::cleared();
        assert!(!pcb.present);
        assert!(pcb.fds.iter().all(|fd| !fd.present));
        assert_eq!(pcb.arg_bytes(), b"");
    }

    #[test]
    fn arg_bytes_stop_at_the_terminator() {
        let mut pcb = Pcb::cleared();
        pcb.args[..6].copy_from_slice(b"hello\0");
        assert_eq!(pcb.arg_bytes(), b"hello");
    }
}
