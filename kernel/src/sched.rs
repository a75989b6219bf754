//! Round-robin scheduler.
//!
//! Scheduling decisions happen with interrupts disabled, and every switch
//! re-applies the two pieces of state that must move atomically with the
//! stack: the user address-space mapping and the TSS kernel stack pointer.
//! A process that is `present` and `running` is scheduled within one full
//! rotation of the arena, because the scan always starts just after the
//! current PID.
//!
//! A kernel thread suspends in exactly three places: [`switch_to`],
//! [`jump_to`], and the idle halt loop inside [`do_schedule`].

use crate::arch;
use crate::mm;
use crate::process::{self, NUM_PROCESSES};

/// Pick the next runnable PID after `current`, wrapping over the arena.
fn next_runnable(current: usize, runnable: impl Fn(usize) -> bool) -> Option<usize> {
    (0..NUM_PROCESSES)
        .map(|i| (current + i + 1) % NUM_PROCESSES)
        .find(|&pid| runnable(pid))
}

/// Swap into `pid`, returning when something swaps back into us.
///
/// Fails if the target is not present; switching to ourselves is a no-op.
/// On resumption the user page and `tss.esp0` are repointed at the
/// (again-)current process before interrupts can be re-enabled.
pub fn switch_to(pid: usize) -> Result<(), ()> {
    if !process::pcb(pid).present {
        return Err(());
    }
    let current = process::current_pid();
    if current == pid {
        return Ok(());
    }
    if !process::pcb(current).present {
        panic!("context switch with the current PCB not present");
    }
    let flags = arch::irq_save();
    // SAFETY: both PCBs are present, interrupts are off, and the contexts
    // are the canonical save/restore slots for their stacks.
    unsafe {
        arch::swap_context(
            &mut process::pcb_mut(current).context,
            &process::pcb(pid).context,
        );
    }
    // Somebody switched back into us: make the address space and the TSS
    // match this stack again, atomically with the switch (still cli'd).
    mm::set_user_page(current);
    arch::set_kernel_stack(process::stack_top(current));
    arch::irq_restore(flags);
    Ok(())
}

/// Restore `pid` without saving the current context. Used when the
/// current stack is being abandoned: process teardown and the very first
/// transfer off the boot stack.
pub fn jump_to(pid: usize) -> ! {
    if !process::pcb(pid).present {
        panic!("jump to a non-present PID {pid}");
    }
    // SAFETY: the target context is live and this stack is never resumed.
    unsafe { arch::restore_context(&process::pcb(pid).context) }
}

/// Round-robin step. With `jump` false (the timer path): find the next
/// runnable process, swap into it, and return once this process is
/// scheduled again; idle-halt while nothing is runnable. With `jump` true
/// (a teardown path): never return, idling until some process becomes
/// runnable and then jumping into it.
pub fn do_schedule(jump: bool) {
    let flags = arch::irq_save();
    let current = process::current_pid();
    if !jump && !process::pcb(current).present {
        panic!("scheduler entered without a current process");
    }
    loop {
        let next = next_runnable(current, |pid| {
            let pcb = process::pcb(pid);
            pcb.present && pcb.running
        });
        match next {
            Some(next) => {
                if jump {
                    jump_to(next);
                }
                let _ = switch_to(next);
            }
            None => {
                // Wait for an interrupt to make something runnable.
                arch::wait_for_interrupt();
            }
        }
        let pcb = process::pcb(current);
        if !jump && pcb.present && pcb.running {
            break;
        }
    }
    arch::irq_restore(flags);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_starts_after_current_and_wraps() {
        // Only PID 1 runnable, from anywhere.
        for current in 0..NUM_PROCESSES {
            assert_eq!(next_runnable(current, |p| p == 1), Some(1));
        }
        // From PID 1, the scan prefers 2 over 0 when both are runnable.
        assert_eq!(next_runnable(1, |p| p == 0 || p == 2), Some(2));
        // And wraps to 0 when nothing later is runnable.
        assert_eq!(next_runnable(4, |p| p == 0), Some(0));
    }

    #[test]
    fn current_is_chosen_last() {
        // With everyone runnable, the scan lands on current + 1 and only
        // returns to the current PID after a full rotation.
        assert_eq!(next_runnable(2, |_| true), Some(3));
        assert_eq!(next_runnable(NUM_PROCESSES - 1, |_| true), Some(0));
        assert_eq!(next_runnable(3, |p| p == 3), Some(3));
    }

    #[test]
    fn empty_arena_yields_nothing() {
        assert_eq!(next_runnable(0, |_| false), None);
    }

    #[test]
    fn every_runnable_pid_is_reached_within_one_rotation() {
        // Weak fairness: with k runnable PCBs, each is picked within k
        // consecutive picks when the chooser follows the returned PID.
        let runnable = [true, false, true, true, false, true];
        let mut current = 0;
        let mut seen = [false; NUM_PROCESSES];
        for _ in 0..NUM_PROCESSES {
            let next = next_runnable(current, |p| runnable[p]).unwrap();
            seen[next] = true;
            current = next;
        }
        for pid in 0..NUM_PROCESSES {
            assert_eq!(seen[pid], runnable[pid]);
        }
    }
}
