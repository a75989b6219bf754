//! System-call dispatch.
//!
//! The user ABI: call number in EAX, up to three arguments in EBX, ECX,
//! EDX, trap through vector 0x80, signed result back in EAX. Numbers are
//! dense and 1-indexed; anything outside the table returns −1 without
//! touching the other saved registers.

use crate::arch::IretFrame;
use crate::fd;
use crate::mm;
use crate::process;

pub const NUM_SYSCALLS: usize = 8;

/// System call numbers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt = 1,
    Execute = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    Getargs = 7,
    Vidmap = 8,
}

impl TryFrom<u32> for Syscall {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Halt),
            2 => Ok(Syscall::Execute),
            3 => Ok(Syscall::Read),
            4 => Ok(Syscall::Write),
            5 => Ok(Syscall::Open),
            6 => Ok(Syscall::Close),
            7 => Ok(Syscall::Getargs),
            8 => Ok(Syscall::Vidmap),
            _ => Err(()),
        }
    }
}

type SyscallFn = fn(u32, u32, u32) -> i32;

/// The handler bound to a call number.
fn handler(syscall: Syscall) -> SyscallFn {
    match syscall {
        Syscall::Halt => process::sys_halt,
        Syscall::Execute => process::sys_execute,
        Syscall::Read => fd::sys_read,
        Syscall::Write => fd::sys_write,
        Syscall::Open => fd::sys_open,
        Syscall::Close => fd::sys_close,
        Syscall::Getargs => process::sys_getargs,
        Syscall::Vidmap => mm::user::sys_vidmap,
    }
}

fn dispatch_number(number: u32, arg1: u32, arg2: u32, arg3: u32) -> i32 {
    match Syscall::try_from(number) {
        Ok(syscall) => handler(syscall)(arg1, arg2, arg3),
        Err(()) => -1,
    }
}

/// Entry from the trap-gate path: fan out by the user's EAX and write the
/// signed result back into the saved accumulator the stub will restore.
pub fn dispatch(frame: &mut IretFrame) {
    let ret = dispatch_number(frame.eax, frame.ebx, frame.ecx, frame.edx);
    frame.eax = ret as u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_map_densely_one_indexed() {
        assert_eq!(Syscall::try_from(0), Err(()));
        assert_eq!(Syscall::try_from(1), Ok(Syscall::Halt));
        assert_eq!(Syscall::try_from(8), Ok(Syscall::Vidmap));
        assert_eq!(Syscall::try_from(9), Err(()));
        assert_eq!(Syscall::try_from(u32::MAX), Err(()));
    }

    #[test]
    fn out_of_table_numbers_return_minus_one() {
        assert_eq!(dispatch_number(0, 1, 2, 3), -1);
        assert_eq!(dispatch_number(NUM_SYSCALLS as u32 + 1, 0, 0, 0), -1);
    }

    #[test]
    fn invalid_number_writes_minus_one_into_saved_eax() {
        let mut frame = crate::arch::IretFrame::zeroed();
        frame.eax = 0;
        frame.ebx = 0xAAAA;
        dispatch(&mut frame);
        assert_eq!(frame.eax as i32, -1);
        // Other saved registers stay untouched.
        assert_eq!(frame.ebx, 0xAAAA);
    }

    #[test]
    fn valid_numbers_reach_their_own_handler() {
        // Getargs with a null buffer fails inside its own handler rather
        // than in dispatch, proving the slot was called.
        assert_eq!(dispatch_number(7, 0, 16, 0), -1);
        // Read with a descriptor index out of range likewise.
        assert_eq!(dispatch_number(3, 99, mm::USER_BASE as u32, 4), -1);
    }
}
