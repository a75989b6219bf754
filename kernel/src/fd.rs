//! File-descriptor core: the per-process table and its dispatch surface.
//!
//! A descriptor is a value slot inside its owning PCB, not a handle: the
//! driver variant chosen at open time is dispatched through a `match`, the
//! Rust rendition of a per-object operations table. Slots 0 and 1 are the
//! owning terminal's stdin and stdout, installed at process creation and
//! not closable from user space.
//!
//! The read/write system calls validate everything before any driver sees
//! the request: descriptor index in range, byte count non-negative, and
//! the user buffer entirely inside the user window.

use crate::drivers::rtc::{self, RtcLink};
use crate::fs;
use crate::mm;
use crate::process;
use crate::terminal;

/// Descriptors per process, stdin/stdout included.
pub const FD_PER_PROC: usize = 8;

/// The driver variant bound to an open descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdDriver {
    Stdin,
    Stdout,
    File,
    Directory,
    Rtc,
}

/// One slot of a PCB's descriptor table.
#[repr(C)]
pub struct FdEntry {
    pub driver: FdDriver,
    pub inode: u32,
    pub file_pos: u32,
    pub present: bool,
    /// Driver-local scratch; only the RTC driver uses it, threading its
    /// open-descriptor list through here.
    pub rtc: RtcLink,
}

impl FdEntry {
    pub const fn closed() -> Self {
        Self {
            driver: FdDriver::File,
            inode: 0,
            file_pos: 0,
            present: false,
            rtc: RtcLink::unlinked(),
        }
    }

    /// Reset to a pristine absent slot (the RTC link must be unlinked
    /// before this is called on an RTC descriptor).
    pub fn clear(&mut self) {
        *self = Self::closed();
    }

    pub fn read(&mut self, buf: &mut [u8]) -> i32 {
        match self.driver {
            FdDriver::Stdin => terminal::stdin_read(buf),
            FdDriver::Stdout => -1,
            FdDriver::File => fs::file_read(self, buf),
            FdDriver::Directory => fs::directory_read(self, buf),
            FdDriver::Rtc => rtc::fd_read(self, buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> i32 {
        match self.driver {
            FdDriver::Stdin => -1,
            FdDriver::Stdout => terminal::stdout_write(buf),
            // The filesystem is read-only.
            FdDriver::File | FdDriver::Directory => -1,
            FdDriver::Rtc => rtc::fd_write(self, buf),
        }
    }

    /// Driver-side close. The caller owns the `present` bit.
    pub fn close(&mut self) -> i32 {
        match self.driver {
            FdDriver::Rtc => rtc::fd_close(self),
            _ => 0,
        }
    }
}

/// Shared validation for the read/write entry points. Returns the checked
/// `(descriptor index, byte count)` or `None` to fail the call.
fn check_rw_args(fd: u32, buf: u32, nbytes: u32) -> Option<(usize, usize)> {
    let fd = fd as i32;
    let nbytes = nbytes as i32;
    if fd < 0 || fd >= FD_PER_PROC as i32 || nbytes < 0 || buf == 0 {
        return None;
    }
    if !mm::check_user_bounds(buf as usize, nbytes as usize) {
        return None;
    }
    Some((fd as usize, nbytes as usize))
}

/// `read` system call: dispatch to the descriptor's driver, which returns
/// the bytes copied (zero meaning end of file) or −1.
pub fn sys_read(fd: u32, buf: u32, nbytes: u32) -> i32 {
    let Some((fd, nbytes)) = check_rw_args(fd, buf, nbytes) else {
        return -1;
    };
    let pcb = process::current_pcb_mut();
    let entry = &mut pcb.fds[fd];
    if !entry.present {
        return -1;
    }
    // SAFETY: the range [buf, buf+nbytes) was validated against the user
    // window, which is mapped for the current process.
    let user = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, nbytes) };
    entry.read(user)
}

/// `write` system call: mirror of [`sys_read`].
pub fn sys_write(fd: u32, buf: u32, nbytes: u32) -> i32 {
    let Some((fd, nbytes)) = check_rw_args(fd, buf, nbytes) else {
        return -1;
    };
    let pcb = process::current_pcb_mut();
    let entry = &mut pcb.fds[fd];
    if !entry.present {
        return -1;
    }
    // SAFETY: as in sys_read; the slice is only read.
    let user = unsafe { core::slice::from_raw_parts(buf as *const u8, nbytes) };
    entry.write(user)
}

/// `open` system call: validate the user filename, claim the first absent
/// slot, and let the filesystem route to a driver by entry type. A driver
/// failure rolls the claimed slot back to absent.
pub fn sys_open(filename: u32, _arg2: u32, _arg3: u32) -> i32 {
    let Ok(name_len) = mm::check_user_cstring(filename as usize, fs::MAX_FNAME_LEN) else {
        return -1;
    };
    let mut name = [0u8; fs::MAX_FNAME_LEN];
    // SAFETY: check_user_cstring just walked these exact bytes inside the
    // user window.
    let user = unsafe { core::slice::from_raw_parts(filename as *const u8, name_len) };
    name[..name_len].copy_from_slice(user);

    let pcb = process::current_pcb_mut();
    let Some(index) = pcb.fds.iter().position(|entry| !entry.present) else {
        return -1; // all eight slots in use
    };
    let entry = &mut pcb.fds[index];
    entry.clear();
    entry.present = true;
    if fs::open_node(entry, &name[..name_len]) != 0 {
        entry.present = false;
        return -1;
    }
    index as i32
}

/// `close` system call. Descriptors 0 and 1 belong to the terminal and
/// cannot be closed; the `present` bit is cleared before the driver runs,
/// so even a failing driver leaves the slot free.
pub fn sys_close(fd: u32, _arg2: u32, _arg3: u32) -> i32 {
    let fd = fd as i32;
    if !(2..FD_PER_PROC as i32).contains(&fd) {
        return -1;
    }
    let pcb = process::current_pcb_mut();
    let entry = &mut pcb.fds[fd as usize];
    if !entry.present {
        return -1;
    }
    entry.present = false;
    if entry.close() != 0 {
        return -1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rw_validation_rejects_bad_descriptors_and_counts() {
        let buf = mm::USER_BASE as u32;
        assert!(check_rw_args(0, buf, 16).is_some());
        assert!(check_rw_args(7, buf, 0).is_some());
        // Index out of table range (also the -1 bit pattern).
        assert!(check_rw_args(8, buf, 16).is_none());
        assert!(check_rw_args(u32::MAX, buf, 16).is_none());
        // Negative count.
        assert!(check_rw_args(0, buf, i32::MIN as u32).is_none());
        // Null or non-user buffer.
        assert!(check_rw_args(0, 0, 16).is_none());
        assert!(check_rw_args(0, 0x1000, 16).is_none());
        // Buffer straddling the end of the window.
        assert!(check_rw_args(0, (mm::USER_VMEM_END - 4) as u32, 16).is_none());
    }

    #[test]
    fn dispatch_reads_through_a_mounted_image() {
        extern crate alloc;

        // Sole test that mounts the process-wide image.
        let image = crate::fs::tests::build_image(&[
            (&b"."[..], fs::TYPE_DIRECTORY, &b""[..]),
            (&b"frame0.txt"[..], fs::TYPE_FILE, &b"tick tock\n"[..]),
        ]);
        fs::init(alloc::boxed::Box::leak(image.into_boxed_slice()));

        let mut file = FdEntry::closed();
        file.present = true;
        assert_eq!(fs::open_node(&mut file, b"frame0.txt"), 0);
        assert_eq!(file.driver, FdDriver::File);

        let mut buf = [0u8; 64];
        assert_eq!(file.read(&mut buf), 10);
        assert_eq!(&buf[..10], b"tick tock\n");
        // Position advanced to the end; the next read reports EOF.
        assert_eq!(file.read(&mut buf), 0);
        // The medium is read-only.
        assert_eq!(file.write(b"nope"), -1);

        let mut dir = FdEntry::closed();
        dir.present = true;
        assert_eq!(fs::open_node(&mut dir, b"."), 0);
        assert_eq!(dir.driver, FdDriver::Directory);
        let mut name = [0u8; 32];
        assert_eq!(dir.read(&mut name), 32);
        assert_eq!(&name[..1], b".");
        assert_eq!(dir.read(&mut name), 32);
        assert_eq!(&name[..10], b"frame0.txt");
        assert_eq!(dir.read(&mut name), 0);

        // Unknown names fail the open without touching the entry's slot.
        let mut missing = FdEntry::closed();
        assert_eq!(fs::open_node(&mut missing, b"bogus"), -1);
    }

    #[test]
    fn closed_entries_reset_completely() {
        let mut entry = FdEntry::closed();
        entry.driver = FdDriver::Directory;
        entry.inode = 7;
        entry.file_pos = 123;
        entry.present = true;
        entry.clear();
        assert!(!entry.present);
        assert_eq!(entry.file_pos, 0);
        assert_eq!(entry.inode, 0);
    }
}
