//! Paging manager.
//!
//! One global kernel page directory, one page table for the first 4 MiB,
//! and one page table for the user-visible video mapping. The layout is
//! fixed at boot:
//!
//! - directory entry 0: the low page table: the VGA text frame plus the
//!   render double buffer and the three terminal back-buffers, all
//!   supervisor, write-through;
//! - directory entry 1: a single 4 MiB supervisor page covering the kernel
//!   image and the kernel stack region;
//! - directory entry 32 (virtual 128 MiB): the 4 MiB user window, whose
//!   physical base is rewritten on every address-space switch;
//! - the entry at [`USER_VIDMAP`]'s directory index: the vidmap page table,
//!   holding the single user-accessible 4 KiB video page.
//!
//! Exactly one user 4 MiB page is ever present, and its physical base is
//! `(pid + 2) * 4 MiB`.

pub mod user;

use crate::arch;
use crate::process;
use crate::terminal::NUM_TERMINALS;

pub use user::{check_user_bounds, check_user_cstring, UserStrError};

/// 4 KiB page size.
pub const PAGE_SIZE: usize = 1 << 12;
/// 4 MiB large-page size.
pub const PAGE_4M_SIZE: usize = 1 << 22;
/// Entries per page table or directory.
pub const PAGE_TABLE_LEN: usize = 1 << 10;

/// Bottom of the user 4 MiB window.
pub const USER_BASE: usize = 0x0800_0000;
/// One past the top of the user window; also the initial user stack pointer.
pub const USER_VMEM_END: usize = USER_BASE + PAGE_4M_SIZE;
/// Where the program image is copied inside the user window.
pub const USER_PROG_START: usize = USER_BASE + 0x0004_8000;
/// Virtual address of the user-visible video page, gated by `vidmap`.
pub const USER_VIDMAP: usize = 0x0900_0000;

/// Physical base of the VGA text frame.
pub const VGA_MEM_BASE: usize = 0xB8000;
/// Physical base of the render double buffer (two pages toggle between
/// `VGA_MEM_BASE` and here).
pub const DOUBLE_BUFFER_BASE: usize = VGA_MEM_BASE + PAGE_SIZE;
/// Physical base of the first terminal back-buffer; one page per terminal.
pub const TERMINAL_BUFFER_BASE: usize = VGA_MEM_BASE + 2 * PAGE_SIZE;

/// Physical base of the user 4 MiB page for a PID: the first two large
/// frames hold low memory and the kernel image.
pub const fn user_frame_base(pid: usize) -> usize {
    (pid + 2) * PAGE_4M_SIZE
}

bitflags::bitflags! {
    /// Page directory / table entry flag bits (Intel SDM vol. 3 §3.7.6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// In a directory entry: this entry maps a 4 MiB page.
        const LARGE         = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

/// A single 32-bit paging entry, used for both directory and table levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    pub const ABSENT: Self = Self(0);

    /// Directory entry pointing at a page table.
    pub fn table(table_phys: usize, flags: PageFlags) -> Self {
        Self((table_phys as u32 & 0xFFFF_F000) | flags.bits())
    }

    /// Table entry mapping one 4 KiB frame.
    pub fn frame_4k(frame_phys: usize, flags: PageFlags) -> Self {
        Self((frame_phys as u32 & 0xFFFF_F000) | flags.bits())
    }

    /// Directory entry mapping one 4 MiB frame.
    pub fn frame_4m(frame_phys: usize, flags: PageFlags) -> Self {
        Self((frame_phys as u32 & 0xFFC0_0000) | (flags | PageFlags::LARGE).bits())
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    /// Physical base of a 4 KiB mapping.
    pub fn frame_4k_base(self) -> usize {
        (self.0 & 0xFFFF_F000) as usize
    }

    /// Physical base of a 4 MiB mapping.
    pub fn frame_4m_base(self) -> usize {
        (self.0 & 0xFFC0_0000) as usize
    }
}

/// A page-aligned array of 1024 entries; doubles as the directory type.
#[repr(C, align(4096))]
pub struct PageTable(pub [PageEntry; PAGE_TABLE_LEN]);

impl PageTable {
    const fn empty() -> Self {
        Self([PageEntry::ABSENT; PAGE_TABLE_LEN])
    }
}

/// Directory index of the user 4 MiB window (virtual 128 MiB).
const USER_DIR_INDEX: usize = USER_BASE >> 22;
/// Directory index of the vidmap page table.
const VIDMAP_DIR_INDEX: usize = USER_VIDMAP >> 22;
/// Index of the vidmap page within its table.
const VIDMAP_TABLE_INDEX: usize = (USER_VIDMAP & (PAGE_4M_SIZE - 1)) >> 12;

static mut KERNEL_PAGE_DIR: PageTable = PageTable::empty();
static mut LOW_PAGE_TABLE: PageTable = PageTable::empty();
static mut VIDMAP_PAGE_TABLE: PageTable = PageTable::empty();

/// Build the initial address space and turn paging on.
///
/// Every access after this goes through the tables built here; the kernel
/// image and stacks live inside the identity-mapped 4..8 MiB large page.
pub fn init() {
    let sup = PageFlags::PRESENT | PageFlags::WRITABLE;
    let sup_global = sup | PageFlags::GLOBAL;
    let vga = sup_global | PageFlags::WRITE_THROUGH;

    // SAFETY: single-CPU early boot with interrupts disabled; the static
    // tables are referenced by nothing until CR3 is loaded below.
    unsafe {
        // VGA text frame plus the double buffer and the per-terminal
        // back-buffers, one 4 KiB page each.
        LOW_PAGE_TABLE.0[VGA_MEM_BASE >> 12] = PageEntry::frame_4k(VGA_MEM_BASE, vga);
        for i in 0..NUM_TERMINALS + 1 {
            let base = DOUBLE_BUFFER_BASE + i * PAGE_SIZE;
            LOW_PAGE_TABLE.0[base >> 12] = PageEntry::frame_4k(base, vga);
        }

        KERNEL_PAGE_DIR.0[0] =
            PageEntry::table(&raw const LOW_PAGE_TABLE as usize, sup_global);
        // Kernel image: one global 4 MiB page at 4 MiB.
        KERNEL_PAGE_DIR.0[1] = PageEntry::frame_4m(PAGE_4M_SIZE, sup_global);
        // User window; the base is a placeholder until the first switch.
        KERNEL_PAGE_DIR.0[USER_DIR_INDEX] =
            PageEntry::frame_4m(user_frame_base(0), sup | PageFlags::USER);
        KERNEL_PAGE_DIR.0[VIDMAP_DIR_INDEX] = PageEntry::table(
            &raw const VIDMAP_PAGE_TABLE as usize,
            sup_global | PageFlags::USER,
        );
        // The vidmap page itself starts out not-present; the vidmap
        // syscall flips it on per process.
        VIDMAP_PAGE_TABLE.0[VIDMAP_TABLE_INDEX] = PageEntry::frame_4k(
            VGA_MEM_BASE,
            PageFlags::WRITABLE | PageFlags::USER | PageFlags::WRITE_THROUGH,
        );

        #[cfg(target_arch = "x86")]
        arch::x86::enable_paging(&raw const KERNEL_PAGE_DIR as usize);
    }

    log::info!("[MM] paging enabled, user window at {USER_BASE:#x}");
}

/// Switch the user-visible parts of the address space to `pid`: rewrite the
/// user window's physical base to `(pid + 2) * 4 MiB` and point the vidmap
/// page at the owning terminal's back-buffer, then flush the TLB by
/// reloading the page-directory root.
///
/// Callers must hold interrupts disabled: the entry rewrite, the vidmap
/// retarget and the TLB flush have to be observed atomically.
pub fn set_user_page(pid: usize) {
    let pcb = process::pcb(pid);
    let user = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;

    // SAFETY: interrupts are disabled per the contract above, so no other
    // thread of control observes the intermediate table state; the final
    // CR3 reload makes the edit visible.
    unsafe {
        KERNEL_PAGE_DIR.0[USER_DIR_INDEX] = PageEntry::frame_4m(user_frame_base(pid), user);

        let mut flags = PageFlags::WRITABLE | PageFlags::USER | PageFlags::WRITE_THROUGH;
        if pcb.vidmap {
            flags |= PageFlags::PRESENT;
        }
        VIDMAP_PAGE_TABLE.0[VIDMAP_TABLE_INDEX] =
            PageEntry::frame_4k(terminal_frame_phys(pcb.terminal_id), flags);

        arch::write_page_dir_base(&raw const KERNEL_PAGE_DIR as usize);
    }
}

/// Mark the vidmap page present for `pid` (idempotent) and re-apply the
/// mapping. Called from the vidmap syscall with interrupts disabled.
pub fn enable_user_vidmap(pid: usize) {
    set_user_page(pid);
}

/// Physical page the vidmap of a process on `terminal_id` should map: that
/// terminal's back-buffer. The renderer copies the foreground buffer to the
/// hardware frame every tick, so writes land on screen when the terminal is
/// foreground and stay in the back-buffer otherwise.
fn terminal_frame_phys(terminal_id: usize) -> usize {
    TERMINAL_BUFFER_BASE + terminal_id * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_frame_base_skips_low_and_kernel_frames() {
        assert_eq!(user_frame_base(0), 0x0080_0000);
        assert_eq!(user_frame_base(5), 0x01C0_0000);
    }

    #[test]
    fn entry_encoding_round_trips() {
        let e = PageEntry::frame_4m(
            user_frame_base(3),
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
        );
        assert!(e.is_present());
        assert!(e.flags().contains(PageFlags::LARGE));
        assert_eq!(e.frame_4m_base(), user_frame_base(3));

        let t = PageEntry::frame_4k(0xB9000, PageFlags::PRESENT | PageFlags::WRITE_THROUGH);
        assert_eq!(t.frame_4k_base(), 0xB9000);
        assert!(!t.flags().contains(PageFlags::USER));
    }

    #[test]
    fn fixed_indices_match_the_layout() {
        assert_eq!(USER_DIR_INDEX, 32);
        assert_eq!(VIDMAP_DIR_INDEX, 36);
        assert_eq!(VIDMAP_TABLE_INDEX, 0);
    }

    #[test]
    fn terminal_frames_are_consecutive_pages() {
        assert_eq!(terminal_frame_phys(0), 0xBA000);
        assert_eq!(terminal_frame_phys(1), 0xBB000);
        assert_eq!(terminal_frame_phys(2), 0xBC000);
    }
}
