//! Multiboot v1 boot handoff.
//!
//! The header below marks the kernel image as multiboot-compliant; the
//! loader enters `_start` with the well-known magic in EAX and the physical
//! address of its info structure in EBX. The only piece of that structure
//! the kernel consumes is the first boot module, which must contain the
//! filesystem image.

use core::arch::global_asm;

/// Value the loader leaves in EAX.
pub const LOADER_MAGIC: u32 = 0x2BAD_B002;

/// Info flag: the module fields are valid.
const INFO_FLAG_MODS: u32 = 1 << 3;

global_asm!(
    r#"
.section .multiboot, "a"
.align 4
    .long 0x1BADB002            // header magic
    .long 0x00000003            // flags: page-align modules, want meminfo
    .long -(0x1BADB002 + 0x00000003)

.section .text
.global _start
_start:
    cli
    // The boot stack is the top kernel stack of the process arena, so the
    // stack-pointer/PCB aliasing invariant holds from the first push; the
    // PCB underneath is marked not-present before interrupts are enabled.
    mov esp, 0x00800000
    push ebx
    push eax
    call kernel_main
1:  hlt
    jmp 1b
"#
);

/// Prefix of the multiboot v1 info structure (the rest is unused here).
#[repr(C)]
struct MultibootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
}

/// One entry of the loader's module list.
#[repr(C)]
struct MultibootModule {
    mod_start: u32,
    mod_end: u32,
    string: u32,
    reserved: u32,
}

/// Locate the filesystem image handed over by the loader.
///
/// Fails hard (panic) on a bad loader magic, a missing module list, or a
/// degenerate module range; the kernel cannot run without its filesystem.
///
/// # Safety
/// `info_addr` must be the physical address of a loader-provided multiboot
/// info structure, identity-mapped and unmodified since handoff.
pub unsafe fn filesystem_module(magic: u32, info_addr: u32) -> &'static [u8] {
    if magic != LOADER_MAGIC {
        panic!("bad multiboot magic {magic:#010x}");
    }
    if info_addr == 0 {
        panic!("null multiboot info pointer");
    }
    // SAFETY: per the contract, info_addr points at the loader's info
    // structure; the flag check gates every further dereference.
    unsafe {
        let info = &*(info_addr as *const MultibootInfo);
        if info.flags & INFO_FLAG_MODS == 0 || info.mods_count == 0 {
            panic!("loader provided no boot modules");
        }
        let module = &*(info.mods_addr as *const MultibootModule);
        if module.mod_start == 0 || module.mod_end == 0 || module.mod_end <= module.mod_start {
            panic!(
                "degenerate filesystem module [{:#x}, {:#x})",
                module.mod_start, module.mod_end
            );
        }
        core::slice::from_raw_parts(
            module.mod_start as *const u8,
            (module.mod_end - module.mod_start) as usize,
        )
    }
}
