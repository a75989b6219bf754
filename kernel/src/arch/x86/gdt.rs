//! Global descriptor table and the single task-state segment.
//!
//! The segmentation model is flat: four 0..4 GiB segments (kernel and user,
//! code and data) plus one 32-bit TSS. Segmentation does no protection work
//! here beyond carrying the privilege level; paging does the rest. The TSS
//! exists only for `ss0:esp0`, which the CPU loads on every ring-3 to
//! ring-0 transition and which the scheduler repoints at the incoming
//! process's kernel stack.

use core::arch::asm;
use core::mem::size_of;

use crate::arch::{KERNEL_CS, KERNEL_DS, TSS_SELECTOR};

/// 32-bit task-state segment, hardware layout (Intel SDM vol. 3, fig 7-2).
/// Only `ss0`/`esp0` and `iomap_base` are ever meaningful here.
#[repr(C, packed)]
struct TaskStateSegment {
    prev_task_link: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt_selector: u32,
    trap: u16,
    iomap_base: u16,
}

impl TaskStateSegment {
    const fn zeroed() -> Self {
        Self {
            prev_task_link: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt_selector: 0,
            trap: 0,
            iomap_base: 0,
        }
    }
}

static mut TSS: TaskStateSegment = TaskStateSegment::zeroed();

/// Six descriptors: null, kernel code/data, user code/data, TSS.
static mut GDT: [u64; 6] = [0; 6];

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Encode a segment descriptor. `limit` is in units selected by the
/// granularity bit in `flags` (page-granular 0xC for the flat segments,
/// byte-granular 0x0 for the TSS).
const fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    (limit as u64 & 0xFFFF)
        | ((base as u64 & 0xFFFFFF) << 16)
        | ((access as u64) << 40)
        | (((limit as u64 >> 16) & 0xF) << 48)
        | ((flags as u64 & 0xF) << 52)
        | (((base as u64 >> 24) & 0xFF) << 56)
}

/// Flat 4 GiB segments: present, code/data, DPL in bits 5..6 of the access
/// byte; flags 0xC = 4 KiB granularity + 32-bit default size.
const KERNEL_CODE_ACCESS: u8 = 0x9A;
const KERNEL_DATA_ACCESS: u8 = 0x92;
const USER_CODE_ACCESS: u8 = 0xFA;
const USER_DATA_ACCESS: u8 = 0xF2;
const FLAT_FLAGS: u8 = 0xC;
/// Available 32-bit TSS.
const TSS_ACCESS: u8 = 0x89;

// Reloading CS cannot be done with a plain mov; the far return below pops
// the new (eip, cs) pair pushed by the wrapper.
core::arch::global_asm!(
    r#"
.section .text
// reload_segments(code_sel: u32, data_sel: u32)
.global reload_segments
reload_segments:
    mov eax, [esp + 4]
    mov ecx, [esp + 8]
    pop edx
    push eax
    push edx
    mov ds, cx
    mov es, cx
    mov fs, cx
    mov gs, cx
    mov ss, cx
    retf
"#
);

extern "C" {
    fn reload_segments(code_sel: u32, data_sel: u32);
}

/// Build and load the GDT, reload the segment registers, and load the task
/// register. Must run before the IDT is enabled and before any privilege
/// transition.
pub fn init() {
    // SAFETY: single-CPU early boot, interrupts are still disabled; nothing
    // else references GDT/TSS yet.
    unsafe {
        let tss_base = &raw const TSS as u32;
        let tss_limit = size_of::<TaskStateSegment>() as u32 - 1;

        GDT[0] = 0;
        GDT[1] = descriptor(0, 0xFFFFF, KERNEL_CODE_ACCESS, FLAT_FLAGS);
        GDT[2] = descriptor(0, 0xFFFFF, KERNEL_DATA_ACCESS, FLAT_FLAGS);
        GDT[3] = descriptor(0, 0xFFFFF, USER_CODE_ACCESS, FLAT_FLAGS);
        GDT[4] = descriptor(0, 0xFFFFF, USER_DATA_ACCESS, FLAT_FLAGS);
        GDT[5] = descriptor(tss_base, tss_limit, TSS_ACCESS, 0);

        TSS.ss0 = KERNEL_DS as u32;
        // No I/O permission bitmap: base past the segment limit.
        TSS.iomap_base = size_of::<TaskStateSegment>() as u16;

        let gdtr = DescriptorTablePointer {
            limit: (size_of::<[u64; 6]>() - 1) as u16,
            base: &raw const GDT as u32,
        };
        asm!("lgdt [{}]", in(reg) &gdtr as *const DescriptorTablePointer, options(nostack));
        reload_segments(KERNEL_CS as u32, KERNEL_DS as u32);
        asm!("ltr {0:x}", in(reg) TSS_SELECTOR as u32, options(nomem, nostack));
    }
}

/// Point `tss.esp0` at the top of the given kernel stack. The CPU uses this
/// on the next user-to-kernel transition, so it must be updated atomically
/// with every context switch (callers hold interrupts disabled).
pub fn set_kernel_stack(esp0: usize) {
    // SAFETY: a 32-bit store to a static; racing writers are excluded by
    // the interrupts-off requirement on callers.
    unsafe {
        TSS.esp0 = esp0 as u32;
    }
}
