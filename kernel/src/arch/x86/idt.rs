//! Interrupt descriptor table and the register-capture stubs.
//!
//! Every installed vector funnels through `isr_common`, which lays an
//! [`IretFrame`](crate::arch::IretFrame) out on the kernel stack (vector and
//! error code included), switches to kernel data segments, and calls the
//! router's `interrupt_entry` with a pointer to it. The epilogue restores
//! the frame and `iretd`s, which also re-enables interrupts by restoring
//! EFLAGS.
//!
//! Gate assignment: vectors 0..20 are the CPU exceptions, 0x20..0x30 the
//! two PIC's IRQ lines, and 0x80 the user-callable system-call trap gate
//! (DPL 3, trap type so interrupts stay enabled on entry).

use core::arch::asm;
use core::mem::size_of;

use crate::arch::KERNEL_CS;
use crate::interrupt::{IRQ_BASE_VECTOR, NUM_EXCEPTIONS, NUM_IRQ_LINES, SYSCALL_VECTOR};

core::arch::global_asm!(
    r#"
.section .text

.macro isr_noerr vec
.global isr_stub_\vec
isr_stub_\vec:
    push 0
    push \vec
    jmp isr_common
.endm

.macro isr_err vec
.global isr_stub_\vec
isr_stub_\vec:
    push \vec
    jmp isr_common
.endm

// CPU exceptions. The CPU pushes an error code for 8, 10..14 and 17; the
// stubs push a zero placeholder everywhere else so the frame layout is
// uniform.
isr_noerr 0
isr_noerr 1
isr_noerr 2
isr_noerr 3
isr_noerr 4
isr_noerr 5
isr_noerr 6
isr_noerr 7
isr_err   8
isr_noerr 9
isr_err   10
isr_err   11
isr_err   12
isr_err   13
isr_err   14
isr_noerr 15
isr_noerr 16
isr_err   17
isr_noerr 18
isr_noerr 19

// PIC IRQ lines 0..15 at vectors 0x20..0x2F.
isr_noerr 32
isr_noerr 33
isr_noerr 34
isr_noerr 35
isr_noerr 36
isr_noerr 37
isr_noerr 38
isr_noerr 39
isr_noerr 40
isr_noerr 41
isr_noerr 42
isr_noerr 43
isr_noerr 44
isr_noerr 45
isr_noerr 46
isr_noerr 47

// System-call trap vector.
isr_noerr 128

// Common capture path. Stack on entry (low to high): vector, error code,
// eip, cs, eflags [, esp, ss]. pushad + the segment pushes complete the
// IretFrame layout, after which esp is the frame pointer handed to the
// router.
isr_common:
    pushad
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call interrupt_entry
    add esp, 4
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd

.section .rodata
.global EXCEPTION_STUB_TABLE
EXCEPTION_STUB_TABLE:
    .long isr_stub_0
    .long isr_stub_1
    .long isr_stub_2
    .long isr_stub_3
    .long isr_stub_4
    .long isr_stub_5
    .long isr_stub_6
    .long isr_stub_7
    .long isr_stub_8
    .long isr_stub_9
    .long isr_stub_10
    .long isr_stub_11
    .long isr_stub_12
    .long isr_stub_13
    .long isr_stub_14
    .long isr_stub_15
    .long isr_stub_16
    .long isr_stub_17
    .long isr_stub_18
    .long isr_stub_19

.global IRQ_STUB_TABLE
IRQ_STUB_TABLE:
    .long isr_stub_32
    .long isr_stub_33
    .long isr_stub_34
    .long isr_stub_35
    .long isr_stub_36
    .long isr_stub_37
    .long isr_stub_38
    .long isr_stub_39
    .long isr_stub_40
    .long isr_stub_41
    .long isr_stub_42
    .long isr_stub_43
    .long isr_stub_44
    .long isr_stub_45
    .long isr_stub_46
    .long isr_stub_47

.text
"#
);

extern "C" {
    static EXCEPTION_STUB_TABLE: [u32; NUM_EXCEPTIONS];
    static IRQ_STUB_TABLE: [u32; NUM_IRQ_LINES];
    fn isr_stub_128();
}

/// One IDT gate descriptor (Intel SDM vol. 3, fig 6-2).
#[repr(C)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const MISSING: Self = Self {
        offset_low: 0,
        selector: 0,
        zero: 0,
        type_attr: 0,
        offset_high: 0,
    };

    fn gate(handler: u32, type_attr: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CS,
            zero: 0,
            type_attr,
            offset_high: (handler >> 16) as u16,
        }
    }
}

/// Present, DPL 0, 32-bit interrupt gate (IF cleared on entry).
const INTERRUPT_GATE: u8 = 0x8E;
/// Present, DPL 3, 32-bit trap gate (user-callable, IF left enabled).
const USER_TRAP_GATE: u8 = 0xEF;

static mut IDT: [IdtEntry; 256] = [IdtEntry::MISSING; 256];

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Populate and load the IDT. Vectors the PIC never raises stay marked
/// not-present; reaching one is a triple-fault-grade bug we want loud.
pub fn init() {
    // SAFETY: single-CPU early boot with interrupts disabled; the stub
    // tables are immutable data emitted by the assembly block above.
    unsafe {
        for (i, &stub) in EXCEPTION_STUB_TABLE.iter().enumerate() {
            IDT[i] = IdtEntry::gate(stub, INTERRUPT_GATE);
        }
        for (i, &stub) in IRQ_STUB_TABLE.iter().enumerate() {
            IDT[IRQ_BASE_VECTOR as usize + i] = IdtEntry::gate(stub, INTERRUPT_GATE);
        }
        IDT[SYSCALL_VECTOR as usize] = IdtEntry::gate(isr_stub_128 as usize as u32, USER_TRAP_GATE);

        let idtr = DescriptorTablePointer {
            limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: &raw const IDT as u32,
        };
        asm!("lidt [{}]", in(reg) &idtr as *const DescriptorTablePointer, options(nostack));
    }
}
