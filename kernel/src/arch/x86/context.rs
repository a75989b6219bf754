//! Kernel context switching and the ring-3 entry primitive.
//!
//! A [`Context`](super::super::Context) is just `(esp, eip)`; the switch
//! routines push the callee-saved registers and EFLAGS onto the outgoing
//! stack so the pair is all that needs to persist. `pop_iret_context`
//! consumes a fully built [`IretFrame`](super::super::IretFrame) and is the
//! single atomic step that enters user mode.

use core::arch::global_asm;

use crate::arch::{Context, IretFrame};

global_asm!(
    r#"
.section .text

// swap_context(save: *mut Context, restore: *const Context)
//
// Saves EFLAGS and the callee-saved registers on the current stack, records
// (esp, resume-label) into *save, then loads the stack and jump target from
// *restore. Returns only when some other thread swaps back into *save; at
// that point the pops restore the saved state, including the interrupt
// flag, which callers keep cleared around the switch.
.global swap_context
swap_context:
    pushfd
    cli
    push ebp
    push ebx
    push esi
    push edi
    mov eax, [esp + 24]
    mov edx, [esp + 28]
    mov [eax], esp
    lea ecx, [.Lswap_resume]
    mov [eax + 4], ecx
    mov esp, [edx]
    jmp dword ptr [edx + 4]
.Lswap_resume:
    pop edi
    pop esi
    pop ebx
    pop ebp
    popfd
    ret

// restore_context(restore: *const Context) -> !
//
// Loads a context without saving the current one. Used when the current
// kernel stack is being abandoned (process teardown, first process start).
.global restore_context
restore_context:
    mov edx, [esp + 4]
    cli
    mov esp, [edx]
    jmp dword ptr [edx + 4]

// pop_iret_context(frame: *const IretFrame) -> !
//
// Points ESP at a prepared IretFrame and unwinds it exactly the way the
// interrupt stub epilogue does: segment registers, pushad block, the
// vector/error-code pair, then iretd. With user selectors in the frame this
// is the one-shot privilege transition into ring 3.
.global pop_iret_context
pop_iret_context:
    mov esp, [esp + 4]
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd
"#
);

extern "C" {
    /// Swap from the current context into `restore`, saving into `save`.
    ///
    /// # Safety
    /// Both pointers must reference live, writable `Context` storage;
    /// `restore` must have been produced by `swap_context`, `make_context`
    /// or hand-built to the same contract; interrupts must be disabled.
    pub fn swap_context(save: *mut Context, restore: *const Context);

    /// Jump into `restore`, abandoning the current stack.
    ///
    /// # Safety
    /// Same contract as [`swap_context`] for `restore`; the current stack
    /// must not be needed again.
    pub fn restore_context(restore: *const Context) -> !;

    /// Pop a prepared frame and `iretd` through it.
    ///
    /// # Safety
    /// `frame` must point at a complete, correctly laid out [`IretFrame`]
    /// (with the privilege-change tail if the selectors are ring 3) on the
    /// current kernel stack, and `tss.esp0` must already name this stack.
    pub fn pop_iret_context(frame: *const IretFrame) -> !;
}
