//! Interrupt router.
//!
//! The low-level stubs ([`crate::arch::x86::idt`]) capture all register
//! state into an [`IretFrame`] and enter here with a pointer to it. Three
//! vector classes exist:
//!
//! - **Exceptions** (0..20): fatal to the interrupted context. From user
//!   mode the current process is torn down with the exception status; from
//!   kernel mode the kernel panics, since no invariant can be trusted.
//! - **IRQ lines** (vectors 0x20..0x30): each line carries a singly-linked
//!   chain of handlers registered by drivers. The chain is walked until a
//!   handler claims the interrupt; an enabled line with no claimant is a
//!   wiring bug and panics.
//! - **The system-call trap** (0x80): forwarded to the dispatcher, which
//!   writes its result back into the saved accumulator.

use core::ptr;

use crate::arch::{self, IretFrame};
use crate::process;
use crate::syscall;

pub const NUM_EXCEPTIONS: usize = 20;
pub const NUM_IRQ_LINES: usize = 16;
/// First CPU vector the PIC is remapped to.
pub const IRQ_BASE_VECTOR: u32 = 0x20;
/// User-callable trap gate.
pub const SYSCALL_VECTOR: u32 = 0x80;

static EXCEPTION_NAMES: [&str; NUM_EXCEPTIONS] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "BOUND range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved (15)",
    "x87 floating-point error",
    "alignment check",
    "machine check",
    "SIMD floating-point error",
];

/// What a chained IRQ handler reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqStatus {
    /// The handler serviced the device and sent EOI.
    Handled,
    /// Not this handler's interrupt; keep walking the chain.
    Unhandled,
}

pub type IrqHandlerFn = fn(irq: u8) -> IrqStatus;

/// A chain link with static storage inside its driver. The node's address
/// is its identity: registering the same node twice is a bug and panics.
#[repr(C)]
pub struct IrqHandlerNode {
    handler: Option<IrqHandlerFn>,
    next: *mut IrqHandlerNode,
}

impl IrqHandlerNode {
    pub const fn new(handler: IrqHandlerFn) -> Self {
        Self {
            handler: Some(handler),
            next: ptr::null_mut(),
        }
    }
}

// SAFETY: nodes are only ever touched with interrupts disabled on the one
// CPU; the raw pointers never cross a concurrency boundary.
unsafe impl Send for IrqHandlerNode {}
unsafe impl Sync for IrqHandlerNode {}

static mut IRQ_HANDLERS: [*mut IrqHandlerNode; NUM_IRQ_LINES] =
    [ptr::null_mut(); NUM_IRQ_LINES];

/// Insert `node` at the head of the chain for `irq`.
///
/// Panics on an out-of-range line, a node without a handler, or a node
/// that is already linked anywhere: silently double-linking would close a
/// cycle in the chain.
///
/// # Safety
/// `node` must point to storage with `'static` lifetime (drivers use a
/// `static` for it) that is never moved after registration.
pub unsafe fn register_irq_handler(irq: usize, node: *mut IrqHandlerNode) {
    assert!(irq < NUM_IRQ_LINES, "IRQ line {irq} out of range");
    assert!(!node.is_null(), "null IRQ handler node");

    arch::without_interrupts(|| {
        // SAFETY: interrupts are disabled and the caller guarantees the
        // node is live static storage, so the reads and the head swap
        // cannot race.
        unsafe {
            let handlers = &raw mut IRQ_HANDLERS;
            assert!(
                (*node).handler.is_some(),
                "IRQ handler node without a handler"
            );
            assert!(
                (*node).next.is_null(),
                "IRQ handler node already linked somewhere"
            );
            for line in 0..NUM_IRQ_LINES {
                assert!(
                    !chain_contains((*handlers)[line], node),
                    "IRQ handler node registered twice"
                );
            }
            (*node).next = (*handlers)[irq];
            (*handlers)[irq] = node;
        }
    });
}

/// Whether `node` appears in the chain starting at `head`.
fn chain_contains(head: *const IrqHandlerNode, node: *const IrqHandlerNode) -> bool {
    let mut curr = head;
    while !curr.is_null() {
        if core::ptr::eq(curr, node) {
            return true;
        }
        // SAFETY: chain nodes are live static storage (registration
        // contract) and the list is only mutated with interrupts off.
        curr = unsafe { (*curr).next };
    }
    false
}

/// Walk a handler chain for `irq` until one claims it.
fn walk_chain(head: *const IrqHandlerNode, irq: u8) -> bool {
    let mut curr = head;
    while !curr.is_null() {
        // SAFETY: see chain_contains; same liveness argument.
        let (handler, next) = unsafe { ((*curr).handler, (*curr).next) };
        if let Some(handler) = handler {
            if handler(irq) == IrqStatus::Handled {
                return true;
            }
        }
        curr = next;
    }
    false
}

/// Single entry point called by every interrupt stub with a pointer to the
/// captured register frame on the current kernel stack.
#[no_mangle]
pub extern "C" fn interrupt_entry(frame: *mut IretFrame) {
    // SAFETY: the stub passes a pointer to the live frame it just built on
    // this stack; it stays valid for the duration of this call.
    let frame = unsafe { &mut *frame };
    let vector = frame.vector;

    if (vector as usize) < NUM_EXCEPTIONS {
        handle_exception(frame);
    } else if (IRQ_BASE_VECTOR..IRQ_BASE_VECTOR + NUM_IRQ_LINES as u32).contains(&vector) {
        handle_irq((vector - IRQ_BASE_VECTOR) as u8);
    } else if vector == SYSCALL_VECTOR {
        syscall::dispatch(frame);
    } else {
        panic!("interrupt on unexpected vector {vector:#x}");
    }
}

/// Exceptions never resume the faulting instruction: the offending user
/// process dies, and a kernel-mode fault is unrecoverable by definition.
fn handle_exception(frame: &mut IretFrame) {
    let name = EXCEPTION_NAMES[frame.vector as usize];
    if frame.from_user_mode() {
        log::warn!(
            "[INT] {} at eip={:#010x} (err={:#x}), killing process",
            name,
            frame.eip,
            frame.error_code
        );
        process::kill_current(process::EXCEPTION_STATUS);
        // kill_current only returns when the current PCB is not present,
        // which cannot happen for a fault taken from user mode.
        panic!("exception teardown returned for a user-mode fault");
    }
    panic!(
        "CPU exception in kernel mode: {} at eip={:#010x} err={:#x}",
        name, frame.eip, frame.error_code
    );
}

fn handle_irq(irq: u8) {
    // SAFETY: reading the head with interrupts off (we are in a handler,
    // IF is cleared by the interrupt gate); registration also runs with
    // interrupts off.
    let head = unsafe { (*(&raw const IRQ_HANDLERS))[irq as usize] };
    if head.is_null() {
        panic!("no handlers registered for enabled IRQ {irq}");
    }
    if !walk_chain(head, irq) {
        panic!("unhandled enabled IRQ {irq}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CHAIN_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counted_claiming(_irq: u8) -> IrqStatus {
        CHAIN_CALLS.fetch_add(1, Ordering::Relaxed);
        IrqStatus::Handled
    }

    fn counted_declining(_irq: u8) -> IrqStatus {
        CHAIN_CALLS.fetch_add(1, Ordering::Relaxed);
        IrqStatus::Unhandled
    }

    fn declining(_irq: u8) -> IrqStatus {
        IrqStatus::Unhandled
    }

    #[test]
    fn walk_stops_at_first_claimant() {
        let mut third = IrqHandlerNode::new(counted_claiming);
        let mut second = IrqHandlerNode::new(counted_claiming);
        let mut first = IrqHandlerNode::new(counted_declining);
        third.next = core::ptr::null_mut();
        second.next = &mut third;
        first.next = &mut second;

        let before = CHAIN_CALLS.load(Ordering::Relaxed);
        assert!(walk_chain(&first, 3));
        // The decliner plus the first claimant ran; the tail claimant did not.
        assert_eq!(CHAIN_CALLS.load(Ordering::Relaxed) - before, 2);
    }

    #[test]
    fn walk_reports_unclaimed_chains() {
        let mut only = IrqHandlerNode::new(declining);
        only.next = core::ptr::null_mut();
        assert!(!walk_chain(&only, 0));
        assert!(!walk_chain(core::ptr::null(), 0));
    }

    #[test]
    fn containment_follows_links() {
        let mut second = IrqHandlerNode::new(declining);
        let mut first = IrqHandlerNode::new(declining);
        first.next = &mut second;
        let other = IrqHandlerNode::new(declining);

        assert!(chain_contains(&first, &first));
        assert!(chain_contains(&first, &second));
        assert!(!chain_contains(&first, &other));
    }
}
