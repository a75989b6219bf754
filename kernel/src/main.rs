//! Bare-metal kernel binary: multiboot entry, bring-up order, panic.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_os = "none", target_arch = "x86"))]
mod kernel {
    use core::panic::PanicInfo;

    use ternion_kernel::arch::x86::{gdt, idt, multiboot, serial};
    use ternion_kernel::drivers::{keyboard, pic, pit, rtc};
    use ternion_kernel::{fs, klog, mm, process, terminal};

    /// Main C-ABI entry, called from the multiboot `_start` stub with the
    /// loader's magic and info pointer.
    #[no_mangle]
    pub extern "C" fn kernel_main(magic: u32, info_addr: u32) -> ! {
        serial::init();
        klog::init();
        log::info!("TernionOS v{} booting", env!("CARGO_PKG_VERSION"));

        gdt::init();
        idt::init();
        pic::init();

        // The loader's info structure lives in low memory that the paging
        // layout does not map; grab the module range before paging is on.
        // SAFETY: magic/info_addr come straight from the loader handoff.
        let fs_image = unsafe { multiboot::filesystem_module(magic, info_addr) };

        mm::init();
        fs::init(fs_image);

        terminal::init();
        process::init();

        pit::init();
        rtc::init();
        keyboard::init();

        log::info!("bring-up complete, starting shells");
        terminal::start_shells()
    }

    /// Kernel-fatal path: log and halt forever with interrupts off.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        ternion_kernel::serial_println!("KERNEL PANIC: {info}");
        ternion_kernel::println!("KERNEL PANIC: {info}");
        ternion_kernel::arch::x86::halt_forever()
    }
}

// The kernel only means anything on its real target; a host build of the
// binary is a link-check of the library.
#[cfg(not(target_os = "none"))]
fn main() {}
