//! ╔═══════════════════════════════════════════════════════════════════════════╗
//! ║                           PI KERNEL - MAIN                                ║
//! ║                  Boot, bring up the heap, start init                      ║
//! ╚═══════════════════════════════════════════════════════════════════════════╝
//!
//! `_start` (arch/boot.rs) lands here in the high half with the MMU on and
//! the firmware's devicetree address in x0.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod entry {
    use core::panic::PanicInfo;

    use pi_kernel::config::{
        BOOT_PMD_HIGH, BOOT_PMD_LOW, BOOT_PUD, BOOT_RESERVED_END, INIT_PROGRAM,
    };
    use pi_kernel::drivers::{timer, uart};
    use pi_kernel::dtb::Fdt;
    use pi_kernel::kernel::exec::{self, Mode};
    use pi_kernel::kernel::memory::{self, paging, LinearWindow, PhysAddr, VirtAddr};
    use pi_kernel::kernel::scheduler;
    use pi_kernel::{arch, fs, kprintln};

    extern "C" {
        static __kernel_start: u8;
        static __heap_start: u8;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // KERNEL ENTRY POINT
    // ═══════════════════════════════════════════════════════════════════════════

    /// Main kernel entry - called from `_start` once the boot tables are live
    #[no_mangle]
    pub extern "C" fn kernel_main(dtb: u64) -> ! {
        let window = LinearWindow::KERNEL;

        // Phase 1: 2MB kernel mappings, then the serial console
        unsafe {
            paging::init_kernel_tables(
                window,
                PhysAddr::new(BOOT_PUD),
                PhysAddr::new(BOOT_PMD_LOW),
                PhysAddr::new(BOOT_PMD_HIGH),
            );
            arch::tlb_invalidate_all();
        }
        uart::init();

        kprintln!();
        kprintln!("[BOOT] Pi Kernel v{}", env!("CARGO_PKG_VERSION"));
        kprintln!("[BOOT] Timer {} Hz, devicetree at {:#x}", arch::timer_frequency(), dtb);

        // Phase 2: what the firmware left us
        let fdt = match unsafe { Fdt::from_ptr(window.to_virt(PhysAddr::new(dtb))) } {
            Ok(fdt) => Some(fdt),
            Err(err) => {
                kprintln!("[BOOT] No devicetree: {}", err);
                None
            }
        };
        if let Some(model) = fdt.as_ref().and_then(|fdt| fdt.model()) {
            kprintln!("[BOOT] Machine: {}", model);
        }
        let initrd = fdt.as_ref().and_then(|fdt| fdt.initrd());

        // Phase 3: heap and page frames
        let (kernel_start, kernel_end) = unsafe {
            (
                VirtAddr::from_ptr(&__kernel_start as *const u8),
                VirtAddr::from_ptr(&__heap_start as *const u8),
            )
        };
        let mut reserved: heapless::Vec<(PhysAddr, PhysAddr), 4> = heapless::Vec::new();
        let _ = reserved.push((PhysAddr::new(0), PhysAddr::new(BOOT_RESERVED_END)));
        let _ = reserved.push((window.to_phys(kernel_start), window.to_phys(kernel_end)));
        if let Some(fdt) = fdt.as_ref() {
            let _ = reserved.push((PhysAddr::new(dtb), PhysAddr::new(dtb + fdt.total_size() as u64)));
        }
        if let Some(range) = initrd {
            let _ = reserved.push(range);
        }
        unsafe { memory::init(&reserved) };

        // Phase 4: initramfs
        match initrd {
            Some((start, end)) => match unsafe { fs::init_initramfs(window.to_virt(start), window.to_virt(end)) } {
                Ok(_) => fs::list(),
                Err(err) => kprintln!("[INITRD] {}", err),
            },
            None => kprintln!("[INITRD] No initramfs in /chosen"),
        }

        // Phase 5: tasks and the tick
        match scheduler::init() {
            Ok(idle) => kprintln!("[SCHED] Idle task {}", idle),
            Err(err) => {
                kprintln!("[SCHED] Cannot create idle task: {}", err);
                arch::halt();
            }
        }
        timer::init_tick();
        timer::enable_interrupt();

        // Phase 6: hand the CPU to init. Only returns on failure.
        let err = exec::launch(INIT_PROGRAM, Mode::Spawn);
        kprintln!("[EXEC] {}: {}", INIT_PROGRAM, err);

        scheduler::idle()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PANIC HANDLER
    // ═══════════════════════════════════════════════════════════════════════════

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        arch::irq_disable();

        kprintln!();
        kprintln!("[PANIC] {}", info.message());
        if let Some(location) = info.location() {
            kprintln!("[PANIC] at {}:{}", location.file(), location.line());
        }

        arch::halt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
