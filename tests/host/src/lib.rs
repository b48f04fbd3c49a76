//! Pi Kernel - Host-Based Test Library
//!
//! Scenario fixtures over the real kernel types: a scheduler booted with an
//! idle task on fake physical memory, a recording platform and a builder for
//! newc initramfs archives.

use pi_kernel::arch::Platform;
use pi_kernel::config::PAGE_SIZE;
use pi_kernel::kernel::memory::{FrameAllocator, PhysAddr};
use pi_kernel::kernel::queue::QueueKind;
use pi_kernel::kernel::scheduler::{Outcome, Scheduler};
use pi_kernel::kernel::task::TaskId;
use pi_kernel::testing::{FakePhysMemory, MockPlatform};

// ═══════════════════════════════════════════════════════════════════════════════
// MACHINE
// ═══════════════════════════════════════════════════════════════════════════════

/// A booted kernel without a CPU.
pub struct Machine {
    pub sched: Scheduler,
    pub mem: FakePhysMemory,
    pub hw: MockPlatform,
}

impl Machine {
    pub fn boot(pages: usize) -> Self {
        let mut mem = FakePhysMemory::new(pages);
        let mut sched = Scheduler::new();
        let idle = mem.allocate(PAGE_SIZE).expect("idle image");
        let entry = mem.window().to_virt(idle);
        sched.init(&mut mem, entry).expect("idle task");
        Machine { sched, mem, hw: MockPlatform::new() }
    }

    /// Create a task with a one-page image.
    pub fn spawn(&mut self) -> TaskId {
        let image = self.mem.allocate(PAGE_SIZE).expect("image page");
        let entry = self.mem.window().to_virt(image);
        self.sched.create_task(&mut self.mem, entry, PAGE_SIZE).expect("task")
    }

    /// Run `schedule` and finish a switch the way `switch_to` does: load the
    /// `pgd` word of the incoming context, then restore the interrupt state
    /// the switch carried.
    pub fn schedule(&mut self) -> Outcome {
        let outcome = self.sched.schedule(&mut self.hw).expect("schedule");
        if let Outcome::Switch(switch) = &outcome {
            // SAFETY: `next` points into a boxed task the scheduler still owns.
            let pgd = unsafe { (*switch.next).pgd };
            self.hw.set_page_table(PhysAddr::new(pgd));
            self.hw.irq_restore(switch.irq_state);
        }
        outcome
    }

    pub fn running(&self) -> u32 {
        self.sched.current().map_or(u32::MAX, TaskId::as_u32)
    }

    pub fn queue(&self, kind: QueueKind) -> Vec<u32> {
        self.sched.tasks().queue(kind).iter().map(TaskId::as_u32).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INITRAMFS
// ═══════════════════════════════════════════════════════════════════════════════

/// Build a newc archive holding `files`, terminated by `TRAILER!!!`.
pub fn cpio_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, data) in files {
        cpio_member(&mut out, name, 0o100_755, data);
    }
    cpio_member(&mut out, "TRAILER!!!", 0, &[]);
    out
}

fn cpio_member(out: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
    let fields = [1, mode as usize, 0, 0, 1, 0, data.len(), 0, 0, 0, 0, name.len() + 1, 0];
    out.extend_from_slice(b"070701");
    for field in fields {
        out.extend_from_slice(format!("{:08x}", field).as_bytes());
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    pad4(out);
    out.extend_from_slice(data);
    pad4(out);
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}
