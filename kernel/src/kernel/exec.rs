//! Program launcher
//!
//! Copies a named image out of an [`ImageSource`] into fresh frames, builds
//! a task around it and drops into it at EL0. The image is mapped at
//! virtual address zero of the new task; its first instruction is the entry
//! point.

use core::fmt;

use crate::arch::{self, Board, Platform};
use crate::config::IMAGE_BASE;
use crate::kernel::memory::{page_round_up, FrameAllocator, KernelFrames, PhysAddr, VirtAddr};
use crate::kernel::scheduler::{SchedError, Scheduler, SCHEDULER};
use crate::kernel::task::{TaskError, TaskId};

/// Where program images come from.
pub trait ImageSource {
    /// Byte length of `name`, 0 if there is no such image.
    fn size_of(&self, name: &str) -> usize;

    /// Copy `name` into `dst`, returning the number of bytes written.
    fn load(&self, name: &str, dst: &mut [u8]) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    NotFound,
    OutOfMemory,
    Task(TaskError),
    Sched(SchedError),
}

impl From<TaskError> for ExecError {
    fn from(err: TaskError) -> Self {
        ExecError::Task(err)
    }
}

impl From<SchedError> for ExecError {
    fn from(err: SchedError) -> Self {
        ExecError::Sched(err)
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::NotFound => write!(f, "file not found"),
            ExecError::OutOfMemory => write!(f, "out of memory for the image"),
            ExecError::Task(err) => write!(f, "task creation failed: {}", err),
            ExecError::Sched(err) => write!(f, "scheduler refused the task: {}", err),
        }
    }
}

/// What happens to the task that asked for the launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The caller goes back to the ready queue (boot, idle).
    Spawn,
    /// The caller is retired to the zombie queue (`exec` system call).
    Replace,
}

/// Everything `enter_el0` needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchTarget {
    pub task: TaskId,
    pub entry: VirtAddr,
    pub user_sp: u64,
    pub kernel_sp: VirtAddr,
    pub page_table: PhysAddr,
}

/// Load `name`, create its task, install its table and make it current.
///
/// Must run with interrupts masked. On error no task is left behind and the
/// image buffer is returned to `frames`.
pub fn prepare<F, P, S>(
    sched: &mut Scheduler,
    frames: &mut F,
    hw: &mut P,
    images: &S,
    name: &str,
    mode: Mode,
) -> Result<LaunchTarget, ExecError>
where
    F: FrameAllocator,
    P: Platform,
    S: ImageSource + ?Sized,
{
    let size = images.size_of(name);
    if size == 0 {
        crate::kprintln!("[EXEC] {}: File not found", name);
        return Err(ExecError::NotFound);
    }

    let buffer_size = page_round_up(size);
    let image = frames.allocate(buffer_size).ok_or(ExecError::OutOfMemory)?;
    let window = frames.window();
    let entry = window.to_virt(image);
    {
        // SAFETY: `buffer_size` bytes just handed out by `frames`, reachable
        // through its window and not shared with anything yet.
        let buffer = unsafe { core::slice::from_raw_parts_mut(entry.as_mut_ptr::<u8>(), buffer_size) };
        let copied = images.load(name, &mut buffer[..size]);
        buffer[copied..].fill(0);
    }

    hw.timer_irq_disable();
    let id = match sched.create_task(frames, entry, size) {
        Ok(id) => id,
        Err(err) => {
            hw.timer_irq_enable();
            frames.free(image, buffer_size);
            crate::kprintln!("[EXEC] {}: {}", name, err);
            return Err(err.into());
        }
    };
    let (page_table, user_sp, kernel_sp) = match sched.tasks().get(id) {
        Some(task) => (task.page_table(), task.context.sp, task.kernel_stack.top(window)),
        None => {
            hw.timer_irq_enable();
            return Err(ExecError::Task(TaskError::NotFound(id)));
        }
    };
    hw.set_page_table(page_table);
    hw.timer_irq_enable();

    match mode {
        Mode::Spawn => sched.adopt(id)?,
        Mode::Replace => sched.adopt_replacing(id)?,
    }

    crate::kprintln!("[EXEC] {} is task {} ({} bytes)", name, id, size);
    Ok(LaunchTarget {
        task: id,
        entry: VirtAddr::new(IMAGE_BASE),
        user_sp,
        kernel_sp,
        page_table,
    })
}

/// Start `name` from the initramfs at EL0. Only returns on failure.
pub fn launch(name: &str, mode: Mode) -> ExecError {
    let saved = arch::irq_disable();
    let Some(images) = crate::fs::initramfs() else {
        crate::kprintln!("[EXEC] No initramfs to load {} from", name);
        arch::irq_restore(saved);
        return ExecError::NotFound;
    };

    let prepared = {
        let mut sched = SCHEDULER.lock();
        prepare(&mut sched, &mut KernelFrames, &mut Board, images, name, mode)
    };

    match prepared {
        // SAFETY: the target's table is live in TTBR0 and maps the image at
        // `entry` and the user stack below `user_sp`.
        Ok(target) => unsafe { arch::enter_el0(target.entry.as_u64(), target.user_sp, target.kernel_sp.as_u64()) },
        Err(err) => {
            arch::irq_restore(saved);
            err
        }
    }
}
