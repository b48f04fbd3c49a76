//! Task Management
//!
//! Defines the Task Control Block (TCB) and the memory a task owns.

use alloc::boxed::Box;
use core::fmt;

use static_assertions::{assert_eq_size, const_assert_eq};

use crate::config::{self, IMAGE_BASE, KERNEL_STACK_WINDOW, THREAD_STACK_SIZE, USER_STACK_SIZE, USER_STACK_WINDOW};
use crate::kernel::memory::paging::{AddressSpace, EntryFlags, MapError};
use crate::kernel::memory::{FrameAllocator, LinearWindow, PhysAddr, VirtAddr};
use crate::kernel::queue::QueueKind;
use crate::kernel::signal::SignalState;

/// Unique task identifier, assigned in creation order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl TaskId {
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Exited,
}

/// Callee-saved register snapshot used by `switch_to`.
///
/// The assembly indexes this by fixed offsets: x19..x28 at 0..80, fp at 80,
/// lr at 88, sp at 96 and the page table root at 104.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pgd: u64,
}

assert_eq_size!(Context, [u64; 14]);
const_assert_eq!(core::mem::offset_of!(Context, fp), 80);
const_assert_eq!(core::mem::offset_of!(Context, lr), 88);
const_assert_eq!(core::mem::offset_of!(Context, sp), 96);
const_assert_eq!(core::mem::offset_of!(Context, pgd), 104);

impl Context {
    /// First-run context: `switch_to` returns into `entry` on the task's user stack window.
    pub fn initial(entry: VirtAddr, root: PhysAddr) -> Self {
        let sp = config::initial_user_sp();
        Context {
            fp: sp,
            lr: entry.as_u64(),
            sp,
            pgd: root.as_u64(),
            ..Default::default()
        }
    }
}

/// What ran out while building a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    KernelStack,
    UserStack,
    PageTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    OutOfMemory(Resource),
    Map(MapError),
    NotFound(TaskId),
}

impl From<MapError> for TaskError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => TaskError::OutOfMemory(Resource::PageTable),
            other => TaskError::Map(other),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::OutOfMemory(what) => write!(f, "out of memory ({:?})", what),
            TaskError::Map(err) => write!(f, "mapping failed: {}", err),
            TaskError::NotFound(id) => write!(f, "no task with id {}", id),
        }
    }
}

/// A run of page frames owned by one task.
///
/// Not `Clone`: releasing consumes the stack, so a frame range goes back to
/// the allocator at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct Stack {
    base: PhysAddr,
    size: usize,
}

impl Stack {
    pub fn allocate<F: FrameAllocator>(frames: &mut F, size: usize) -> Option<Self> {
        frames.allocate(size).map(|base| Stack { base, size })
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Top of the stack as the kernel sees it.
    pub fn top(&self, window: LinearWindow) -> VirtAddr {
        window.to_virt(self.base) + self.size as u64
    }

    pub fn release<F: FrameAllocator>(self, frames: &mut F) {
        frames.free(self.base, self.size);
    }
}

/// Task Control Block
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    /// Timer ticks observed while this task was running.
    pub counter: u64,
    pub priority: u32,
    /// Kernel-visible address of the program image.
    pub entry: VirtAddr,
    pub image_size: usize,
    pub context: Context,
    pub kernel_stack: Stack,
    pub user_stack: Stack,
    pub address_space: AddressSpace,
    pub signals: SignalState,
    /// The queue currently holding this task, if any.
    pub(crate) queue: Option<QueueKind>,
}

impl Task {
    /// Allocate stacks and a root table, then map image, user stack and
    /// kernel stack at their fixed windows.
    ///
    /// Stacks allocated before a failure are returned to `frames`.
    /// Translation tables created before a failure are not.
    pub fn build<F: FrameAllocator>(
        frames: &mut F,
        id: TaskId,
        entry: VirtAddr,
        image_size: usize,
    ) -> Result<Box<Task>, TaskError> {
        let kernel_stack =
            Stack::allocate(frames, THREAD_STACK_SIZE).ok_or(TaskError::OutOfMemory(Resource::KernelStack))?;
        let Some(user_stack) = Stack::allocate(frames, USER_STACK_SIZE) else {
            kernel_stack.release(frames);
            return Err(TaskError::OutOfMemory(Resource::UserStack));
        };

        let layout = AddressSpace::new(frames).and_then(|mut space| {
            map_layout(&mut space, frames, &kernel_stack, &user_stack, entry, image_size).map(|()| space)
        });
        let address_space = match layout {
            Ok(space) => space,
            Err(err) => {
                kernel_stack.release(frames);
                user_stack.release(frames);
                return Err(err.into());
            }
        };

        Ok(Box::new(Task {
            id,
            state: TaskState::Ready,
            counter: 0,
            priority: config::DEFAULT_PRIORITY,
            entry,
            image_size,
            context: Context::initial(entry, address_space.root()),
            kernel_stack,
            user_stack,
            address_space,
            signals: SignalState::new(),
            queue: None,
        }))
    }

    pub fn queue(&self) -> Option<QueueKind> {
        self.queue
    }

    pub fn page_table(&self) -> PhysAddr {
        PhysAddr::new(self.context.pgd)
    }

    /// Return both stacks to the allocator. Translation tables and the
    /// program image stay allocated.
    pub fn release<F: FrameAllocator>(self: Box<Self>, frames: &mut F) {
        let task = *self;
        task.kernel_stack.release(frames);
        task.user_stack.release(frames);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("counter", &self.counter)
            .field("entry", &self.entry)
            .field("queue", &self.queue)
            .finish()
    }
}

fn map_layout<F: FrameAllocator>(
    space: &mut AddressSpace,
    frames: &mut F,
    kernel_stack: &Stack,
    user_stack: &Stack,
    entry: VirtAddr,
    image_size: usize,
) -> Result<(), MapError> {
    let image = frames.window().to_phys(entry);
    space.map(frames, VirtAddr::new(IMAGE_BASE), image, image_size, EntryFlags::USER_NORMAL)?;
    space.map(frames, VirtAddr::new(USER_STACK_WINDOW), user_stack.base(), USER_STACK_SIZE, EntryFlags::USER_NORMAL)?;
    space.map(frames, VirtAddr::new(KERNEL_STACK_WINDOW), kernel_stack.base(), THREAD_STACK_SIZE, EntryFlags::KERNEL_DATA)
}
