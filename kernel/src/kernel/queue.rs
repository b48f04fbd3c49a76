//! Task queues and the task arena
//!
//! Every task lives in one arena keyed by id. The ready, wait and zombie
//! queues hold ids only, and each task records which queue (if any) holds
//! it, so a task can never sit in two queues at once.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};

use crate::kernel::memory::{FrameAllocator, VirtAddr};
use crate::kernel::task::{Task, TaskError, TaskId, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Ready,
    Wait,
    Zombie,
}

/// FIFO of task ids.
#[derive(Debug, Default)]
pub struct TaskQueue {
    ids: VecDeque<TaskId>,
}

impl TaskQueue {
    pub const fn new() -> Self {
        Self { ids: VecDeque::new() }
    }

    pub fn push_back(&mut self, id: TaskId) {
        self.ids.push_back(id);
    }

    pub fn pop_front(&mut self) -> Option<TaskId> {
        self.ids.pop_front()
    }

    pub fn front(&self) -> Option<TaskId> {
        self.ids.front().copied()
    }

    /// Unlink `id`, keeping everyone else in order.
    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.ids.iter().position(|&queued| queued == id) {
            Some(index) => {
                self.ids.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ids.iter().copied()
    }
}

/// Owner of every live task and of the three queues.
#[derive(Default)]
pub struct TaskStore {
    tasks: BTreeMap<TaskId, Box<Task>>,
    ready: TaskQueue,
    wait: TaskQueue,
    zombie: TaskQueue,
    next_id: u32,
}

impl TaskStore {
    pub const fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            ready: TaskQueue::new(),
            wait: TaskQueue::new(),
            zombie: TaskQueue::new(),
            next_id: 0,
        }
    }

    /// Build a task for the image at `entry` and append it to the ready queue.
    pub fn create_task<F: FrameAllocator>(
        &mut self,
        frames: &mut F,
        entry: VirtAddr,
        image_size: usize,
    ) -> Result<TaskId, TaskError> {
        let id = TaskId(self.next_id);
        let task = Task::build(frames, id, entry, image_size)?;
        self.next_id += 1;
        self.tasks.insert(id, task);
        self.enqueue(QueueKind::Ready, id);

        #[cfg(feature = "debug")]
        crate::kprintln!("[SCHED] Created task {} (entry {:#x}, {} bytes)", id, entry, image_size);

        Ok(id)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id).map(|task| &**task)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id).map(|task| &mut **task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn queue(&self, kind: QueueKind) -> &TaskQueue {
        match kind {
            QueueKind::Ready => &self.ready,
            QueueKind::Wait => &self.wait,
            QueueKind::Zombie => &self.zombie,
        }
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut TaskQueue {
        match kind {
            QueueKind::Ready => &mut self.ready,
            QueueKind::Wait => &mut self.wait,
            QueueKind::Zombie => &mut self.zombie,
        }
    }

    /// Append `id` to the tail of `kind`, leaving whatever queue held it.
    ///
    /// Returns `false` for unknown ids.
    pub fn enqueue(&mut self, kind: QueueKind, id: TaskId) -> bool {
        let Some(previous) = self.tasks.get(&id).map(|task| task.queue) else {
            return false;
        };
        if let Some(previous) = previous {
            self.queue_mut(previous).remove(id);
        }
        self.queue_mut(kind).push_back(id);
        if let Some(task) = self.tasks.get_mut(&id) {
            task.queue = Some(kind);
        }
        true
    }

    /// Pop the head of `kind`.
    pub fn dequeue(&mut self, kind: QueueKind) -> Option<TaskId> {
        let id = self.queue_mut(kind).pop_front()?;
        if let Some(task) = self.tasks.get_mut(&id) {
            task.queue = None;
        }
        Some(id)
    }

    /// Unlink `id` from `kind`. `false` if it was not there.
    pub fn remove(&mut self, kind: QueueKind, id: TaskId) -> bool {
        if !self.queue_mut(kind).remove(id) {
            return false;
        }
        if let Some(task) = self.tasks.get_mut(&id) {
            task.queue = None;
        }
        true
    }

    /// Find a queued task, searching ready and then wait. Zombies are not found.
    pub fn find_queued(&self, id: TaskId) -> Option<&Task> {
        let task = self.get(id)?;
        matches!(task.queue, Some(QueueKind::Ready) | Some(QueueKind::Wait)).then_some(task)
    }

    pub(crate) fn set_state(&mut self, id: TaskId, state: TaskState) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = state;
        }
    }

    /// Drop `id` from the arena. The task must not be queued.
    pub fn take(&mut self, id: TaskId) -> Option<Box<Task>> {
        if let Some(kind) = self.tasks.get(&id)?.queue {
            self.queue_mut(kind).remove(id);
        }
        self.tasks.remove(&id)
    }

    /// Print a queue, head first.
    pub fn dump(&self, kind: QueueKind) {
        crate::kprint!("[SCHED] {:?}:", kind);
        for id in self.queue(kind).iter() {
            crate::kprint!(" {}", id);
        }
        crate::kprintln!();
    }
}
