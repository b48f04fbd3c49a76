//! Task Scheduler
//!
//! Cooperative plus tick-driven round-robin over a FIFO ready queue.
//!
//! The running task is held outside every queue. `schedule` files the
//! outgoing task by state (READY back to the tail, BLOCKED to wait, EXITED
//! to zombie), promotes the ready head and hands back the two contexts so
//! the caller can drop the scheduler lock before calling `switch_to`.

use core::fmt;

use crate::arch::{self, Board, Platform, SpinLock};
use crate::config::PAGE_SIZE;
use crate::kernel::memory::{FrameAllocator, KernelFrames, VirtAddr};
use crate::kernel::queue::{QueueKind, TaskStore};
use crate::kernel::task::{Context, Task, TaskError, TaskId, TaskState};

/// What `schedule` decided.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to switch to; interrupts restored.
    Stay,
    /// There was no current task and the ready head was installed directly.
    Installed(TaskId),
    /// The caller must `switch_to(prev, next)` and then restore `irq_state`.
    Switch(Switch),
}

/// A pending context switch.
///
/// The pointers stay valid while both tasks are in the arena; boxed tasks
/// never move. The timer interrupt is re-enabled but interrupts stay masked
/// until the caller restores `irq_state` on the far side of the switch.
#[derive(Debug, PartialEq, Eq)]
pub struct Switch {
    pub from: TaskId,
    pub to: TaskId,
    pub prev: *mut Context,
    pub next: *const Context,
    pub irq_state: u64,
}

/// Result of terminating a task.
#[derive(Debug, PartialEq, Eq)]
pub enum Termination {
    /// A non-running task went straight to the zombie queue.
    Filed,
    /// The running task terminated itself; this is the follow-up schedule.
    Rescheduled(Outcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// The outgoing task's state disagrees with the queues.
    InvalidState(TaskId),
    NotFound(TaskId),
    NoCurrentTask,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::InvalidState(id) => write!(f, "task {} is READY but not on the ready queue", id),
            SchedError::NotFound(id) => write!(f, "no task with id {}", id),
            SchedError::NoCurrentTask => write!(f, "no task is running"),
        }
    }
}

pub struct Scheduler {
    tasks: TaskStore,
    current: Option<TaskId>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            tasks: TaskStore::new(),
            current: None,
        }
    }

    /// Create the idle task and make it the running task.
    pub fn init<F: FrameAllocator>(&mut self, frames: &mut F, idle_entry: VirtAddr) -> Result<TaskId, TaskError> {
        let id = self.tasks.create_task(frames, idle_entry, PAGE_SIZE)?;
        self.tasks.remove(QueueKind::Ready, id);
        self.tasks.set_state(id, TaskState::Running);
        self.current = Some(id);
        crate::kprintln!("[SCHED] Idle task {} running", id);
        Ok(id)
    }

    pub fn create_task<F: FrameAllocator>(
        &mut self,
        frames: &mut F,
        entry: VirtAddr,
        image_size: usize,
    ) -> Result<TaskId, TaskError> {
        self.tasks.create_task(frames, entry, image_size)
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current?)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        self.tasks.get_mut(self.current?)
    }

    /// Find a live task: ready queue, then wait queue, then the running task.
    pub fn lookup_by_id(&self, id: TaskId) -> Option<&Task> {
        self.tasks
            .find_queued(id)
            .or_else(|| self.current.filter(|&current| current == id).and_then(|current| self.tasks.get(current)))
    }

    pub fn lookup_by_id_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.lookup_by_id(id)?;
        self.tasks.get_mut(id)
    }

    /// Pick the next task to run.
    ///
    /// Runs with interrupts and the timer interrupt disabled. Every return
    /// path except `Switch` restores both before returning.
    pub fn schedule<P: Platform>(&mut self, hw: &mut P) -> Result<Outcome, SchedError> {
        let irq_state = hw.irq_disable();
        hw.timer_irq_disable();

        let Some(prev) = self.current else {
            let outcome = match self.tasks.dequeue(QueueKind::Ready) {
                Some(next) => {
                    self.tasks.set_state(next, TaskState::Running);
                    self.current = Some(next);
                    Outcome::Installed(next)
                }
                None => Outcome::Stay,
            };
            Self::resume(hw, irq_state);
            return Ok(outcome);
        };

        let next = match self.tasks.queue(QueueKind::Ready).front() {
            Some(next) if next != prev => next,
            _ => {
                Self::resume(hw, irq_state);
                return Ok(Outcome::Stay);
            }
        };

        if let Err(err) = self.file_outgoing(prev) {
            Self::resume(hw, irq_state);
            return Err(err);
        }

        self.tasks.remove(QueueKind::Ready, next);
        self.tasks.set_state(next, TaskState::Running);
        self.current = Some(next);

        #[cfg(feature = "debug")]
        {
            crate::kprintln!("[SCHED] {} -> {}", prev, next);
            self.tasks.dump(QueueKind::Ready);
        }

        let next_ctx = self.tasks.get(next).map(|task| &task.context as *const Context);
        let prev_ctx = self.tasks.get_mut(prev).map(|task| &mut task.context as *mut Context);
        let (Some(prev_ctx), Some(next_ctx)) = (prev_ctx, next_ctx) else {
            Self::resume(hw, irq_state);
            return Err(SchedError::InvalidState(next));
        };
        let switch = Switch {
            from: prev,
            to: next,
            prev: prev_ctx,
            next: next_ctx,
            irq_state,
        };

        hw.timer_irq_enable();
        Ok(Outcome::Switch(switch))
    }

    fn resume<P: Platform>(hw: &mut P, irq_state: u64) {
        hw.timer_irq_enable();
        hw.irq_restore(irq_state);
    }

    /// Move the outgoing task to the queue its state calls for.
    fn file_outgoing(&mut self, prev: TaskId) -> Result<(), SchedError> {
        let task = self.tasks.get(prev).ok_or(SchedError::InvalidState(prev))?;
        let (state, queue) = (task.state, task.queue());
        match state {
            TaskState::Running => {
                self.tasks.set_state(prev, TaskState::Ready);
                self.tasks.enqueue(QueueKind::Ready, prev);
            }
            TaskState::Blocked => {
                self.tasks.enqueue(QueueKind::Wait, prev);
            }
            TaskState::Exited => {
                self.tasks.enqueue(QueueKind::Zombie, prev);
            }
            TaskState::Ready if queue == Some(QueueKind::Ready) => {}
            TaskState::Ready => return Err(SchedError::InvalidState(prev)),
        }
        Ok(())
    }

    /// Count a timer tick against the running task. Returns whether a
    /// reschedule should follow.
    pub fn tick(&mut self) -> bool {
        match self.current_task_mut() {
            Some(task) => {
                task.counter += 1;
                true
            }
            None => false,
        }
    }

    /// Terminate `id`. The running task is rescheduled away immediately;
    /// any other task is unlinked and filed as a zombie.
    pub fn terminate<P: Platform>(&mut self, id: TaskId, hw: &mut P) -> Result<Termination, SchedError> {
        if self.lookup_by_id(id).is_none() {
            return Err(SchedError::NotFound(id));
        }

        self.tasks.set_state(id, TaskState::Exited);

        if self.current == Some(id) {
            return self.schedule(hw).map(Termination::Rescheduled);
        }

        self.tasks.enqueue(QueueKind::Zombie, id);
        crate::kprintln!("[SCHED] Task {} terminated", id);
        Ok(Termination::Filed)
    }

    /// Terminate the running task.
    pub fn exit<P: Platform>(&mut self, hw: &mut P) -> Result<Outcome, SchedError> {
        let id = self.current.ok_or(SchedError::NoCurrentTask)?;
        match self.terminate(id, hw)? {
            Termination::Rescheduled(outcome) => Ok(outcome),
            Termination::Filed => Ok(Outcome::Stay),
        }
    }

    /// Park the running task on the wait queue and switch away.
    pub fn block_current<P: Platform>(&mut self, hw: &mut P) -> Result<Outcome, SchedError> {
        let id = self.current.ok_or(SchedError::NoCurrentTask)?;
        self.tasks.set_state(id, TaskState::Blocked);
        self.schedule(hw)
    }

    /// Make a blocked task runnable again.
    pub fn wake(&mut self, id: TaskId) -> Result<(), SchedError> {
        let task = self.tasks.get(id).ok_or(SchedError::NotFound(id))?;
        if task.state != TaskState::Blocked {
            return Err(SchedError::NotFound(id));
        }

        if self.current == Some(id) {
            self.tasks.set_state(id, TaskState::Running);
        } else {
            self.tasks.set_state(id, TaskState::Ready);
            self.tasks.enqueue(QueueKind::Ready, id);
        }
        Ok(())
    }

    /// Make `id` (which must be ready) the running task without a context
    /// switch. Used when the caller is about to drop into the task at EL0.
    pub fn adopt(&mut self, id: TaskId) -> Result<(), SchedError> {
        self.adopt_with(id, false)
    }

    /// Like `adopt`, but the outgoing task is retired to the zombie queue.
    pub fn adopt_replacing(&mut self, id: TaskId) -> Result<(), SchedError> {
        self.adopt_with(id, true)
    }

    fn adopt_with(&mut self, id: TaskId, retire: bool) -> Result<(), SchedError> {
        if !self.tasks.remove(QueueKind::Ready, id) {
            return Err(SchedError::NotFound(id));
        }

        if let Some(prev) = self.current.take() {
            let prior = self.tasks.get(prev).map(|task| task.state);
            if retire {
                self.tasks.set_state(prev, TaskState::Exited);
            }
            if let Err(err) = self.file_outgoing(prev) {
                if let Some(state) = prior {
                    self.tasks.set_state(prev, state);
                }
                self.tasks.enqueue(QueueKind::Ready, id);
                self.current = Some(prev);
                return Err(err);
            }
        }

        self.tasks.set_state(id, TaskState::Running);
        self.current = Some(id);
        Ok(())
    }

    /// Release every zombie's stacks and drop its control block.
    pub fn reap<F: FrameAllocator>(&mut self, frames: &mut F) -> usize {
        let mut reaped = 0;
        while let Some(id) = self.tasks.dequeue(QueueKind::Zombie) {
            if let Some(task) = self.tasks.take(id) {
                task.release(frames);
                reaped += 1;
                crate::kprintln!("[SCHED] Reaped task {}", id);
            }
        }
        reaped
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBAL SCHEDULER
// ═══════════════════════════════════════════════════════════════════════════════

pub static SCHEDULER: SpinLock<Scheduler> = SpinLock::new(Scheduler::new());

/// Carry out a scheduling decision once the scheduler lock is released.
fn complete(result: Result<Outcome, SchedError>) {
    match result {
        Ok(Outcome::Switch(switch)) => unsafe {
            arch::switch_to(switch.prev, switch.next);
            // Back on this task's stack
            arch::irq_restore(switch.irq_state);
        },
        Ok(_) => {}
        Err(err) => crate::kprintln!("[SCHED] {}", err),
    }
}

/// Create the idle task from the kernel's idle loop.
pub fn init() -> Result<TaskId, TaskError> {
    let entry = VirtAddr::new(idle as usize as u64);
    SCHEDULER.lock().init(&mut KernelFrames, entry)
}

/// Yield the processor.
pub fn schedule() {
    let saved = arch::irq_disable();
    let result = SCHEDULER.lock().schedule(&mut Board);
    complete(result);
    arch::irq_restore(saved);
}

/// Timer interrupt: re-arm, account, preempt.
pub fn tick() {
    crate::drivers::timer::rearm_tick();
    let resched = SCHEDULER.lock().tick();
    if resched {
        schedule();
    }
}

/// Terminate the running task. Never returns to it.
pub fn exit() -> ! {
    let saved = arch::irq_disable();
    let result = SCHEDULER.lock().exit(&mut Board);
    complete(result);
    // Only reached if nothing else was runnable
    loop {
        schedule();
        arch::irq_restore(saved);
        arch::wfi();
    }
}

/// Terminate any task by id.
pub fn kill(id: TaskId) -> Result<(), SchedError> {
    let saved = arch::irq_disable();
    let result = SCHEDULER.lock().terminate(id, &mut Board);
    let outcome = match result {
        Ok(Termination::Rescheduled(outcome)) => Ok(outcome),
        Ok(Termination::Filed) => Ok(Outcome::Stay),
        Err(err) => Err(err),
    };
    let failed = outcome.as_ref().err().copied();
    complete(outcome);
    arch::irq_restore(saved);
    failed.map_or(Ok(()), Err)
}

pub fn block_current() {
    let saved = arch::irq_disable();
    let result = SCHEDULER.lock().block_current(&mut Board);
    complete(result);
    arch::irq_restore(saved);
}

pub fn wake(id: TaskId) -> Result<(), SchedError> {
    SCHEDULER.lock().wake(id)
}

pub fn current_id() -> Option<TaskId> {
    SCHEDULER.lock().current()
}

pub fn reap() -> usize {
    SCHEDULER.lock().reap(&mut KernelFrames)
}

/// Idle loop: collect zombies, give everyone else a turn.
pub extern "C" fn idle() -> ! {
    arch::irq_enable();
    loop {
        reap();
        schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::FrameAllocator;
    use crate::testing::{FakePhysMemory, MockPlatform};
    use alloc::vec::Vec;

    struct Rig {
        sched: Scheduler,
        mem: FakePhysMemory,
        hw: MockPlatform,
    }

    impl Rig {
        fn new() -> Self {
            let mut mem = FakePhysMemory::new(256);
            let mut sched = Scheduler::new();
            let idle = mem.allocate(PAGE_SIZE).unwrap();
            let entry = mem.window().to_virt(idle);
            sched.init(&mut mem, entry).unwrap();
            Rig { sched, mem, hw: MockPlatform::new() }
        }

        fn spawn(&mut self) -> TaskId {
            let image = self.mem.allocate(PAGE_SIZE).unwrap();
            let entry = self.mem.window().to_virt(image);
            self.sched.create_task(&mut self.mem, entry, PAGE_SIZE).unwrap()
        }

        fn ready(&self) -> Vec<u32> {
            self.sched.tasks().queue(QueueKind::Ready).iter().map(TaskId::as_u32).collect()
        }

        fn running(&self) -> u32 {
            self.sched.current().unwrap().as_u32()
        }
    }

    #[test]
    fn test_new_task_preempts_idle() {
        let mut rig = Rig::new();
        assert_eq!(rig.running(), 0);
        assert!(rig.ready().is_empty());

        let t = rig.spawn();
        let outcome = rig.sched.schedule(&mut rig.hw).unwrap();

        let Outcome::Switch(switch) = outcome else { panic!("expected a switch") };
        assert_eq!((switch.from, switch.to), (TaskId(0), t));
        assert_eq!(rig.running(), t.as_u32());
        assert_eq!(rig.ready(), [0]);
        assert_eq!(rig.sched.tasks().get(TaskId(0)).unwrap().state, TaskState::Ready);
        assert_eq!(rig.sched.current_task().unwrap().state, TaskState::Running);
    }

    #[test]
    fn test_switch_points_at_task_contexts() {
        let mut rig = Rig::new();
        let t = rig.spawn();

        let Outcome::Switch(switch) = rig.sched.schedule(&mut rig.hw).unwrap() else { panic!("expected a switch") };

        let next = &rig.sched.tasks().get(t).unwrap().context as *const Context;
        let prev = &rig.sched.tasks().get(TaskId(0)).unwrap().context as *const Context;
        assert_eq!(switch.next, next);
        assert_eq!(switch.prev as *const Context, prev);
        assert!(rig.hw.irq_masked);
        assert!(rig.hw.timer_irq_enabled);
    }

    #[test]
    fn test_round_robin_order() {
        let mut rig = Rig::new();
        let ids: Vec<_> = (0..3).map(|_| rig.spawn()).collect();

        let mut order = Vec::new();
        for _ in 0..4 {
            rig.sched.schedule(&mut rig.hw).unwrap();
            order.push(rig.running());
        }

        assert_eq!(order, [ids[0].as_u32(), ids[1].as_u32(), ids[2].as_u32(), 0]);
    }

    #[test]
    fn test_alone_stays() {
        let mut rig = Rig::new();
        assert_eq!(rig.sched.schedule(&mut rig.hw), Ok(Outcome::Stay));
        assert_eq!(rig.running(), 0);
        assert!(!rig.hw.irq_masked);
        assert!(rig.hw.timer_irq_enabled);
    }

    #[test]
    fn test_ready_current_at_head_is_noop() {
        let mut rig = Rig::new();
        rig.spawn();
        // Force the running idle task onto the ready head
        rig.sched.tasks.set_state(TaskId(0), TaskState::Ready);
        rig.sched.tasks.enqueue(QueueKind::Ready, TaskId(0));
        rig.sched.tasks.remove(QueueKind::Ready, TaskId(1));
        rig.sched.tasks.enqueue(QueueKind::Ready, TaskId(1));

        assert_eq!(rig.sched.schedule(&mut rig.hw), Ok(Outcome::Stay));
        assert_eq!(rig.running(), 0);
        assert_eq!(rig.ready(), [0, 1]);
    }

    #[test]
    fn test_ready_but_unqueued_is_invalid() {
        let mut rig = Rig::new();
        rig.spawn();
        rig.sched.tasks.set_state(TaskId(0), TaskState::Ready);

        let result = rig.sched.schedule(&mut rig.hw);

        assert_eq!(result, Err(SchedError::InvalidState(TaskId(0))));
        assert_eq!(rig.running(), 0);
        assert!(!rig.hw.irq_masked);
        assert!(rig.hw.timer_irq_enabled);
    }

    #[test]
    fn test_schedule_without_current_installs_head() {
        let mut mem = FakePhysMemory::new(64);
        let mut hw = MockPlatform::new();
        let mut sched = Scheduler::new();
        let image = mem.allocate(PAGE_SIZE).unwrap();
        let entry = mem.window().to_virt(image);
        let id = sched.create_task(&mut mem, entry, PAGE_SIZE).unwrap();

        assert_eq!(sched.schedule(&mut hw), Ok(Outcome::Installed(id)));
        assert_eq!(sched.current(), Some(id));
        assert_eq!(Scheduler::new().schedule(&mut hw), Ok(Outcome::Stay));
    }

    #[test]
    fn test_blocked_task_goes_to_wait_queue() {
        let mut rig = Rig::new();
        let t = rig.spawn();
        rig.sched.schedule(&mut rig.hw).unwrap();

        let outcome = rig.sched.block_current(&mut rig.hw).unwrap();

        assert!(matches!(outcome, Outcome::Switch(_)));
        assert_eq!(rig.running(), 0);
        assert!(rig.ready().is_empty());
        assert!(rig.sched.tasks().queue(QueueKind::Wait).contains(t));

        rig.sched.wake(t).unwrap();
        assert_eq!(rig.ready(), [t.as_u32()]);
        assert!(rig.sched.tasks().queue(QueueKind::Wait).is_empty());
        assert_eq!(rig.sched.wake(t), Err(SchedError::NotFound(t)));
    }

    #[test]
    fn test_exit_moves_running_task_to_zombie() {
        let mut rig = Rig::new();
        let t = rig.spawn();
        rig.sched.schedule(&mut rig.hw).unwrap();

        let outcome = rig.sched.exit(&mut rig.hw).unwrap();

        assert!(matches!(outcome, Outcome::Switch(Switch { from, .. }) if from == t));
        assert_eq!(rig.running(), 0);
        assert!(rig.sched.tasks().queue(QueueKind::Zombie).contains(t));
        assert!(rig.sched.lookup_by_id(t).is_none());
    }

    #[test]
    fn test_terminate_waiting_task() {
        let mut rig = Rig::new();
        let a = rig.spawn();
        let b = rig.spawn();

        assert_eq!(rig.sched.terminate(a, &mut rig.hw), Ok(Termination::Filed));

        assert_eq!(rig.ready(), [b.as_u32()]);
        assert_eq!(rig.sched.tasks().get(a).unwrap().state, TaskState::Exited);
        assert_eq!(rig.sched.terminate(a, &mut rig.hw), Err(SchedError::NotFound(a)));
        assert_eq!(rig.sched.terminate(TaskId(42), &mut rig.hw), Err(SchedError::NotFound(TaskId(42))));
    }

    #[test]
    fn test_reap_frees_stacks_once() {
        let mut rig = Rig::new();
        let t = rig.spawn();
        let (kernel, user) = {
            let task = rig.sched.tasks().get(t).unwrap();
            (task.kernel_stack.base(), task.user_stack.base())
        };
        rig.sched.terminate(t, &mut rig.hw).unwrap();

        assert_eq!(rig.sched.reap(&mut rig.mem), 1);
        assert_eq!(rig.sched.reap(&mut rig.mem), 0);

        assert_eq!(rig.mem.free_count(kernel), 1);
        assert_eq!(rig.mem.free_count(user), 1);
        assert!(rig.sched.tasks().get(t).is_none());
    }

    #[test]
    fn test_lookup_order() {
        let mut rig = Rig::new();
        let a = rig.spawn();
        assert_eq!(rig.sched.lookup_by_id(a).unwrap().id, a);
        assert_eq!(rig.sched.lookup_by_id(TaskId(0)).unwrap().id, TaskId(0));
        assert!(rig.sched.lookup_by_id(TaskId(9)).is_none());
    }

    #[test]
    fn test_adopt_files_previous_task() {
        let mut rig = Rig::new();
        let t = rig.spawn();

        rig.sched.adopt(t).unwrap();

        assert_eq!(rig.running(), t.as_u32());
        assert_eq!(rig.ready(), [0]);
        assert_eq!(rig.sched.adopt(TaskId(5)), Err(SchedError::NotFound(TaskId(5))));
    }

    #[test]
    fn test_adopt_replacing_retires_caller() {
        let mut rig = Rig::new();
        let caller = rig.spawn();
        rig.sched.adopt(caller).unwrap();
        let image = rig.spawn();

        rig.sched.adopt_replacing(image).unwrap();

        assert_eq!(rig.running(), image.as_u32());
        assert_eq!(rig.ready(), [0]);
        let zombies: Vec<_> = rig.sched.tasks().queue(QueueKind::Zombie).iter().collect();
        assert_eq!(zombies, [caller]);
        assert_eq!(rig.sched.tasks().get(caller).unwrap().state, TaskState::Exited);
        assert!(rig.sched.lookup_by_id(caller).is_none());
    }

    #[test]
    fn test_tick_counts_running_task() {
        let mut rig = Rig::new();
        assert!(rig.sched.tick());
        assert!(rig.sched.tick());
        assert_eq!(rig.sched.current_task().unwrap().counter, 2);
        assert!(!Scheduler::new().tick());
    }
}
