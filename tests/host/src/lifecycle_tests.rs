//! Task Lifecycle Tests
//!
//! Creation, termination, zombies and reaping.

use pi_kernel::config::{PAGE_SIZE, THREAD_STACK_SIZE, USER_STACK_SIZE};
use pi_kernel::kernel::memory::{FrameAllocator, PhysAddr};
use pi_kernel::kernel::queue::QueueKind;
use pi_kernel::kernel::scheduler::{Outcome, SchedError, Termination};
use pi_kernel::kernel::task::{TaskId, TaskState};
use pi_kernel::testing::FAKE_PHYS_BASE;
use pi_kernel_host_tests::Machine;

#[test]
fn test_ids_count_up_from_idle() {
    let mut m = Machine::boot(256);
    let ids: Vec<u32> = (0..3).map(|_| m.spawn().as_u32()).collect();

    assert_eq!(ids, [1, 2, 3]);
    assert_eq!(m.queue(QueueKind::Ready), [1, 2, 3]);
    assert_eq!(m.running(), 0);
}

#[test]
fn test_new_task_is_ready() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    let task = m.sched.tasks().get(a).unwrap();

    assert_eq!(task.state, TaskState::Ready);
    assert_eq!(task.counter, 0);
    assert_eq!(task.queue(), Some(QueueKind::Ready));
    assert_eq!(task.image_size, PAGE_SIZE);
}

#[test]
fn test_exit_files_zombie_and_switches() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    m.schedule();

    let outcome = m.sched.exit(&mut m.hw).unwrap();

    assert!(matches!(outcome, Outcome::Switch(ref switch) if switch.from == a && switch.to == TaskId(0)));
    assert_eq!(m.running(), 0);
    assert_eq!(m.queue(QueueKind::Zombie), [a.as_u32()]);
    assert_eq!(m.sched.tasks().get(a).unwrap().state, TaskState::Exited);
    assert!(m.sched.lookup_by_id(a).is_none());
}

#[test]
fn test_kill_ready_task() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    let b = m.spawn();

    assert_eq!(m.sched.terminate(a, &mut m.hw), Ok(Termination::Filed));

    assert_eq!(m.queue(QueueKind::Ready), [b.as_u32()]);
    assert_eq!(m.queue(QueueKind::Zombie), [a.as_u32()]);

    // The rotation never picks it again
    m.schedule();
    m.schedule();
    assert_eq!(m.running(), 0);
    m.schedule();
    assert_eq!(m.running(), b.as_u32());
}

#[test]
fn test_kill_unknown_or_dead() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    m.sched.terminate(a, &mut m.hw).unwrap();

    assert_eq!(m.sched.terminate(a, &mut m.hw), Err(SchedError::NotFound(a)));
    assert_eq!(m.sched.terminate(TaskId(99), &mut m.hw), Err(SchedError::NotFound(TaskId(99))));
}

#[test]
fn test_reap_returns_stacks() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    let b = m.spawn();
    let (a_kstack, a_ustack) = {
        let task = m.sched.tasks().get(a).unwrap();
        (task.kernel_stack.base(), task.user_stack.base())
    };
    let before = m.mem.allocated_pages();

    m.sched.terminate(a, &mut m.hw).unwrap();
    m.sched.terminate(b, &mut m.hw).unwrap();
    assert_eq!(m.sched.reap(&mut m.mem), 2);

    let stack_pages = (THREAD_STACK_SIZE + USER_STACK_SIZE) / PAGE_SIZE;
    assert_eq!(m.mem.allocated_pages(), before - 2 * stack_pages);
    assert_eq!(m.mem.free_count(a_kstack), 1);
    assert_eq!(m.mem.free_count(a_ustack), 1);
    assert!(m.sched.tasks().get(a).is_none());
    assert!(m.queue(QueueKind::Zombie).is_empty());
    assert_eq!(m.sched.tasks().len(), 1);

    // Nothing left to collect
    assert_eq!(m.sched.reap(&mut m.mem), 0);
}

#[test]
fn test_failed_creation_leaves_no_task() {
    let mut m = Machine::boot(256);
    m.spawn();
    // Reuse the idle image, the first frame handed out
    let entry = m.mem.window().to_virt(PhysAddr::new(FAKE_PHYS_BASE));
    m.mem.fail_after(1);

    assert!(m.sched.create_task(&mut m.mem, entry, PAGE_SIZE).is_err());
    assert_eq!(m.sched.tasks().len(), 2);
    assert_eq!(m.queue(QueueKind::Ready), [1]);

    // The next id is not burned by the failure
    m.mem.fail_after(usize::MAX);
    assert_eq!(m.sched.create_task(&mut m.mem, entry, PAGE_SIZE).unwrap(), TaskId(2));
}
