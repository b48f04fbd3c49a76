//! Scheduler Scenario Tests
//!
//! Round-robin order, blocking and the interrupt discipline around switches.

use pi_kernel::arch::Platform;
use pi_kernel::kernel::queue::QueueKind;
use pi_kernel::kernel::scheduler::Outcome;
use pi_kernel::kernel::task::{TaskId, TaskState};
use pi_kernel_host_tests::Machine;
use proptest::prelude::*;

// ═══════════════════════════════════════════════════════════════════════════════
// ROUND ROBIN
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_round_robin_cycles_through_idle() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    let b = m.spawn();
    let c = m.spawn();

    let mut order = vec![m.running()];
    for _ in 0..5 {
        m.schedule();
        order.push(m.running());
    }

    assert_eq!(order, [0, a.as_u32(), b.as_u32(), c.as_u32(), 0, a.as_u32()]);
}

#[test]
fn test_running_task_is_never_queued() {
    let mut m = Machine::boot(256);
    m.spawn();
    m.spawn();

    for _ in 0..6 {
        m.schedule();
        let current = m.sched.current().unwrap();
        let task = m.sched.tasks().get(current).unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.queue(), None);
        assert!(!m.sched.tasks().queue(QueueKind::Ready).contains(current));
    }
}

#[test]
fn test_tick_requests_preemption() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    m.schedule();

    assert!(m.sched.tick());
    assert!(m.sched.tick());
    assert_eq!(m.sched.tasks().get(a).unwrap().counter, 2);

    m.schedule();
    assert_eq!(m.running(), 0);
    assert_eq!(m.sched.tasks().get(a).unwrap().state, TaskState::Ready);
}

#[test]
fn test_page_table_follows_running_task() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    let b = m.spawn();

    // The table `switch_to` loads is the incoming task's own root
    for expected in [a, b, TaskId(0), a] {
        let outcome = m.schedule();
        let switch = match outcome {
            Outcome::Switch(switch) => switch,
            other => panic!("expected a switch, got {:?}", other),
        };
        assert_eq!(switch.to, expected);

        let root = m.sched.tasks().get(expected).unwrap().address_space.root();
        assert_eq!(unsafe { (*switch.next).pgd }, root.as_u64());
        assert_eq!(m.hw.active_page_table(), root);
    }
    assert_eq!(m.hw.page_table_loads, 4);
}

#[test]
fn test_interrupts_restored_after_switch() {
    let mut m = Machine::boot(256);
    m.spawn();

    assert!(matches!(m.schedule(), Outcome::Switch(_)));
    assert!(!m.hw.irq_masked);
    assert!(m.hw.timer_irq_enabled);

    // Only idle and one task: the task goes back, idle comes in
    assert!(matches!(m.schedule(), Outcome::Switch(_)));
    assert!(!m.hw.irq_masked);
}

#[test]
fn test_masked_caller_stays_masked() {
    let mut m = Machine::boot(256);
    m.hw.irq_masked = true;

    assert_eq!(m.schedule(), Outcome::Stay);
    assert!(m.hw.irq_masked);
    assert!(m.hw.timer_irq_enabled);
}

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCKING
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_block_and_wake() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    let b = m.spawn();
    m.schedule();
    assert_eq!(m.running(), a.as_u32());

    let outcome = m.sched.block_current(&mut m.hw).unwrap();
    assert!(matches!(outcome, Outcome::Switch(_)));
    assert_eq!(m.running(), b.as_u32());
    assert_eq!(m.queue(QueueKind::Wait), [a.as_u32()]);
    assert_eq!(m.sched.tasks().get(a).unwrap().state, TaskState::Blocked);

    // A blocked task is skipped by the rotation
    m.schedule();
    m.schedule();
    assert_eq!(m.running(), b.as_u32());

    m.sched.wake(a).unwrap();
    assert!(m.queue(QueueKind::Wait).is_empty());
    assert_eq!(m.queue(QueueKind::Ready).last(), Some(&a.as_u32()));
    assert_eq!(m.sched.tasks().get(a).unwrap().state, TaskState::Ready);
}

#[test]
fn test_wake_requires_blocked_task() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    assert!(m.sched.wake(a).is_err());
    assert!(m.sched.wake(TaskId(42)).is_err());
}

#[test]
fn test_blocked_task_found_by_lookup() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    m.schedule();
    m.sched.block_current(&mut m.hw).unwrap();

    assert_eq!(m.sched.lookup_by_id(a).map(|task| task.id), Some(a));
    assert_eq!(m.sched.lookup_by_id(TaskId(0)).map(|task| task.id), Some(TaskId(0)));
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROPERTIES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
enum Op {
    Spawn,
    Schedule,
    Block,
    Wake(usize),
    Kill(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Spawn),
        Just(Op::Schedule),
        Just(Op::Block),
        (0usize..8).prop_map(Op::Wake),
        (1usize..8).prop_map(Op::Kill),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_each_task_in_at_most_one_place(ops in prop::collection::vec(op(), 1..40)) {
        let mut m = Machine::boot(1024);
        for op in ops {
            match op {
                Op::Spawn if m.sched.tasks().len() < 8 => { m.spawn(); }
                Op::Spawn => {}
                Op::Schedule => { m.schedule(); }
                // Idle never blocks
                Op::Block if m.running() != 0 => {
                    let outcome = m.sched.block_current(&mut m.hw).unwrap();
                    if let Outcome::Switch(switch) = outcome {
                        m.hw.irq_masked = switch.irq_state != 0;
                    }
                }
                Op::Block => {}
                Op::Wake(n) => { let _ = m.sched.wake(TaskId(n as u32)); }
                Op::Kill(n) if m.running() != n as u32 => {
                    let _ = m.sched.terminate(TaskId(n as u32), &mut m.hw);
                }
                Op::Kill(_) => {}
            }

            let current = m.sched.current();
            for id in (0..8).map(TaskId) {
                let Some(task) = m.sched.tasks().get(id) else { continue };
                let places = [QueueKind::Ready, QueueKind::Wait, QueueKind::Zombie]
                    .iter()
                    .filter(|&&kind| m.sched.tasks().queue(kind).contains(id))
                    .count()
                    + usize::from(current == Some(id));
                prop_assert_eq!(places, 1, "task {} is in {} places", id, places);
                prop_assert_eq!(task.state == TaskState::Running, current == Some(id));
            }
        }
    }
}
