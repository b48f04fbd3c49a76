//! Launcher Tests
//!
//! Programs loaded out of an initramfs archive into fresh tasks.

use pi_kernel::config::{initial_user_sp, IMAGE_BASE, INIT_PROGRAM, PAGE_SIZE};
use pi_kernel::fs::cpio::CpioArchive;
use pi_kernel::kernel::exec::{prepare, ExecError, ImageSource, Mode};
use pi_kernel::kernel::memory::{FrameAllocator, VirtAddr};
use pi_kernel::kernel::queue::QueueKind;
use pi_kernel::kernel::task::{TaskId, TaskState};
use pi_kernel_host_tests::{cpio_archive, Machine};

/// `mov x0, #0; mov x8, #5; svc #0` (exit)
const EXIT: &[u8] = &[0x00, 0x00, 0x80, 0xd2, 0xa8, 0x00, 0x80, 0xd2, 0x01, 0x00, 0x00, 0xd4];

fn initramfs() -> Vec<u8> {
    let big: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| i as u8).collect();
    cpio_archive(&[(INIT_PROGRAM, EXIT), ("big.img", &big)])
}

fn image_bytes(m: &Machine, id: TaskId, len: usize) -> Vec<u8> {
    let task = m.sched.tasks().get(id).unwrap();
    let window = m.mem.window();
    (0..len as u64)
        .map(|offset| {
            let pa = task.address_space.translate(VirtAddr::new(IMAGE_BASE + offset)).unwrap();
            unsafe { *window.to_virt(pa).as_ptr::<u8>() }
        })
        .collect()
}

#[test]
fn test_archive_serves_images() {
    let bytes = initramfs();
    let archive = CpioArchive::new(&bytes).unwrap();

    assert_eq!(archive.size_of(INIT_PROGRAM), EXIT.len());
    assert_eq!(archive.size_of("big.img"), PAGE_SIZE + 100);
    assert_eq!(archive.size_of("missing.img"), 0);
}

#[test]
fn test_exec_init_from_archive() {
    let bytes = initramfs();
    let archive = CpioArchive::new(&bytes).unwrap();
    let mut m = Machine::boot(256);

    let target = prepare(&mut m.sched, &mut m.mem, &mut m.hw, &archive, INIT_PROGRAM, Mode::Spawn).unwrap();

    assert_eq!(target.entry, VirtAddr::new(IMAGE_BASE));
    assert_eq!(target.user_sp, initial_user_sp());
    assert_eq!(m.hw.page_table, target.page_table);
    assert_eq!(m.hw.page_table_loads, 1);
    assert!(m.hw.timer_irq_enabled);

    assert_eq!(m.sched.current(), Some(target.task));
    assert_eq!(m.sched.tasks().get(target.task).unwrap().state, TaskState::Running);
    assert_eq!(m.queue(QueueKind::Ready), [0]);
    assert_eq!(image_bytes(&m, target.task, EXIT.len()), EXIT);
}

#[test]
fn test_multi_page_image_zero_tail() {
    let bytes = initramfs();
    let archive = CpioArchive::new(&bytes).unwrap();
    let mut m = Machine::boot(256);

    let target = prepare(&mut m.sched, &mut m.mem, &mut m.hw, &archive, "big.img", Mode::Spawn).unwrap();

    let image = image_bytes(&m, target.task, 2 * PAGE_SIZE);
    let expected: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| i as u8).collect();
    assert_eq!(&image[..PAGE_SIZE + 100], expected.as_slice());
    assert!(image[PAGE_SIZE + 100..].iter().all(|&b| b == 0));
}

#[test]
fn test_missing_program() {
    let bytes = initramfs();
    let archive = CpioArchive::new(&bytes).unwrap();
    let mut m = Machine::boot(256);
    let pages = m.mem.allocated_pages();

    let result = prepare(&mut m.sched, &mut m.mem, &mut m.hw, &archive, "sh.img", Mode::Spawn);

    assert_eq!(result, Err(ExecError::NotFound));
    assert_eq!(m.mem.allocated_pages(), pages);
    assert_eq!(m.running(), 0);
    assert_eq!(m.hw.page_table_loads, 0);
}

#[test]
fn test_exec_replaces_caller() {
    let bytes = initramfs();
    let archive = CpioArchive::new(&bytes).unwrap();
    let mut m = Machine::boot(256);
    let init = prepare(&mut m.sched, &mut m.mem, &mut m.hw, &archive, INIT_PROGRAM, Mode::Spawn).unwrap();

    let next = prepare(&mut m.sched, &mut m.mem, &mut m.hw, &archive, "big.img", Mode::Replace).unwrap();

    assert_eq!(m.sched.current(), Some(next.task));
    assert_eq!(m.queue(QueueKind::Zombie), [init.task.as_u32()]);
    assert_eq!(m.queue(QueueKind::Ready), [0]);
    assert_eq!(m.hw.page_table, next.page_table);

    // The idle loop collects the old image's stacks
    assert_eq!(m.sched.reap(&mut m.mem), 1);
    assert!(m.sched.tasks().get(init.task).is_none());
}

#[test]
fn test_launched_task_joins_rotation() {
    let bytes = initramfs();
    let archive = CpioArchive::new(&bytes).unwrap();
    let mut m = Machine::boot(256);
    let other = m.spawn();
    let init = prepare(&mut m.sched, &mut m.mem, &mut m.hw, &archive, INIT_PROGRAM, Mode::Spawn).unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        m.schedule();
        order.push(m.running());
    }

    assert_eq!(order, [other.as_u32(), 0, init.task.as_u32()]);
}
