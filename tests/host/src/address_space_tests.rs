//! Address Space Tests
//!
//! Four-level 4KB mappings built on fake physical memory, and the fixed
//! layout every task gets.

use pi_kernel::config::{IMAGE_BASE, KERNEL_STACK_WINDOW, PAGE_SIZE, USER_STACK_WINDOW};
use pi_kernel::kernel::memory::paging::{AddressSpace, EntryFlags, MapError};
use pi_kernel::kernel::memory::{FrameAllocator, VirtAddr};
use pi_kernel::testing::FakePhysMemory;
use pi_kernel_host_tests::Machine;

fn space(mem: &mut FakePhysMemory) -> AddressSpace {
    AddressSpace::new(mem).unwrap()
}

#[test]
fn test_first_page_builds_three_tables() {
    let mut mem = FakePhysMemory::new(32);
    let mut space = space(&mut mem);
    let frame = mem.allocate(PAGE_SIZE).unwrap();
    assert_eq!(space.table_count(), 1);

    space.map(&mut mem, VirtAddr::new(0x40_0000), frame, PAGE_SIZE, EntryFlags::USER_NORMAL).unwrap();
    assert_eq!(space.table_count(), 4);

    // Same 2MB region: the walk reuses every table
    let other = mem.allocate(PAGE_SIZE).unwrap();
    space.map(&mut mem, VirtAddr::new(0x40_1000), other, PAGE_SIZE, EntryFlags::USER_NORMAL).unwrap();
    assert_eq!(space.table_count(), 4);

    assert_eq!(space.translate(VirtAddr::new(0x40_0000)), Some(frame));
    assert_eq!(space.translate(VirtAddr::new(0x40_1abc)), Some(other + 0xabc));
    assert_eq!(space.translate(VirtAddr::new(0x40_2000)), None);
}

#[test]
fn test_remap_last_write_wins() {
    let mut mem = FakePhysMemory::new(32);
    let mut space = space(&mut mem);
    let first = mem.allocate(PAGE_SIZE).unwrap();
    let second = mem.allocate(PAGE_SIZE).unwrap();
    let va = VirtAddr::new(0x1000);

    space.map(&mut mem, va, first, PAGE_SIZE, EntryFlags::USER_NORMAL).unwrap();
    space.map(&mut mem, va, second, PAGE_SIZE, EntryFlags::USER_CODE_RO).unwrap();

    assert_eq!(space.translate(va), Some(second));
    let leaf = space.leaf(va).unwrap();
    assert!(leaf.flags().contains(EntryFlags::READ_ONLY));
    assert!(leaf.flags().contains(EntryFlags::AF));
    assert_eq!(space.table_count(), 4);
}

#[test]
fn test_multi_page_range() {
    let mut mem = FakePhysMemory::new(32);
    let mut space = space(&mut mem);
    let frames = mem.allocate(3 * PAGE_SIZE).unwrap();
    let va = VirtAddr::new(0x7f_f000);

    // Crosses a 2MB boundary, so a second leaf table is needed
    space.map(&mut mem, va, frames, 3 * PAGE_SIZE, EntryFlags::USER_NORMAL).unwrap();

    for page in 0..3u64 {
        assert_eq!(space.translate(va + page * PAGE_SIZE as u64), Some(frames + page * PAGE_SIZE as u64));
    }
    assert_eq!(space.table_count(), 5);
}

#[test]
fn test_out_of_table_frames() {
    let mut mem = FakePhysMemory::new(32);
    let mut space = space(&mut mem);
    let frame = mem.allocate(PAGE_SIZE).unwrap();
    mem.fail_after(1);

    let result = space.map(&mut mem, VirtAddr::new(0x1000), frame, PAGE_SIZE, EntryFlags::USER_NORMAL);

    assert_eq!(result, Err(MapError::OutOfMemory));
    // The table that was built stays owned by the space
    assert_eq!(space.table_count(), 2);
    assert_eq!(space.translate(VirtAddr::new(0x1000)), None);
}

#[test]
fn test_unprogrammed_attributes_rejected() {
    let mut mem = FakePhysMemory::new(32);
    let mut space = space(&mut mem);
    let frame = mem.allocate(PAGE_SIZE).unwrap();
    let bogus = EntryFlags::from_bits(EntryFlags::USER_NORMAL.bits() | (0b111 << 2));

    let result = space.map(&mut mem, VirtAddr::new(0x1000), frame, PAGE_SIZE, bogus);

    assert_eq!(result, Err(MapError::InvalidAttributes));
    assert_eq!(space.table_count(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// TASK LAYOUT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_task_layout() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    let task = m.sched.tasks().get(a).unwrap();
    let space = &task.address_space;
    let window = m.mem.window();

    assert_eq!(space.translate(VirtAddr::new(IMAGE_BASE)), Some(window.to_phys(task.entry)));
    assert_eq!(space.translate(VirtAddr::new(USER_STACK_WINDOW)), Some(task.user_stack.base()));
    assert_eq!(space.translate(VirtAddr::new(KERNEL_STACK_WINDOW)), Some(task.kernel_stack.base()));
    assert_eq!(space.root(), task.page_table());

    // Image at the bottom, both stacks under one leaf table at the top
    assert_eq!(space.table_count(), 7);
    for va in [IMAGE_BASE, USER_STACK_WINDOW] {
        assert!(space.leaf(VirtAddr::new(va)).unwrap().flags().contains(EntryFlags::USER));
    }
    assert!(!space.leaf(VirtAddr::new(KERNEL_STACK_WINDOW)).unwrap().flags().contains(EntryFlags::USER));
}

#[test]
fn test_tasks_do_not_share_images() {
    let mut m = Machine::boot(256);
    let a = m.spawn();
    let b = m.spawn();
    let tasks = m.sched.tasks();
    let (a, b) = (tasks.get(a).unwrap(), tasks.get(b).unwrap());

    assert_ne!(a.page_table(), b.page_table());
    assert_ne!(
        a.address_space.translate(VirtAddr::new(IMAGE_BASE)),
        b.address_space.translate(VirtAddr::new(IMAGE_BASE))
    );
}
