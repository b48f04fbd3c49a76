//! Physical memory management
//!
//! One buddy allocator serves both the kernel heap (`alloc`) and page frames
//! for task stacks, program images and translation tables. Ranges owned by
//! the firmware (boot tables, initramfs, devicetree) are registered before
//! the allocator is initialised and never handed out.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use crate::arch::SpinLock;
use crate::config::PAGE_SIZE;

pub mod address;
pub mod paging;

pub use address::{LinearWindow, PhysAddr, VirtAddr};

// ═══════════════════════════════════════════════════════════════════════════════
// FRAME ALLOCATOR SEAM
// ═══════════════════════════════════════════════════════════════════════════════

/// Source of page-aligned physical memory.
///
/// The scheduler and the mapper only ever see this trait; the kernel backs it
/// with the global buddy allocator and host tests with a fake RAM buffer.
pub trait FrameAllocator {
    /// Allocate at least `size` bytes, page aligned. `None` when exhausted.
    fn allocate(&mut self, size: usize) -> Option<PhysAddr>;

    /// Return a range obtained from `allocate` with the same `size`.
    fn free(&mut self, addr: PhysAddr, size: usize);

    /// How the kernel reaches the frames this allocator hands out.
    fn window(&self) -> LinearWindow;
}

/// Round a request up to whole pages.
pub const fn page_round_up(size: usize) -> usize {
    let size = if size == 0 { 1 } else { size };
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMORY REGIONS (from linker script)
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(target_os = "none")]
extern "C" {
    static __heap_start: u8;
    static __heap_end: u8;
}

/// Heap bounds as kernel virtual addresses.
#[cfg(target_os = "none")]
pub fn heap_region() -> (usize, usize) {
    unsafe {
        let start = &__heap_start as *const u8 as usize;
        let end = &__heap_end as *const u8 as usize;
        (start, end)
    }
}

#[cfg(not(target_os = "none"))]
pub fn heap_region() -> (usize, usize) {
    (0, 0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimum allocation size (16 bytes for alignment)
const MIN_BLOCK_SIZE: usize = 16;

/// Maximum buddy order (2^MAX_ORDER * MIN_BLOCK_SIZE = max block)
const MAX_ORDER: usize = 20; // Up to 16MB blocks

const MAX_RESERVED: usize = 8;

// ═══════════════════════════════════════════════════════════════════════════════
// BUDDY ALLOCATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Free list node (embedded in free blocks)
#[repr(C)]
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

/// Binary buddy allocator over one contiguous region.
///
/// Blocks are always naturally aligned to their size, so the buddy of a
/// block is found by flipping a single address bit.
pub struct BuddyAllocator {
    free_lists: [Option<NonNull<FreeNode>>; MAX_ORDER + 1],
    base: usize,
    size: usize,
    reserved: heapless::Vec<(usize, usize), MAX_RESERVED>,
    allocated: usize,
}

// SAFETY: the free lists point into memory owned by the allocator; callers
// serialise access through a SpinLock.
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    pub const fn new() -> Self {
        BuddyAllocator {
            free_lists: [None; MAX_ORDER + 1],
            base: 0,
            size: 0,
            reserved: heapless::Vec::new(),
            allocated: 0,
        }
    }

    /// Keep `[start, end)` out of the free lists. Only effective before `init`.
    ///
    /// Returns `false` when the reservation table is full.
    pub fn reserve(&mut self, start: usize, end: usize) -> bool {
        if end <= start {
            return true;
        }
        self.reserved.push((start, end)).is_ok()
    }

    /// End of the first reserved range overlapping `[addr, addr + len)`.
    fn reserved_overlap(&self, addr: usize, len: usize) -> Option<usize> {
        self.reserved
            .iter()
            .find(|&&(start, end)| addr < end && start < addr + len)
            .map(|&(_, end)| end)
    }

    /// Seed the free lists with `[base, base + size)` minus reserved ranges.
    ///
    /// # Safety
    /// The region must be writable memory owned exclusively by this allocator.
    pub unsafe fn init(&mut self, base: usize, size: usize) {
        self.base = base;
        self.size = size;
        self.free_lists = [None; MAX_ORDER + 1];

        let end = base + size;
        let mut addr = align_up(base, MIN_BLOCK_SIZE);

        while addr + MIN_BLOCK_SIZE <= end {
            if let Some(reserved_end) = self.reserved_overlap(addr, MIN_BLOCK_SIZE) {
                addr = align_up(reserved_end, MIN_BLOCK_SIZE);
                continue;
            }

            // Grow the block while it stays aligned, inside the region and clear of reservations
            let mut order = 0;
            while order < MAX_ORDER {
                let next = self.block_size(order + 1);
                if addr % next != 0 || addr + next > end || self.reserved_overlap(addr, next).is_some() {
                    break;
                }
                order += 1;
            }

            self.add_to_free_list(addr, order);
            addr += self.block_size(order);
        }
    }

    #[inline]
    fn block_size(&self, order: usize) -> usize {
        MIN_BLOCK_SIZE << order
    }

    fn order_for_size(&self, size: usize) -> usize {
        let size = size.max(MIN_BLOCK_SIZE).next_power_of_two();
        ((size / MIN_BLOCK_SIZE).trailing_zeros() as usize).min(MAX_ORDER)
    }

    unsafe fn add_to_free_list(&mut self, addr: usize, order: usize) {
        let node = addr as *mut FreeNode;
        (*node).next = self.free_lists[order];
        self.free_lists[order] = NonNull::new(node);
    }

    unsafe fn pop_free_list(&mut self, order: usize) -> Option<usize> {
        let node = self.free_lists[order]?;
        self.free_lists[order] = (*node.as_ptr()).next;
        Some(node.as_ptr() as usize)
    }

    /// Unlink `addr` from the free list of `order`, if it is there.
    unsafe fn take_free_block(&mut self, addr: usize, order: usize) -> bool {
        let mut prev: Option<NonNull<FreeNode>> = None;
        let mut curr = self.free_lists[order];

        while let Some(node) = curr {
            if node.as_ptr() as usize == addr {
                match prev {
                    Some(p) => (*p.as_ptr()).next = (*node.as_ptr()).next,
                    None => self.free_lists[order] = (*node.as_ptr()).next,
                }
                return true;
            }
            prev = curr;
            curr = (*node.as_ptr()).next;
        }
        false
    }

    /// Allocate a naturally aligned block of at least `size` bytes.
    pub unsafe fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > self.block_size(MAX_ORDER) {
            return None;
        }
        let order = self.order_for_size(size);

        let mut current_order = (order..=MAX_ORDER).find(|&o| self.free_lists[o].is_some())?;
        let addr = self.pop_free_list(current_order)?;

        // Split down to the requested order, freeing the upper halves
        while current_order > order {
            current_order -= 1;
            self.add_to_free_list(addr + self.block_size(current_order), current_order);
        }

        self.allocated += self.block_size(order);

        NonNull::new(addr as *mut u8)
    }

    /// Return a block, coalescing with free buddies.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let order = self.order_for_size(size);
        let mut addr = ptr.as_ptr() as usize;
        let mut current_order = order;

        while current_order < MAX_ORDER {
            let buddy = addr ^ self.block_size(current_order);
            if !self.take_free_block(buddy, current_order) {
                break;
            }
            addr = addr.min(buddy);
            current_order += 1;
        }

        self.add_to_free_list(addr, current_order);
        self.allocated -= self.block_size(order);
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBAL ALLOCATOR
// ═══════════════════════════════════════════════════════════════════════════════

struct AllocatorInner {
    buddy: BuddyAllocator,
    initialized: bool,
}

pub struct KernelAllocator {
    inner: SpinLock<AllocatorInner>,
}

impl KernelAllocator {
    pub const fn new() -> Self {
        KernelAllocator {
            inner: SpinLock::new(AllocatorInner {
                buddy: BuddyAllocator::new(),
                initialized: false,
            }),
        }
    }

    /// Register reserved ranges (kernel virtual), then seed the free lists.
    ///
    /// # Safety
    /// Must run once, before the first allocation.
    pub unsafe fn init(&self, base: usize, size: usize, reserved: &[(usize, usize)]) {
        let mut inner = self.inner.lock();
        for &(start, end) in reserved {
            if !inner.buddy.reserve(start, end) {
                crate::kprintln!("[MEM] Reservation table full, {:#x}..{:#x} not protected", start, end);
            }
        }
        inner.buddy.init(base, size);
        inner.initialized = true;
    }

    fn allocate_frames(&self, size: usize) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return None;
        }
        // SAFETY: the buddy owns the heap region; blocks of a page or more are page aligned.
        unsafe { inner.buddy.allocate(page_round_up(size)) }
    }

    fn free_frames(&self, ptr: NonNull<u8>, size: usize) {
        let mut inner = self.inner.lock();
        // SAFETY: `ptr` came from `allocate_frames` with the same size.
        unsafe { inner.buddy.deallocate(ptr, page_round_up(size)) }
    }
}


unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return core::ptr::null_mut();
        }

        let size = layout.size().max(layout.align());
        match inner.buddy.allocate(size) {
            Some(ptr) => ptr.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return;
        }

        let size = layout.size().max(layout.align());
        if let Some(ptr) = NonNull::new(ptr) {
            inner.buddy.deallocate(ptr, size);
        }
    }
}

#[cfg_attr(target_os = "none", global_allocator)]
static HEAP: KernelAllocator = KernelAllocator::new();

/// Bring up the heap over the linker-provided region.
///
/// `reserved` lists physical ranges that must never be allocated.
///
/// # Safety
/// Must be called once, before any allocation, with the MMU window live.
pub unsafe fn init(reserved: &[(PhysAddr, PhysAddr)]) {
    let (start, end) = heap_region();
    let window = LinearWindow::KERNEL;

    let mut ranges: heapless::Vec<(usize, usize), MAX_RESERVED> = heapless::Vec::new();
    for &(s, e) in reserved {
        let range = (window.to_virt(s).as_u64() as usize, window.to_virt(e).as_u64() as usize);
        if ranges.push(range).is_err() {
            crate::kprintln!("[MEM] Too many reserved ranges, dropping {:?}..{:?}", s, e);
        }
    }

    HEAP.init(start, end - start, &ranges);
    crate::kprintln!("[MEM] Heap {:#x}..{:#x} ({} KB), {} reserved ranges", start, end, (end - start) / 1024, ranges.len());
}

/// Page frames carved out of the kernel heap, addressed through the kernel window.
#[derive(Clone, Copy, Debug, Default)]
pub struct KernelFrames;

impl FrameAllocator for KernelFrames {
    fn allocate(&mut self, size: usize) -> Option<PhysAddr> {
        let ptr = HEAP.allocate_frames(size)?;
        Some(LinearWindow::KERNEL.to_phys(VirtAddr::from_ptr(ptr.as_ptr())))
    }

    fn free(&mut self, addr: PhysAddr, size: usize) {
        let va = LinearWindow::KERNEL.to_virt(addr);
        if let Some(ptr) = NonNull::new(va.as_mut_ptr::<u8>()) {
            HEAP.free_frames(ptr, size);
        }
    }

    fn window(&self) -> LinearWindow {
        LinearWindow::KERNEL
    }
}
