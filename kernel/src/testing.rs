//! Host-side stand-ins for the hardware
//!
//! Compiled for unit tests and, with the `test_mocks` feature, for the
//! scenario tests in `tests/host`.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::Platform;
use crate::config::PAGE_SIZE;
use crate::kernel::exec::ImageSource;
use crate::kernel::memory::{page_round_up, FrameAllocator, LinearWindow, PhysAddr};

/// Physical address the first fake frame pretends to live at.
pub const FAKE_PHYS_BASE: u64 = 0x0010_0000;

/// A page-aligned host buffer standing in for RAM.
///
/// Frames are handed out first-fit and reached through a [`LinearWindow`]
/// whose offset maps `FAKE_PHYS_BASE` onto the buffer, exactly like the
/// kernel reaches RAM through its high-half window.
pub struct FakePhysMemory {
    base: *mut u8,
    layout: Layout,
    used: Vec<bool>,
    frees: Vec<(PhysAddr, usize)>,
    remaining: Option<usize>,
}

impl FakePhysMemory {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).expect("fake RAM layout");
        // SAFETY: non-zero size, valid alignment.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "fake RAM allocation failed");
        FakePhysMemory {
            base,
            layout,
            used: vec![false; pages],
            frees: Vec::new(),
            remaining: None,
        }
    }

    /// Let `count` more allocations succeed, then fail every one after.
    pub fn fail_after(&mut self, count: usize) {
        self.remaining = Some(count);
    }

    /// Every `free` call so far, in order.
    pub fn frees(&self) -> &[(PhysAddr, usize)] {
        &self.frees
    }

    /// How many times `addr` was freed.
    pub fn free_count(&self, addr: PhysAddr) -> usize {
        self.frees.iter().filter(|&&(freed, _)| freed == addr).count()
    }

    pub fn allocated_pages(&self) -> usize {
        self.used.iter().filter(|&&used| used).count()
    }

    fn page_of(&self, addr: PhysAddr) -> Option<usize> {
        let offset = addr.as_u64().checked_sub(FAKE_PHYS_BASE)?;
        let page = (offset / PAGE_SIZE as u64) as usize;
        (page < self.used.len()).then_some(page)
    }
}

impl FrameAllocator for FakePhysMemory {
    fn allocate(&mut self, size: usize) -> Option<PhysAddr> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }

        let pages = page_round_up(size) / PAGE_SIZE;
        let total = self.used.len();
        let start = (0..total.saturating_sub(pages - 1))
            .find(|&start| self.used[start..start + pages].iter().all(|&used| !used))?;
        self.used[start..start + pages].iter_mut().for_each(|used| *used = true);
        Some(PhysAddr::new(FAKE_PHYS_BASE + (start * PAGE_SIZE) as u64))
    }

    fn free(&mut self, addr: PhysAddr, size: usize) {
        self.frees.push((addr, size));
        if let Some(start) = self.page_of(addr) {
            let end = (start + page_round_up(size) / PAGE_SIZE).min(self.used.len());
            self.used[start..end].iter_mut().for_each(|used| *used = false);
        }
    }

    fn window(&self) -> LinearWindow {
        LinearWindow::new((self.base as u64).wrapping_sub(FAKE_PHYS_BASE))
    }
}

impl Drop for FakePhysMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base, self.layout) }
    }
}

const DAIF_I: u64 = 1 << 7;

/// Records what the scheduler and launcher ask of the hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPlatform {
    pub irq_masked: bool,
    pub timer_irq_enabled: bool,
    pub page_table: PhysAddr,
    pub page_table_loads: usize,
    pub irq_disables: usize,
}

impl MockPlatform {
    pub fn new() -> Self {
        MockPlatform {
            irq_masked: false,
            timer_irq_enabled: true,
            page_table: PhysAddr::new(0),
            page_table_loads: 0,
            irq_disables: 0,
        }
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MockPlatform {
    fn irq_disable(&mut self) -> u64 {
        self.irq_disables += 1;
        let previous = if self.irq_masked { DAIF_I } else { 0 };
        self.irq_masked = true;
        previous
    }

    fn irq_restore(&mut self, state: u64) {
        self.irq_masked = state != 0;
    }

    fn timer_irq_enable(&mut self) {
        self.timer_irq_enabled = true;
    }

    fn timer_irq_disable(&mut self) {
        self.timer_irq_enabled = false;
    }

    fn set_page_table(&mut self, root: PhysAddr) {
        self.page_table = root;
        self.page_table_loads += 1;
    }

    fn active_page_table(&self) -> PhysAddr {
        self.page_table
    }
}

/// Images served from memory, by name.
#[derive(Debug, Clone, Copy)]
pub struct StaticImages<'a> {
    images: &'a [(&'a str, &'a [u8])],
}

impl<'a> StaticImages<'a> {
    pub const fn new(images: &'a [(&'a str, &'a [u8])]) -> Self {
        StaticImages { images }
    }

    fn find(&self, name: &str) -> Option<&'a [u8]> {
        self.images.iter().find(|(image, _)| *image == name).map(|(_, data)| *data)
    }
}

impl ImageSource for StaticImages<'_> {
    fn size_of(&self, name: &str) -> usize {
        self.find(name).map_or(0, <[u8]>::len)
    }

    fn load(&self, name: &str, dst: &mut [u8]) -> usize {
        let Some(data) = self.find(name) else { return 0 };
        let len = data.len().min(dst.len());
        dst[..len].copy_from_slice(&data[..len]);
        len
    }
}
