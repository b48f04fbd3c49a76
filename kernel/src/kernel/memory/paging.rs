//! ARM64 Virtual Memory System Architecture (VMSA) Paging
//!
//! Four-level translation tables with a 4KB granule and 48-bit addresses.
//!
//! # Structure
//! - Level 0 (PGD): 512GB per entry
//! - Level 1 (PUD): 1GB per entry (Block or Table)
//! - Level 2 (PMD): 2MB per entry (Block or Table)
//! - Level 3 (PTE): 4KB page
//!
//! Kernel memory lives behind TTBR1 as a block-mapped linear window. Each
//! task owns a root table installed in TTBR0 and populated on demand by
//! [`AddressSpace::map`]. Intermediate tables are allocated lazily and are
//! never reclaimed.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

use super::address::{LinearWindow, PhysAddr, VirtAddr};
use super::FrameAllocator;
use crate::config::{LOCAL_PERIPHERAL_BASE, PAGE_SIZE, PERIPHERAL_BASE};

/// Bytes covered by one level-2 block.
pub const BLOCK_SIZE_2M: u64 = 0x20_0000;

const ADDRESS_MASK: u64 = 0x0000_ffff_ffff_f000;

/// A 64-bit translation table descriptor.
///
/// A zero descriptor is absent. Anything else is taken to be present, which
/// is how the mapper decides whether to allocate the next-level table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_absent(&self) -> bool {
        self.0 == 0
    }

    pub fn is_valid(&self) -> bool {
        self.0 & EntryFlags::VALID.bits() != 0
    }

    /// Table descriptor at levels 0..2, page descriptor at level 3.
    pub fn is_table(&self) -> bool {
        self.0 & (EntryFlags::VALID | EntryFlags::TABLE).bits() == (EntryFlags::VALID | EntryFlags::TABLE).bits()
    }

    pub fn address(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDRESS_MASK)
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags(self.0 & !ADDRESS_MASK)
    }

    /// Point the descriptor at `addr` (rounded down to its page) with `flags`.
    pub fn set(&mut self, addr: PhysAddr, flags: EntryFlags) {
        self.0 = (addr.as_u64() & ADDRESS_MASK) | flags.bits();
    }
}

/// A translation table (512 descriptors = 4KB).
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry(0); 512],
        }
    }

    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageTableEntry::is_absent)
    }
}

/// Descriptor attribute bits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryFlags(u64);

impl EntryFlags {
    // --- Descriptor type ---
    pub const VALID: Self = Self(1 << 0);
    /// Table (levels 0..2) or page (level 3); cleared means block.
    pub const TABLE: Self = Self(1 << 1);
    pub const PAGE: Self = Self(0b11);
    pub const BLOCK: Self = Self(0b01);

    // --- Memory attributes (index into MAIR_EL1) ---
    /// Index 0 (Device-nGnRnE)
    pub const ATTR_DEVICE: Self = Self(0 << 2);
    /// Index 1 (Normal, non-cacheable)
    pub const ATTR_NORMAL_NC: Self = Self(1 << 2);
    pub const ATTR_INDEX_MASK: Self = Self(0b111 << 2);

    // --- Access permissions ---
    /// EL0 may access the page
    pub const USER: Self = Self(1 << 6);
    pub const READ_ONLY: Self = Self(1 << 7);

    /// Access flag; without it the first access faults.
    pub const AF: Self = Self(1 << 10);

    // --- Execution permissions ---
    pub const PXN: Self = Self(1 << 53);
    pub const UXN: Self = Self(1 << 54);

    // --- Presets ---
    /// Descriptor written for every intermediate table the mapper creates.
    pub const INTERMEDIATE: Self = Self(Self::PAGE.0 | Self::AF.0 | Self::USER.0 | Self::READ_ONLY.0);
    /// What task regions are mapped with: user read-write, normal memory.
    pub const USER_NORMAL: Self = Self(Self::PAGE.0 | Self::AF.0 | Self::ATTR_NORMAL_NC.0 | Self::USER.0);
    /// Kernel data pages inside a task table: EL1 only, never executed.
    pub const KERNEL_DATA: Self = Self(Self::PAGE.0 | Self::AF.0 | Self::ATTR_NORMAL_NC.0 | Self::PXN.0 | Self::UXN.0);
    /// Signal return trampoline: user read-only executable.
    pub const USER_CODE_RO: Self = Self(Self::USER_NORMAL.0 | Self::READ_ONLY.0);
    pub const KERNEL_NORMAL_BLOCK: Self = Self(Self::BLOCK.0 | Self::AF.0 | Self::ATTR_NORMAL_NC.0);
    pub const KERNEL_DEVICE_BLOCK: Self = Self(Self::BLOCK.0 | Self::AF.0 | Self::ATTR_DEVICE.0 | Self::USER.0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// The MAIR slot selected by these flags, if it is one we program.
    pub fn memory_type(&self) -> Option<MemoryType> {
        match (self.0 & Self::ATTR_INDEX_MASK.0) >> 2 {
            0 => Some(MemoryType::Device),
            1 => Some(MemoryType::NormalNonCacheable),
            _ => None,
        }
    }
}

impl BitOr for EntryFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EntryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EntryFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for EntryFlags {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// The two memory types programmed into MAIR_EL1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryType {
    Device,
    NormalNonCacheable,
}

impl MemoryType {
    pub const fn mair_index(self) -> u64 {
        match self {
            MemoryType::Device => 0,
            MemoryType::NormalNonCacheable => 1,
        }
    }

    pub const fn mair_encoding(self) -> u64 {
        match self {
            MemoryType::Device => 0x00,
            MemoryType::NormalNonCacheable => 0x44,
        }
    }
}

/// Value loaded into MAIR_EL1 by the boot code.
pub const MAIR_VALUE: u64 = (MemoryType::Device.mair_encoding() << (8 * MemoryType::Device.mair_index()))
    | (MemoryType::NormalNonCacheable.mair_encoding() << (8 * MemoryType::NormalNonCacheable.mair_index()));

/// TCR_EL1: 48-bit regions and 4KB granule for both halves.
pub const TCR_VALUE: u64 = (64 - 48) | ((64 - 48) << 16) | (0b00 << 14) | (0b10 << 30);

/// Why a mapping request failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// No frame was available for an intermediate table.
    OutOfMemory,
    /// The flags select a MAIR slot that is not programmed.
    InvalidAttributes,
    /// A block descriptor sits where a table was needed.
    BlockInPath(VirtAddr),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfMemory => write!(f, "out of memory for page table"),
            MapError::InvalidAttributes => write!(f, "invalid memory attributes"),
            MapError::BlockInPath(va) => write!(f, "block mapping in the way of {:#x}", va),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TABLE WALKS
// ═══════════════════════════════════════════════════════════════════════════════

/// # Safety
/// `table` must be a frame holding a translation table, visible through `window`.
unsafe fn table_at<'a>(window: LinearWindow, table: PhysAddr) -> &'a mut PageTable {
    &mut *window.to_virt(table).as_mut_ptr::<PageTable>()
}

/// Walk from `root` to the level-3 table covering `va`, creating missing
/// tables on the way. Returns the table and how many were created.
///
/// # Safety
/// `root` must be a live table reachable through `frames.window()`.
unsafe fn walk_create<F: FrameAllocator>(frames: &mut F, root: PhysAddr, va: VirtAddr) -> (Result<PhysAddr, MapError>, usize) {
    let window = frames.window();
    let mut table = root;
    let mut created = 0;

    for level in 0..3 {
        let entry = &mut table_at(window, table).entries[va.table_index(level)];
        if entry.is_absent() {
            let Some(frame) = frames.allocate(PAGE_SIZE) else {
                return (Err(MapError::OutOfMemory), created);
            };
            table_at(window, frame).zero();
            entry.set(frame, EntryFlags::INTERMEDIATE);
            created += 1;
        } else if !entry.is_table() {
            return (Err(MapError::BlockInPath(va)), created);
        }
        table = entry.address();
    }

    (Ok(table), created)
}

/// Map `size` bytes starting at `va` to `pa`, one 4KB page at a time.
///
/// Both addresses are rounded down to their page, and every page the byte
/// range `[va, va + size)` touches is mapped.
///
/// Each page's leaf is overwritten unconditionally, so remapping a page
/// leaves the last request in effect. The request stops at the first page
/// that cannot be mapped; pages already mapped stay mapped. Every
/// intermediate table allocated is added to `tables`.
///
/// # Safety
/// `root` must be a live, exclusively owned table reachable through
/// `frames.window()`.
unsafe fn map_range<F: FrameAllocator>(
    frames: &mut F,
    root: PhysAddr,
    va: VirtAddr,
    pa: PhysAddr,
    size: usize,
    flags: EntryFlags,
    tables: &mut usize,
) -> Result<(), MapError> {
    if flags.memory_type().is_none() {
        return Err(MapError::InvalidAttributes);
    }

    if size == 0 {
        return Ok(());
    }

    let window = frames.window();
    let (va_base, pa_base) = (va.page_align_down(), pa.page_align_down());
    let span = (size + va.page_offset()) as u64;
    for offset in (0..span).step_by(PAGE_SIZE) {
        let page_va = va_base + offset;
        let (leaf_table, created) = walk_create(frames, root, page_va);
        *tables += created;
        let leaf_table = leaf_table?;

        let entry = &mut table_at(window, leaf_table).entries[page_va.table_index(3)];
        entry.set(pa_base + offset, flags | EntryFlags::PAGE | EntryFlags::AF);

        #[cfg(feature = "debug")]
        crate::kprintln!("[MEM] map {:#x} -> {:#x} = {:#x}", page_va, pa_base + offset, entry.as_u64());
    }
    Ok(())
}

/// Read the level-3 descriptor for `va`, if every table on the way exists.
///
/// # Safety
/// `root` must be a live table reachable through `window`.
pub unsafe fn leaf(window: LinearWindow, root: PhysAddr, va: VirtAddr) -> Option<PageTableEntry> {
    let mut table = root;
    for level in 0..3 {
        let entry = table_at(window, table).entries[va.table_index(level)];
        if !entry.is_table() {
            return None;
        }
        table = entry.address();
    }
    let entry = table_at(window, table).entries[va.table_index(3)];
    (!entry.is_absent()).then_some(entry)
}

/// Software walk of a task table.
///
/// # Safety
/// `root` must be a live table reachable through `window`.
pub unsafe fn translate(window: LinearWindow, root: PhysAddr, va: VirtAddr) -> Option<PhysAddr> {
    let entry = leaf(window, root, va)?;
    entry.is_valid().then(|| entry.address() + va.page_offset() as u64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TASK ADDRESS SPACE
// ═══════════════════════════════════════════════════════════════════════════════

/// A task's user-half translation tables.
///
/// Owns the root frame and counts the intermediate tables created for it.
/// Neither is returned to the allocator when the task exits.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysAddr,
    window: LinearWindow,
    tables: usize,
}

impl AddressSpace {
    /// Allocate and zero an empty root table.
    pub fn new<F: FrameAllocator>(frames: &mut F) -> Result<Self, MapError> {
        let root = frames.allocate(PAGE_SIZE).ok_or(MapError::OutOfMemory)?;
        let window = frames.window();
        // SAFETY: freshly allocated frame, visible through the allocator's window.
        unsafe { table_at(window, root).zero() };
        Ok(Self { root, window, tables: 1 })
    }

    /// Physical address of the root table (the value loaded into TTBR0).
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// How the kernel reaches this space's tables and frames.
    pub fn window(&self) -> LinearWindow {
        self.window
    }

    /// Tables owned by this space, root included.
    pub fn table_count(&self) -> usize {
        self.tables
    }

    pub fn map<F: FrameAllocator>(
        &mut self,
        frames: &mut F,
        va: VirtAddr,
        pa: PhysAddr,
        size: usize,
        flags: EntryFlags,
    ) -> Result<(), MapError> {
        // SAFETY: the root was allocated by `new` and is owned by `self`.
        unsafe { map_range(frames, self.root, va, pa, size, flags, &mut self.tables) }
    }

    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: the root was allocated by `new` and is owned by `self`.
        unsafe { translate(self.window, self.root, va) }
    }

    pub fn leaf(&self, va: VirtAddr) -> Option<PageTableEntry> {
        // SAFETY: as above.
        unsafe { leaf(self.window, self.root, va) }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// KERNEL TABLES
// ═══════════════════════════════════════════════════════════════════════════════

/// Replace the boot 1GB blocks with 2MB blocks.
///
/// The low gigabyte is normal memory up to the peripheral window and device
/// memory above it. The second gigabyte (local peripherals) is device memory.
/// The caller must invalidate the TLB afterwards.
///
/// # Safety
/// The three frames must be the live boot PUD and two spare frames, all
/// visible through `window`.
pub unsafe fn init_kernel_tables(window: LinearWindow, pud: PhysAddr, pmd_low: PhysAddr, pmd_high: PhysAddr) {
    let low = table_at(window, pmd_low);
    for (i, entry) in low.entries.iter_mut().enumerate() {
        let base = PhysAddr::new(BLOCK_SIZE_2M * i as u64);
        let flags = if base.as_u64() >= PERIPHERAL_BASE {
            EntryFlags::KERNEL_DEVICE_BLOCK
        } else {
            EntryFlags::KERNEL_NORMAL_BLOCK
        };
        entry.set(base, flags);
    }

    let high = table_at(window, pmd_high);
    for (i, entry) in high.entries.iter_mut().enumerate() {
        let base = PhysAddr::new(LOCAL_PERIPHERAL_BASE + BLOCK_SIZE_2M * i as u64);
        entry.set(base, EntryFlags::KERNEL_DEVICE_BLOCK);
    }

    let pud = table_at(window, pud);
    pud.entries[0].set(pmd_low, EntryFlags::PAGE);
    pud.entries[1].set(pmd_high, EntryFlags::PAGE);
}
