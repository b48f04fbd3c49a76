//! Filesystem Subsystem
//!
//! The only filesystem is the initramfs the firmware loads next to the
//! kernel: a read-only cpio archive that supplies program images.

pub mod cpio;

pub use cpio::{CpioArchive, CpioError, Entry};

use spin::Once;

use crate::kernel::memory::VirtAddr;

static INITRAMFS: Once<CpioArchive<'static>> = Once::new();

/// Parse the archive at `[start, end)` and make it the image source for `exec`.
///
/// # Safety
/// The range must stay mapped, readable and unmodified for the rest of the
/// kernel's life.
pub unsafe fn init_initramfs(start: VirtAddr, end: VirtAddr) -> Result<&'static CpioArchive<'static>, CpioError> {
    if let Some(archive) = INITRAMFS.get() {
        return Ok(archive);
    }
    let len = end.as_u64().saturating_sub(start.as_u64()) as usize;
    let bytes = core::slice::from_raw_parts(start.as_ptr::<u8>(), len);
    let archive = CpioArchive::new(bytes)?;
    Ok(INITRAMFS.call_once(|| archive))
}

/// The boot archive, once `init_initramfs` succeeded.
pub fn initramfs() -> Option<&'static CpioArchive<'static>> {
    INITRAMFS.get()
}

/// Print the archive's directory.
pub fn list() {
    match initramfs() {
        Some(archive) => {
            for (name, size) in archive.listing() {
                crate::kprintln!("[INITRD]   {:<24} {:>8} bytes", name, size);
            }
        }
        None => crate::kprintln!("[INITRD] No initramfs"),
    }
}
