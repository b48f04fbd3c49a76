//! Device Tree Blob (DTB) Parser
//!
//! Minimal flattened devicetree reader. The boot path needs three things from
//! the firmware's blob: its size (so it can be reserved), the board model for
//! the banner and the initramfs range from `/chosen`.

use core::fmt;
use core::str;

use heapless::Vec;

use crate::kernel::memory::{PhysAddr, VirtAddr};

pub const FDT_MAGIC: u32 = 0xd00d_feed;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;

const HEADER_LEN: usize = 40;
/// Deepest node path the walker tracks.
const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdtError {
    BadMagic(u32),
    /// A header offset or structure token points outside the blob.
    Truncated(usize),
    BadToken { offset: usize, token: u32 },
    BadString(usize),
    TooDeep,
}

impl fmt::Display for FdtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdtError::BadMagic(magic) => write!(f, "bad devicetree magic {:#x}", magic),
            FdtError::Truncated(at) => write!(f, "devicetree truncated at {:#x}", at),
            FdtError::BadToken { offset, token } => write!(f, "bad devicetree token {} at {:#x}", token, offset),
            FdtError::BadString(at) => write!(f, "bad devicetree string at {:#x}", at),
            FdtError::TooDeep => write!(f, "devicetree nested too deeply"),
        }
    }
}

/// A parsed view of a flattened devicetree.
#[derive(Debug, Clone, Copy)]
pub struct Fdt<'a> {
    data: &'a [u8],
    off_struct: usize,
    off_strings: usize,
}

fn be_u32(data: &[u8], at: usize) -> Result<u32, FdtError> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(FdtError::Truncated(at))
}

fn c_str(data: &[u8], at: usize) -> Result<&str, FdtError> {
    let rest = data.get(at..).ok_or(FdtError::Truncated(at))?;
    let len = rest.iter().position(|&b| b == 0).ok_or(FdtError::BadString(at))?;
    str::from_utf8(&rest[..len]).map_err(|_| FdtError::BadString(at))
}

const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Decode a one- or two-cell big-endian value.
pub fn read_cells(value: &[u8]) -> Option<u64> {
    match value.len() {
        4 => Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]) as u64),
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(value);
            Some(u64::from_be_bytes(bytes))
        }
        _ => None,
    }
}

/// Node name without its unit address (`memory@0` -> `memory`).
fn base_name(name: &str) -> &str {
    name.split('@').next().unwrap_or(name)
}

impl<'a> Fdt<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, FdtError> {
        let magic = be_u32(data, 0)?;
        if magic != FDT_MAGIC {
            return Err(FdtError::BadMagic(magic));
        }
        let total = be_u32(data, 4)? as usize;
        let data = data.get(..total).ok_or(FdtError::Truncated(total))?;
        if total < HEADER_LEN {
            return Err(FdtError::Truncated(total));
        }
        let off_struct = be_u32(data, 8)? as usize;
        let off_strings = be_u32(data, 12)? as usize;
        if off_struct >= total || off_strings > total {
            return Err(FdtError::Truncated(off_struct.max(off_strings)));
        }
        Ok(Fdt { data, off_struct, off_strings })
    }

    /// Parse the blob the firmware left at `addr`.
    ///
    /// # Safety
    /// `addr` must point at readable memory holding a complete blob.
    pub unsafe fn from_ptr(addr: VirtAddr) -> Result<Fdt<'static>, FdtError> {
        let head = core::slice::from_raw_parts(addr.as_ptr::<u8>(), 8);
        let magic = be_u32(head, 0)?;
        if magic != FDT_MAGIC {
            return Err(FdtError::BadMagic(magic));
        }
        let total = be_u32(head, 4)? as usize;
        Fdt::new(core::slice::from_raw_parts(addr.as_ptr::<u8>(), total))
    }

    /// `totalsize` from the header: the whole blob, strings included.
    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// Walk the structure block, calling `visit(path, name, value)` for every
    /// property. `path` holds the node names from the root down (root is "").
    /// Stops early when `visit` returns `true`.
    pub fn walk(&self, mut visit: impl FnMut(&[&'a str], &'a str, &'a [u8]) -> bool) -> Result<(), FdtError> {
        let mut path: Vec<&'a str, MAX_DEPTH> = Vec::new();
        let mut at = self.off_struct;
        loop {
            let token = be_u32(self.data, at)?;
            at += 4;
            match token {
                FDT_BEGIN_NODE => {
                    let name = c_str(self.data, at)?;
                    path.push(name).map_err(|_| FdtError::TooDeep)?;
                    at = align4(at + name.len() + 1);
                }
                FDT_END_NODE => {
                    path.pop();
                }
                FDT_PROP => {
                    let len = be_u32(self.data, at)? as usize;
                    let nameoff = be_u32(self.data, at + 4)? as usize;
                    at += 8;
                    let value = self.data.get(at..at + len).ok_or(FdtError::Truncated(at))?;
                    let name = c_str(self.data, self.off_strings + nameoff)?;
                    if visit(&path, name, value) {
                        return Ok(());
                    }
                    at = align4(at + len);
                }
                FDT_NOP => {}
                FDT_END => return Ok(()),
                token => return Err(FdtError::BadToken { offset: at - 4, token }),
            }
        }
    }

    /// Value of property `name` on the node at `node` (e.g. `/chosen`).
    /// Unit addresses in the tree are ignored when matching.
    pub fn property(&self, node: &str, name: &str) -> Result<Option<&'a [u8]>, FdtError> {
        let wanted = node.trim_matches('/');
        let mut found = None;
        self.walk(|path, prop, value| {
            let matches = prop == name
                && path.len() == wanted.split('/').filter(|part| !part.is_empty()).count() + 1
                && path[1..]
                    .iter()
                    .zip(wanted.split('/').filter(|part| !part.is_empty()))
                    .all(|(have, want)| base_name(have) == want || *have == want);
            if matches {
                found = Some(value);
            }
            matches
        })?;
        Ok(found)
    }

    /// The root node's `model` string, if present.
    pub fn model(&self) -> Option<&'a str> {
        let value = self.property("/", "model").ok()??;
        let value = value.split(|&b| b == 0).next()?;
        str::from_utf8(value).ok()
    }

    /// Physical range of the initramfs, from `/chosen`.
    pub fn initrd(&self) -> Option<(PhysAddr, PhysAddr)> {
        let start = read_cells(self.property("/chosen", "linux,initrd-start").ok()??)?;
        let end = read_cells(self.property("/chosen", "linux,initrd-end").ok()??)?;
        (end > start).then(|| (PhysAddr::new(start), PhysAddr::new(end)))
    }
}
