//! CPIO "newc" archive reader
//!
//! Each member is a 110-byte ASCII header (`070701` followed by thirteen
//! 8-digit hex fields), the NUL-terminated path name padded so the data
//! starts on a 4-byte boundary, then the data, again padded to 4 bytes.
//! The member named `TRAILER!!!` ends the archive.

use core::fmt;
use core::str;

use heapless::Vec;

use crate::kernel::exec::ImageSource;

const MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

// Field positions (in 8-character units after the magic)
const FIELD_MODE: usize = 1;
const FIELD_FILESIZE: usize = 6;
const FIELD_NAMESIZE: usize = 11;

const MODE_TYPE_MASK: u32 = 0o170000;
const MODE_DIR: u32 = 0o040000;

/// Entries returned by [`CpioArchive::listing`].
pub const MAX_LISTING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpioError {
    /// No `070701` magic at this offset.
    BadMagic(usize),
    /// A header field is not hexadecimal.
    BadField(usize),
    /// A header, name or body runs past the end of the archive.
    Truncated(usize),
    /// A path name is not UTF-8.
    BadName(usize),
}

impl fmt::Display for CpioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpioError::BadMagic(at) => write!(f, "bad cpio magic at offset {:#x}", at),
            CpioError::BadField(at) => write!(f, "bad cpio header field at offset {:#x}", at),
            CpioError::Truncated(at) => write!(f, "cpio member at offset {:#x} is truncated", at),
            CpioError::BadName(at) => write!(f, "cpio name at offset {:#x} is not UTF-8", at),
        }
    }
}

/// One archive member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub name: &'a str,
    pub mode: u32,
    pub data: &'a [u8],
}

impl Entry<'_> {
    pub fn is_dir(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_DIR
    }
}

const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn parse_hex(bytes: &[u8]) -> Option<u32> {
    bytes.iter().try_fold(0u32, |acc, &b| {
        let digit = (b as char).to_digit(16)?;
        Some(acc << 4 | digit)
    })
}

/// A read-only view of an in-memory newc archive.
#[derive(Debug, Clone, Copy)]
pub struct CpioArchive<'a> {
    data: &'a [u8],
}

impl<'a> CpioArchive<'a> {
    /// Wrap `data`, checking that it starts with a newc header.
    pub fn new(data: &'a [u8]) -> Result<Self, CpioError> {
        if data.len() < HEADER_LEN {
            return Err(CpioError::Truncated(0));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(CpioError::BadMagic(0));
        }
        Ok(CpioArchive { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Members in archive order, up to the trailer.
    pub fn entries(&self) -> Entries<'a> {
        Entries { data: self.data, offset: 0, done: false }
    }

    /// Look a member up by path. A leading `./` or `/` on either side is ignored.
    pub fn find(&self, name: &str) -> Option<Entry<'a>> {
        let wanted = normalize(name);
        self.entries()
            .map_while(Result::ok)
            .find(|entry| !entry.is_dir() && normalize(entry.name) == wanted)
    }

    /// Names and sizes of the first `MAX_LISTING` members.
    pub fn listing(&self) -> Vec<(&'a str, usize), MAX_LISTING> {
        let mut listing = Vec::new();
        for entry in self.entries().map_while(Result::ok) {
            if listing.push((entry.name, entry.data.len())).is_err() {
                break;
            }
        }
        listing
    }
}

fn normalize(name: &str) -> &str {
    let name = name.strip_prefix("./").unwrap_or(name);
    name.strip_prefix('/').unwrap_or(name)
}

/// Iterator over the members of a [`CpioArchive`].
pub struct Entries<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Entries<'a> {
    fn parse(&self) -> Result<(Entry<'a>, usize), CpioError> {
        let at = self.offset;
        let header = self
            .data
            .get(at..at + HEADER_LEN)
            .ok_or(CpioError::Truncated(at))?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(CpioError::BadMagic(at));
        }

        let field = |index: usize| {
            let start = MAGIC.len() + index * 8;
            parse_hex(&header[start..start + 8]).ok_or(CpioError::BadField(at))
        };
        let mode = field(FIELD_MODE)?;
        let filesize = field(FIELD_FILESIZE)? as usize;
        let namesize = field(FIELD_NAMESIZE)? as usize;

        let name_start = at + HEADER_LEN;
        let name_bytes = self
            .data
            .get(name_start..name_start + namesize)
            .ok_or(CpioError::Truncated(at))?;
        // namesize counts the terminating NUL
        let name_bytes = name_bytes.split(|&b| b == 0).next().unwrap_or(name_bytes);
        let name = str::from_utf8(name_bytes).map_err(|_| CpioError::BadName(at))?;

        let data_start = align4(name_start + namesize);
        let data = self
            .data
            .get(data_start..data_start + filesize)
            .ok_or(CpioError::Truncated(at))?;

        Ok((Entry { name, mode, data }, align4(data_start + filesize)))
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<Entry<'a>, CpioError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.parse() {
            Ok((entry, _)) if entry.name == TRAILER => {
                self.done = true;
                None
            }
            Ok((entry, next)) => {
                self.offset = next;
                Some(Ok(entry))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl ImageSource for CpioArchive<'_> {
    fn size_of(&self, name: &str) -> usize {
        self.find(name).map_or(0, |entry| entry.data.len())
    }

    fn load(&self, name: &str, dst: &mut [u8]) -> usize {
        let Some(entry) = self.find(name) else { return 0 };
        let len = entry.data.len().min(dst.len());
        dst[..len].copy_from_slice(&entry.data[..len]);
        len
    }
}
