//! System Call Interface
//!
//! Handles `svc #0` from EL0. The call number is in x8, arguments in x0-x2
//! and the result goes back in x0 (`-1` on any failure).
//!
//! User buffers are never dereferenced through their user address. Every
//! access is translated through the caller's own tables and performed via
//! the kernel linear window, so a bad pointer is an error, not a fault.

use core::fmt;

use crate::config::{PAGE_SIZE, SIGRETURN_TRAMPOLINE_VA};
use crate::drivers::uart;
use crate::kernel::exception::TrapFrame;
use crate::kernel::exec::{self, ExecError, Mode};
use crate::kernel::memory::paging::{AddressSpace, EntryFlags, MapError};
use crate::kernel::memory::{FrameAllocator, KernelFrames, PhysAddr, VirtAddr};
use crate::kernel::scheduler::{self, SCHEDULER};
use crate::kernel::signal::{Handler, SignalError};
use crate::kernel::task::{Task, TaskId};

/// Value returned in x0 on failure.
pub const ERROR: u64 = u64::MAX;

/// Longest program name `exec` accepts, terminator excluded.
pub const MAX_NAME: usize = 63;

/// End of the user half (48-bit TTBR0 range).
pub const USER_SPACE_END: u64 = 1 << 48;

/// Bounce buffer size for UART transfers.
const CHUNK: usize = 256;

/// System Call Numbers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Syscall {
    GetPid,
    UartRead { buf: VirtAddr, len: usize },
    UartWrite { buf: VirtAddr, len: usize },
    Exec { name: VirtAddr },
    Fork,
    Exit,
    MboxCall,
    Kill { pid: TaskId },
    Signal { signum: i32, handler: u64 },
    SigKill { pid: TaskId, signum: i32 },
    SigReturn,
    Yield,
    /// Argument `value` of call `nr` does not fit the kernel's type for it.
    BadArgument { nr: u64, value: u64 },
    Unknown(u64),
}

impl Syscall {
    pub fn decode(frame: &TrapFrame) -> Self {
        let [a0, a1, ..] = frame.x;
        let nr = frame.x[8];
        let pid = |value: u64| u32::try_from(value).map(TaskId);
        let signum = |value: u64| i32::try_from(value);
        match nr {
            0 => Syscall::GetPid,
            1 => Syscall::UartRead { buf: VirtAddr::new(a0), len: a1 as usize },
            2 => Syscall::UartWrite { buf: VirtAddr::new(a0), len: a1 as usize },
            3 => Syscall::Exec { name: VirtAddr::new(a0) },
            4 => Syscall::Fork,
            5 => Syscall::Exit,
            6 => Syscall::MboxCall,
            7 => match pid(a0) {
                Ok(pid) => Syscall::Kill { pid },
                Err(_) => Syscall::BadArgument { nr, value: a0 },
            },
            8 => match signum(a0) {
                Ok(signum) => Syscall::Signal { signum, handler: a1 },
                Err(_) => Syscall::BadArgument { nr, value: a0 },
            },
            9 => match (pid(a0), signum(a1)) {
                (Ok(pid), Ok(signum)) => Syscall::SigKill { pid, signum },
                (Err(_), _) => Syscall::BadArgument { nr, value: a0 },
                (_, Err(_)) => Syscall::BadArgument { nr, value: a1 },
            },
            10 => Syscall::SigReturn,
            11 => Syscall::Yield,
            n => Syscall::Unknown(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// A user buffer is outside the user half or not mapped.
    BadAddress(VirtAddr),
    /// The program name is not valid UTF-8 or has no terminator.
    BadName,
    /// A numeric argument is out of range for its call.
    InvalidArgument(u64),
    NoSuchTask(TaskId),
    NoCurrentTask,
    NotSupported,
    Signal(SignalError),
    Map(MapError),
    Exec(ExecError),
}

impl From<SignalError> for SyscallError {
    fn from(err: SignalError) -> Self {
        SyscallError::Signal(err)
    }
}

impl From<MapError> for SyscallError {
    fn from(err: MapError) -> Self {
        SyscallError::Map(err)
    }
}

impl From<ExecError> for SyscallError {
    fn from(err: ExecError) -> Self {
        SyscallError::Exec(err)
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallError::BadAddress(va) => write!(f, "bad user address {:#x}", va),
            SyscallError::BadName => write!(f, "bad program name"),
            SyscallError::InvalidArgument(value) => write!(f, "argument {:#x} out of range", value),
            SyscallError::NoSuchTask(id) => write!(f, "no task {}", id),
            SyscallError::NoCurrentTask => write!(f, "no running task"),
            SyscallError::NotSupported => write!(f, "not supported"),
            SyscallError::Signal(err) => write!(f, "{}", err),
            SyscallError::Map(err) => write!(f, "{}", err),
            SyscallError::Exec(err) => write!(f, "exec: {}", err),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// USER MEMORY ACCESS
// ═══════════════════════════════════════════════════════════════════════════════

fn check_range(va: VirtAddr, len: usize) -> Result<(), SyscallError> {
    match va.as_u64().checked_add(len as u64) {
        Some(end) if end <= USER_SPACE_END => Ok(()),
        _ => Err(SyscallError::BadAddress(va)),
    }
}

/// Visit `[va, va + len)` one page-bounded piece at a time, handing each
/// piece's kernel pointer and its offset into the range to `f`.
fn for_each_piece(
    space: &AddressSpace,
    va: VirtAddr,
    len: usize,
    mut f: impl FnMut(*mut u8, usize, usize),
) -> Result<(), SyscallError> {
    check_range(va, len)?;
    let window = space.window();
    let mut done = 0;
    while done < len {
        let at = va + done as u64;
        let piece = (PAGE_SIZE - at.page_offset()).min(len - done);
        let pa = space.translate(at).ok_or(SyscallError::BadAddress(at))?;
        f(window.to_virt(pa).as_mut_ptr::<u8>(), done, piece);
        done += piece;
    }
    Ok(())
}

/// Copy `dst.len()` bytes out of the task's memory at `va`.
pub fn copy_from_user(space: &AddressSpace, va: VirtAddr, dst: &mut [u8]) -> Result<(), SyscallError> {
    let len = dst.len();
    for_each_piece(space, va, len, |src, offset, piece| {
        // SAFETY: `src` is `piece` bytes of a mapped frame seen through the kernel window.
        let src = unsafe { core::slice::from_raw_parts(src as *const u8, piece) };
        dst[offset..offset + piece].copy_from_slice(src);
    })
}

/// Copy `src` into the task's memory at `va`.
pub fn copy_to_user(space: &AddressSpace, va: VirtAddr, src: &[u8]) -> Result<(), SyscallError> {
    for_each_piece(space, va, src.len(), |dst, offset, piece| {
        // SAFETY: as in `copy_from_user`.
        let dst = unsafe { core::slice::from_raw_parts_mut(dst, piece) };
        dst.copy_from_slice(&src[offset..offset + piece]);
    })
}

/// Read a NUL-terminated name of at most `MAX_NAME` bytes.
pub fn read_user_str(space: &AddressSpace, va: VirtAddr) -> Result<heapless::String<MAX_NAME>, SyscallError> {
    let mut name = heapless::String::new();
    for i in 0..=MAX_NAME as u64 {
        let mut byte = [0u8];
        copy_from_user(space, va + i, &mut byte)?;
        if byte[0] == 0 {
            return Ok(name);
        }
        if !byte[0].is_ascii() || name.push(byte[0] as char).is_err() {
            return Err(SyscallError::BadName);
        }
    }
    Err(SyscallError::BadName)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNAL REGISTRATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Physical page holding `sigreturn_trampoline`.
#[cfg(target_os = "none")]
pub fn trampoline_page() -> PhysAddr {
    extern "C" {
        static __sigreturn_start: u8;
    }
    let va = VirtAddr::from_ptr(unsafe { &__sigreturn_start as *const u8 });
    crate::kernel::memory::LinearWindow::KERNEL.to_phys(va)
}

#[cfg(not(target_os = "none"))]
pub fn trampoline_page() -> PhysAddr {
    PhysAddr::new(0)
}

/// Install a handler for `signum` in `task`. A handler address of zero means
/// ignore. The first user handler maps the trampoline page read-only.
///
/// Returns the previous handler's address, zero if it was not a user function.
pub fn register_handler<F: FrameAllocator>(
    task: &mut Task,
    frames: &mut F,
    signum: i32,
    handler: u64,
    trampoline: PhysAddr,
) -> Result<u64, SyscallError> {
    let handler = match handler {
        0 => Handler::Ignore,
        addr => Handler::User(VirtAddr::new(addr)),
    };
    let previous = task.signals.register(signum, handler)?;

    if matches!(handler, Handler::User(_)) && !task.signals.trampoline_mapped() {
        let mapped = task.address_space.map(
            frames,
            VirtAddr::new(SIGRETURN_TRAMPOLINE_VA),
            trampoline,
            PAGE_SIZE,
            EntryFlags::USER_CODE_RO,
        );
        if let Err(err) = mapped {
            task.signals.register(signum, previous)?;
            return Err(err.into());
        }
        task.signals.mark_trampoline_mapped();
    }

    match previous {
        Handler::User(previous) => Ok(previous.as_u64()),
        _ => Ok(0),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISPATCH
// ═══════════════════════════════════════════════════════════════════════════════

fn with_current<R>(f: impl FnOnce(&mut Task) -> Result<R, SyscallError>) -> Result<R, SyscallError> {
    let mut sched = SCHEDULER.lock();
    let task = sched.current_task_mut().ok_or(SyscallError::NoCurrentTask)?;
    f(task)
}

fn uart_write(buf: VirtAddr, len: usize) -> Result<u64, SyscallError> {
    check_range(buf, len)?;
    let mut chunk = [0u8; CHUNK];
    let mut done = 0;
    while done < len {
        let piece = CHUNK.min(len - done);
        with_current(|task| copy_from_user(&task.address_space, buf + done as u64, &mut chunk[..piece]))?;
        uart::write_bytes(&chunk[..piece]);
        done += piece;
    }
    Ok(len as u64)
}

fn uart_read(buf: VirtAddr, len: usize) -> Result<u64, SyscallError> {
    check_range(buf, len)?;
    let mut chunk = [0u8; CHUNK];
    let mut done = 0;
    while done < len {
        let piece = CHUNK.min(len - done);
        uart::read_bytes(&mut chunk[..piece]);
        with_current(|task| copy_to_user(&task.address_space, buf + done as u64, &chunk[..piece]))?;
        done += piece;
    }
    Ok(len as u64)
}

fn exec(name: VirtAddr) -> Result<u64, SyscallError> {
    let name = with_current(|task| read_user_str(&task.address_space, name))?;
    crate::kprintln!("[SYS] exec {}", name);
    Err(exec::launch(&name, Mode::Replace).into())
}

fn post_signal(pid: TaskId, signum: i32) -> Result<u64, SyscallError> {
    let mut sched = SCHEDULER.lock();
    let task = sched.lookup_by_id_mut(pid).ok_or(SyscallError::NoSuchTask(pid))?;
    task.signals.post(signum)?;
    Ok(0)
}

fn sigreturn(frame: &mut TrapFrame) -> Result<(), SyscallError> {
    with_current(|task| {
        if task.signals.sigreturn(frame) {
            Ok(())
        } else {
            Err(SyscallError::NotSupported)
        }
    })
}

/// Handle the SVC described by `frame` and write the result into x0.
pub fn dispatch(frame: &mut TrapFrame) {
    let call = Syscall::decode(frame);

    #[cfg(feature = "debug")]
    crate::kprintln!("[SYS] {:?}", call);

    let result = match call {
        Syscall::GetPid => scheduler::current_id()
            .map(|id| id.as_u32() as u64)
            .ok_or(SyscallError::NoCurrentTask),
        Syscall::UartRead { buf, len } => uart_read(buf, len),
        Syscall::UartWrite { buf, len } => uart_write(buf, len),
        Syscall::Exec { name } => exec(name),
        Syscall::Fork | Syscall::MboxCall => Err(SyscallError::NotSupported),
        Syscall::Exit => scheduler::exit(),
        Syscall::Kill { pid } => scheduler::kill(pid).map(|()| 0).map_err(|_| SyscallError::NoSuchTask(pid)),
        Syscall::Signal { signum, handler } => {
            with_current(|task| register_handler(task, &mut KernelFrames, signum, handler, trampoline_page()))
        }
        Syscall::SigKill { pid, signum } => post_signal(pid, signum),
        Syscall::SigReturn => match sigreturn(frame) {
            // The restored frame carries its own x0
            Ok(()) => return,
            Err(err) => Err(err),
        },
        Syscall::Yield => {
            scheduler::schedule();
            Ok(0)
        }
        Syscall::BadArgument { value, .. } => Err(SyscallError::InvalidArgument(value)),
        Syscall::Unknown(n) => {
            crate::kprintln!("[SYS] Unknown syscall: {}", n);
            Err(SyscallError::NotSupported)
        }
    };

    frame.x[0] = match result {
        Ok(value) => value,
        Err(err) => {
            crate::kprintln!("[SYS] {:?} failed: {}", call, err);
            ERROR
        }
    };
}
