//! Signal Definitions
//!
//! Based on Linux signal numbers. A task keeps a pending bitmask and one
//! handler per signal slot. Delivery happens on the way back to EL0: the
//! interrupted trap frame is parked, the handler runs on the task's user
//! stack and `sigreturn` (issued by the trampoline) restores the frame.

use alloc::boxed::Box;
use core::fmt;

use crate::config::{SIGRETURN_TRAMPOLINE_VA, SIG_NUM};
use crate::kernel::exception::TrapFrame;
use crate::kernel::memory::VirtAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGILL = 4,
    SIGTRAP = 5,
    SIGABRT = 6,
    SIGBUS = 7,
    SIGFPE = 8,
    SIGKILL = 9,
    SIGUSR1 = 10,
    SIGSEGV = 11,
    SIGUSR2 = 12,
    SIGPIPE = 13,
    SIGALRM = 14,
    SIGTERM = 15,
}

/// What happens when a signal is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Ignore,
    Terminate,
    /// User-space function taking the signal number in x0.
    User(VirtAddr),
}

impl Handler {
    /// Disposition every slot starts with.
    pub const fn default_for(signum: usize) -> Self {
        if signum == Signal::SIGKILL as usize {
            Handler::Terminate
        } else {
            Handler::Ignore
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// Outside `1..SIG_NUM`.
    Invalid(i32),
    /// SIGKILL cannot be caught or ignored.
    Uncatchable,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::Invalid(n) => write!(f, "invalid signal {}", n),
            SignalError::Uncatchable => write!(f, "signal cannot be caught"),
        }
    }
}

fn slot(signum: i32) -> Result<usize, SignalError> {
    match usize::try_from(signum) {
        Ok(n) if (1..SIG_NUM).contains(&n) => Ok(n),
        _ => Err(SignalError::Invalid(signum)),
    }
}

/// Result of looking at the pending set on the way back to EL0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Nothing,
    /// The task must be terminated.
    Terminate(i32),
    /// The trap frame now enters the handler.
    Handler(i32),
}

/// Per-task signal bookkeeping.
pub struct SignalState {
    pending: u32,
    handlers: [Handler; SIG_NUM],
    saved: Box<TrapFrame>,
    in_handler: bool,
    trampoline_mapped: bool,
}

impl SignalState {
    pub fn new() -> Self {
        let mut handlers = [Handler::Ignore; SIG_NUM];
        for (signum, handler) in handlers.iter_mut().enumerate() {
            *handler = Handler::default_for(signum);
        }
        SignalState {
            pending: 0,
            handlers,
            saved: Box::new(TrapFrame::default()),
            in_handler: false,
            trampoline_mapped: false,
        }
    }

    /// Install `handler` for `signum`, returning the previous one.
    pub fn register(&mut self, signum: i32, handler: Handler) -> Result<Handler, SignalError> {
        let n = slot(signum)?;
        if n == Signal::SIGKILL as usize {
            return Err(SignalError::Uncatchable);
        }
        Ok(core::mem::replace(&mut self.handlers[n], handler))
    }

    pub fn handler(&self, signum: i32) -> Option<Handler> {
        slot(signum).ok().map(|n| self.handlers[n])
    }

    pub fn post(&mut self, signum: i32) -> Result<(), SignalError> {
        let n = slot(signum)?;
        self.pending |= 1 << n;
        Ok(())
    }

    pub fn is_pending(&self, signum: i32) -> bool {
        slot(signum).map(|n| self.pending & (1 << n) != 0).unwrap_or(false)
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    pub fn in_handler(&self) -> bool {
        self.in_handler
    }

    /// Whether the sigreturn trampoline is already mapped into the task.
    pub fn trampoline_mapped(&self) -> bool {
        self.trampoline_mapped
    }

    pub(crate) fn mark_trampoline_mapped(&mut self) {
        self.trampoline_mapped = true;
    }

    /// Consume pending signals in ascending order until one needs action.
    ///
    /// Handlers do not nest: while one runs, delivery waits for `sigreturn`.
    pub fn deliver(&mut self, frame: &mut TrapFrame) -> Delivery {
        if self.in_handler {
            return Delivery::Nothing;
        }

        while self.pending != 0 {
            let n = self.pending.trailing_zeros() as usize;
            self.pending &= !(1 << n);
            let signum = n as i32;

            match self.handlers[n] {
                Handler::Ignore => continue,
                Handler::Terminate => return Delivery::Terminate(signum),
                Handler::User(entry) => {
                    *self.saved = *frame;
                    frame.elr = entry.as_u64();
                    frame.x[0] = signum as u64;
                    frame.x[30] = SIGRETURN_TRAMPOLINE_VA;
                    frame.sp_el0 = frame.sp_el0.wrapping_sub(0x100) & !0xf;
                    self.in_handler = true;
                    return Delivery::Handler(signum);
                }
            }
        }
        Delivery::Nothing
    }

    /// Restore the frame parked by `deliver`. `false` outside a handler.
    pub fn sigreturn(&mut self, frame: &mut TrapFrame) -> bool {
        if !self.in_handler {
            return false;
        }
        *frame = *self.saved;
        self.in_handler = false;
        true
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}
