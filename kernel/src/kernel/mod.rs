//! Kernel Subsystems
//!
//! - Memory: frame allocator, typed addresses, per-task translation tables
//! - Tasks: control blocks, queues, scheduler
//! - Signals, exceptions and system calls
//! - The program launcher

pub mod exception;
pub mod exec;
pub mod memory;
pub mod queue;
pub mod scheduler;
pub mod signal;
pub mod syscall;
pub mod task;

pub use scheduler::{Scheduler, SCHEDULER};
pub use task::{Task, TaskId, TaskState};
