//! spawnio: readiness-driven descriptor streams and a subprocess supervisor.
//!
//! - [`Stream`] wraps one file descriptor with a callback-driven read side and a
//!   queued, order-preserving write side.
//! - [`Process`] spawns a child, binds its standard descriptors to streams, and
//!   reports its exit exactly once.
//! - [`Channel`]s are extra named socket streams handed to a running child by
//!   descriptor passing over its standard input.
//!
//! Everything runs on the ambient Tokio runtime. Callbacks are serialized per
//! [`ExecutionContext`].

use std::sync::{Mutex, MutexGuard};

pub mod channel;
pub mod context;
pub mod error;
pub mod fdpass;
pub mod logging;
pub mod process;
mod spawn;
pub mod stream;
mod sys;

pub use channel::Channel;
pub use context::ExecutionContext;
pub use error::{ContractViolation, DescriptorError, ProcessError, StreamError};
pub use logging::init_tracing;
pub use process::{ExitCallback, Process, ProcessConfig, ProcessState};
pub use stream::{DataCallback, Stream, StreamState};

pub use nix::sys::signal::Signal;

/// Lock a std mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Bug: mutex poisoned, recovering");
        poisoned.into_inner()
    })
}
