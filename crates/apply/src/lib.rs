//! Manifold apply: moves records between the local and cluster collections.
//!
//! To-cluster transfers shell out to kubectl through a [`ProcessRunner`];
//! to-local transfers are pure copies. Collection mutations go through the
//! store's mutation queue only after the external call has finished.

#![forbid(unsafe_code)]

mod process;
mod transfer;

pub use process::{cancel_pair, CancelHandle, CancelSignal, CommandSpec, ProcessError, ProcessOutput, ProcessRunner, SystemRunner};
pub use transfer::{applied_lines, strip_noisy, Direction, Orchestrator, TransferError, TransferOptions, TransferOutcome};
