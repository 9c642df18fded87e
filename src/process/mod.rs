//! External process management.
//!
//! `managed` wraps one supervised OS process (launch, log capture, signals,
//! exit observation). `termination` holds the sweeps used during shutdown to
//! find processes the tracked handles no longer cover.

mod managed;
pub(crate) mod termination;

pub use managed::{KillOutcome, LaunchError, LaunchSpec, ManagedProcess};
pub use termination::TerminationStrategy;
