// Allow uppercase acronyms for wire-format terms like EOF and EINTR
#![allow(clippy::upper_case_acronyms)]

pub mod block;
pub mod domain;
pub mod io;
pub mod loggers;
pub mod mapfile;
pub mod maptool;
pub mod rescue;
pub mod units;

// Re-export the engine entry points for convenience
pub use mapfile::Mapbook;
pub use rescue::{RescueOptions, Rescuebook};

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use thiserror::Error;

// Global flag set by the signal handler and polled by the main loop
static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static INTERRUPT_SIGNUM: AtomicI32 = AtomicI32::new(0);

/// Set the interrupt flag (called from signal context; must stay async-safe)
pub fn set_interrupted(signum: i32) {
    if signum > 0 {
        let _ = INTERRUPT_SIGNUM.compare_exchange(0, signum, Ordering::SeqCst, Ordering::SeqCst);
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
}

/// Check if an interrupt has been received
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// The signal that caused the interrupt, or 0
pub fn interrupt_signum() -> i32 {
    INTERRUPT_SIGNUM.load(Ordering::SeqCst)
}

/// Reset the interrupt flag (primarily for testing)
pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::SeqCst);
    INTERRUPT_SIGNUM.store(0, Ordering::SeqCst);
}

/// Error type shared by the rescue engine and the mapfile tools.
///
/// Each variant maps onto one of the documented exit statuses:
/// 1 for environmental problems, 2 for a corrupt mapfile,
/// 128+signum after an interrupt. Internal inconsistencies do not
/// travel through this type; they take the panic path and exit 3.
#[derive(Error, Debug)]
pub enum RescueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}: line {line}: {reason}")]
    CorruptMapfile {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("{0}")]
    Environment(String),

    #[error("interrupted by signal {0}")]
    Interrupted(i32),

    #[error("no data rescued for {0} seconds, giving up")]
    Timeout(u64),
}

impl RescueError {
    pub fn env(msg: impl Into<String>) -> Self {
        RescueError::Environment(msg.into())
    }

    /// Exit status for the process boundary
    pub fn exit_code(&self) -> i32 {
        match self {
            RescueError::CorruptMapfile { .. } => 2,
            RescueError::Interrupted(signum) => 128 + signum,
            _ => 1,
        }
    }
}

pub type RescueResult<T> = Result<T, RescueError>;

/// Abort on an internal invariant violation.
///
/// Reserved strictly for bugs: every other failure propagates a
/// `RescueError`. The binaries install [`exit_on_panic`] so this path
/// terminates the process with status 3.
#[cold]
pub fn internal_error(msg: &str) -> ! {
    panic!("internal inconsistency: {msg}");
}

/// Install a panic hook that reports the diagnostic and exits with
/// status 3, the conventional code for an internal consistency error.
pub fn exit_on_panic() {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("{info}");
        std::process::exit(3);
    }));
}
