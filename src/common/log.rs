//! Verbosity-gated diagnostics.
//!
//! User-facing results are printed directly by the commands; this module
//! only carries the `--verbose` chatter and warning/error lines.

use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn init(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Informational line, shown only with `--verbose`.
pub fn info(message: impl AsRef<str>) {
    if verbose() {
        println!("{}", message.as_ref());
    }
}

/// Warning line, always shown.
pub fn warn(message: impl AsRef<str>) {
    eprintln!("{}", message.as_ref().yellow());
}

/// Error line, always shown.
pub fn error(message: impl AsRef<str>) {
    eprintln!("{}", message.as_ref().red());
}
