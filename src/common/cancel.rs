//! Cancellation token and the signal waiter behind it.
//!
//! The process blocks every signal except SIGCHLD for its whole lifetime;
//! a single dedicated thread waits on {SIGTERM, SIGINT, SIGUSR1} and flips
//! the token. Long-running code never handles signals itself, it polls the
//! token at safe points.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;

use crate::common::log;
use crate::error::{Error, Result};

/// Process-wide cancellation flag.
#[derive(Debug, Default)]
pub struct Token {
    cancelled: AtomicBool,
}

impl Token {
    pub fn new() -> Arc<Self> {
        Arc::new(Token::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Poll site helper: errors out once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Non-destructively test whether a SIGTERM or SIGINT is already queued.
///
/// Destructive for the queued signal itself, which is exactly what the
/// waiter wants: a pending termination request always wins over the
/// SIGUSR1 used to stop the waiter.
fn take_pending_termination() -> bool {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::sigaddset(&mut set, libc::SIGINT);
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        libc::sigtimedwait(&set, ptr::null_mut(), &timeout) != -1
    }
}

/// Drain any SIGUSR1 left over from a previous waiter round.
fn drain_pending_usr1() {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        while libc::sigtimedwait(&set, ptr::null_mut(), &timeout) == libc::SIGUSR1 {}
    }
}

/// Blocks the process signal mask on construction, runs the waiter thread,
/// and restores everything on drop.
pub struct SignalGuard {
    saved_mask: SigSet,
    waiter: Option<JoinHandle<()>>,
}

impl SignalGuard {
    pub fn install(token: Arc<Token>) -> Result<Self> {
        let mut blocked = SigSet::all();
        blocked.remove(Signal::SIGCHLD);

        let mut saved_mask = SigSet::empty();
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut saved_mask))
            .map_err(|e| Error::internal(format!("Unable to set signal mask: {e}")))?;

        drain_pending_usr1();

        let waiter = std::thread::Builder::new()
            .name("signal-waiter".into())
            .spawn(move || wait_for_signal(token))
            .map_err(|e| Error::internal(format!("Unable to spawn signal waiter: {e}")))?;

        Ok(SignalGuard {
            saved_mask,
            waiter: Some(waiter),
        })
    }

    fn stop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        if signal::kill(Pid::this(), Signal::SIGUSR1).is_ok() {
            let _ = waiter.join();
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.stop();
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved_mask), None);
    }
}

fn wait_for_signal(token: Arc<Token>) {
    // Nothing but the awaited set may be delivered to this thread.
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), None);

    let mut awaited = SigSet::empty();
    awaited.add(Signal::SIGTERM);
    awaited.add(Signal::SIGINT);
    awaited.add(Signal::SIGUSR1);

    match awaited.wait() {
        Ok(Signal::SIGUSR1) => {
            // Shutdown request; a queued SIGTERM/SIGINT still counts.
            if take_pending_termination() {
                log::info("Terminate");
                token.cancel();
            }
        }
        Ok(Signal::SIGTERM) | Ok(Signal::SIGINT) => {
            log::info("Terminate");
            token.cancel();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_clear() {
        let token = Token::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancel_flips_the_flag() {
        let token = Token::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn cancel_is_visible_across_threads() {
        let token = Token::new();
        let shared = Arc::clone(&token);
        let handle = std::thread::spawn(move || shared.cancel());
        handle.join().unwrap();
        assert!(token.is_cancelled());
    }
}
