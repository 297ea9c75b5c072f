//! Centralized execution of helper programs.
//!
//! Every external tool goes through [`Runner::run`]: the child runs in its
//! own process group with all signals unblocked, output is drained by
//! reader threads, and the wait loop ticks once a second so a cancellation
//! request or timeout kills the child with at most a second of latency.
//!
//! Mutating call sites never hold the runner directly; they hold an
//! [`Executor`], which is either the real thing or the dry-run logger.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};
use nix::sys::statvfs::statvfs;
use nix::unistd::Pid;

use crate::common::cancel::Token;
use crate::common::log;
use crate::error::{Error, Result};

/// Default timeout for helper tools, one hour.
pub const DEFAULT_TIMEOUT_S: u32 = 60 * 60;

/// Captured result of a helper run.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// What to capture from the child; uncaptured streams go to the terminal.
#[derive(Debug, Clone, Copy)]
pub struct Capture {
    pub stdout: bool,
    pub stderr: bool,
}

impl Capture {
    pub const BOTH: Capture = Capture {
        stdout: true,
        stderr: true,
    };
    pub const NONE: Capture = Capture {
        stdout: false,
        stderr: false,
    };
}

/// Launches helper programs on behalf of the whole tool.
///
/// Holds only a weak reference to the cancellation token: the process owns
/// the token, the runner merely polls it.
#[derive(Clone)]
pub struct Runner {
    token: Weak<Token>,
}

impl Runner {
    pub fn new(token: &Arc<Token>) -> Self {
        Runner {
            token: Arc::downgrade(token),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.token.upgrade().is_some_and(|t| t.is_cancelled())
    }

    /// Poll site helper for long orchestration sequences.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Run `program` with `args`, waiting up to `timeout_s` seconds.
    ///
    /// A non-zero exit code is reported in the returned [`Output`], not as
    /// an error; the caller decides what it means.
    pub fn run(
        &self,
        program: &str,
        args: &[String],
        capture: Capture,
        timeout_s: u32,
    ) -> Result<Output> {
        log::info(format!(
            "{} {} (timeout {})",
            program,
            args.join(" "),
            timeout_s
        ));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(if capture.stdout {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .stderr(if capture.stderr {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .process_group(0);

        // The parent blocks almost everything; the helper must not inherit
        // that mask or it becomes unkillable by the usual means.
        unsafe {
            cmd.pre_exec(|| {
                let empty = SigSet::empty();
                signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&empty), None)
                    .map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::internal(format!("Failed to execute '{program}'. {e}"))
        })?;

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let status = self.wait_with_polling(&mut child, program, timeout_s)?;

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        Ok(Output {
            code: status,
            stdout,
            stderr,
        })
    }

    /// Convenience wrapper that turns a non-zero exit into an error.
    pub fn run_checked(
        &self,
        program: &str,
        args: &[String],
        capture: Capture,
        timeout_s: u32,
    ) -> Result<Output> {
        let output = self.run(program, args, capture, timeout_s)?;
        if !output.success() {
            return Err(Error::subprogram(program, args, output.code));
        }
        Ok(output)
    }

    fn wait_with_polling(&self, child: &mut Child, program: &str, timeout_s: u32) -> Result<i32> {
        for _ in 0..timeout_s.max(1) {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| Error::internal(format!("wait on '{program}' failed: {e}")))?
            {
                return Ok(status.code().unwrap_or(-1));
            }

            if self.cancelled() {
                kill_group(child);
                let _ = child.wait();
                return Err(Error::Cancelled);
            }

            thread::sleep(Duration::from_secs(1));
        }

        // Timed out.
        kill_group(child);
        let _ = child.wait();
        Err(Error::internal(format!(
            "{program} is not responding, terminated"
        )))
    }
}

fn kill_group(child: &Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    let _ = signal::killpg(pgid, Signal::SIGKILL);
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        buffer
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Free space available to unprivileged users on the filesystem holding
/// `path`, in bytes.
pub fn available_space(path: &Path) -> Result<u64> {
    let stat = statvfs(path)
        .map_err(|e| Error::internal(format!("statvfs on {} failed: {e}", path.display())))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Side-effect boundary: all mutating helper invocations, renames and
/// unlinks go through this trait. `--dry-run` swaps the implementation.
pub trait Executor {
    /// Run a mutating helper program.
    fn run(&self, program: &str, args: &[String], capture: Capture, timeout_s: u32)
        -> Result<Output>;

    /// Replace the current process image (ploop pass-through).
    fn exec(&self, program: &str, args: &[String]) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn remove(&self, path: &Path) -> Result<()>;

    fn is_dry_run(&self) -> bool {
        false
    }

    /// Like [`Executor::run`] but failing on a non-zero exit.
    fn run_checked(
        &self,
        program: &str,
        args: &[String],
        capture: Capture,
        timeout_s: u32,
    ) -> Result<Output> {
        let output = self.run(program, args, capture, timeout_s)?;
        if !output.success() {
            return Err(Error::subprogram(program, args, output.code));
        }
        Ok(output)
    }
}

/// Executes mutations for real.
pub struct RealExecutor {
    runner: Runner,
}

impl RealExecutor {
    pub fn new(runner: Runner) -> Self {
        RealExecutor { runner }
    }
}

impl Executor for RealExecutor {
    fn run(
        &self,
        program: &str,
        args: &[String],
        capture: Capture,
        timeout_s: u32,
    ) -> Result<Output> {
        self.runner.run(program, args, capture, timeout_s)
    }

    fn exec(&self, program: &str, args: &[String]) -> Result<()> {
        log::info(format!("{} {}", program, args.join(" ")));
        // The replacement image must not inherit the blocked mask.
        let empty = SigSet::empty();
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&empty), None);
        let err = Command::new(program).args(args).exec();
        // Only reachable when exec itself failed.
        Err(Error::internal(format!(
            "Failed to execute '{program}': {err}"
        )))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        log::info(format!("mv {} {}", from.display(), to.display()));
        if to.exists() {
            std::fs::remove_file(to)
                .map_err(|e| Error::internal(format!("rm {} failed: {e}", to.display())))?;
        }
        std::fs::rename(from, to).map_err(|e| {
            Error::internal(format!(
                "mv {} {} failed: {e}",
                from.display(),
                to.display()
            ))
        })
    }

    fn remove(&self, path: &Path) -> Result<()> {
        log::info(format!("rm {}", path.display()));
        std::fs::remove_file(path)
            .map_err(|e| Error::internal(format!("rm {} failed: {e}", path.display())))
    }
}

/// Prints what would run instead of running it.
pub struct LoggingExecutor;

impl Executor for LoggingExecutor {
    fn run(
        &self,
        program: &str,
        args: &[String],
        _capture: Capture,
        _timeout_s: u32,
    ) -> Result<Output> {
        println!("{} {}", program, args.join(" "));
        Ok(Output::default())
    }

    fn exec(&self, program: &str, args: &[String]) -> Result<()> {
        println!("{} {}", program, args.join(" "));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        println!("mv {} {}", from.display(), to.display());
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        println!("rm {}", path.display());
        Ok(())
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> (Arc<Token>, Runner) {
        let token = Token::new();
        let runner = Runner::new(&token);
        (token, runner)
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_stdout() {
        let (_token, runner) = runner();
        let out = runner
            .run("echo", &args(&["hello"]), Capture::BOTH, 10)
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn captures_stderr() {
        let (_token, runner) = runner();
        let out = runner
            .run(
                "sh",
                &args(&["-c", "echo oops >&2; exit 3"]),
                Capture::BOTH,
                10,
            )
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn nonzero_exit_is_reported_verbatim() {
        let (_token, runner) = runner();
        let out = runner.run("false", &[], Capture::BOTH, 10).unwrap();
        assert_eq!(out.code, 1);
    }

    #[test]
    fn run_checked_turns_failure_into_error() {
        let (_token, runner) = runner();
        let err = runner
            .run_checked("false", &[], Capture::BOTH, 10)
            .unwrap_err();
        assert!(matches!(err, Error::SubprogramFailed { code: 1, .. }));
    }

    #[test]
    fn missing_program_is_an_error() {
        let (_token, runner) = runner();
        assert!(runner
            .run("definitely-not-a-real-tool-1234", &[], Capture::BOTH, 10)
            .is_err());
    }

    #[test]
    fn large_output_does_not_deadlock() {
        let (_token, runner) = runner();
        // Well past the 64 KiB pipe buffer.
        let out = runner
            .run(
                "sh",
                &args(&["-c", "head -c 1000000 /dev/zero | tr '\\0' 'x'"]),
                Capture::BOTH,
                30,
            )
            .unwrap();
        assert_eq!(out.stdout.len(), 1_000_000);
    }

    #[test]
    fn timeout_kills_the_child() {
        let (_token, runner) = runner();
        let start = std::time::Instant::now();
        let err = runner
            .run("sleep", &args(&["30"]), Capture::BOTH, 2)
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(err.to_string().contains("not responding"));
    }

    #[test]
    fn cancellation_kills_the_child() {
        let (token, runner) = runner();
        let flip = {
            let token = Arc::clone(&token);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                token.cancel();
            })
        };
        let err = runner
            .run("sleep", &args(&["30"]), Capture::BOTH, 60)
            .unwrap_err();
        flip.join().unwrap();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn dropped_token_means_not_cancelled() {
        let (token, runner) = runner();
        drop(token);
        assert!(!runner.cancelled());
    }

    #[test]
    fn logging_executor_prints_and_succeeds() {
        let exec = LoggingExecutor;
        assert!(exec.is_dry_run());
        let out = exec
            .run("qemu-img", &args(&["resize", "x", "10M"]), Capture::NONE, 10)
            .unwrap();
        assert!(out.success());
        assert!(exec.rename(Path::new("/a"), Path::new("/b")).is_ok());
        assert!(exec.remove(Path::new("/a")).is_ok());
    }

    #[test]
    fn real_executor_renames_over_existing() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("new");
        let to = dir.path().join("old");
        std::fs::write(&from, b"new").unwrap();
        std::fs::write(&to, b"old").unwrap();

        let (_token, runner) = runner();
        let exec = RealExecutor::new(runner);
        exec.rename(&from, &to).unwrap();
        assert_eq!(std::fs::read(&to).unwrap(), b"new");
        assert!(!from.exists());
    }

    #[test]
    fn available_space_is_positive_for_tmp() {
        assert!(available_space(Path::new("/tmp")).unwrap() > 0);
    }
}
