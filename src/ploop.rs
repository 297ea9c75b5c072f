//! Pass-through to the external `ploop` tool for container disks.
//!
//! No disk logic lives here: the process image is replaced by ploop,
//! which owns the whole operation from that point on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::common::paths::DESCRIPTOR;
use crate::common::process::{Capture, Executor, Runner, DEFAULT_TIMEOUT_S};
use crate::error::{Error, Result};

pub const PLOOP: &str = "ploop";

fn descriptor(disk: &Path) -> PathBuf {
    disk.join(DESCRIPTOR)
}

fn exec(executor: &Arc<dyn Executor>, args: Vec<String>) -> Result<()> {
    // A successful exec never returns; Ok means dry-run logged it.
    match executor.exec(PLOOP, &args) {
        Ok(()) => Ok(()),
        Err(_) => Err(Error::PloopExecFailed),
    }
}

pub fn resize(disk: &Path, size_mb: u64, executor: &Arc<dyn Executor>) -> Result<()> {
    exec(
        executor,
        vec![
            "resize".to_string(),
            "-s".to_string(),
            format!("{size_mb}M"),
            descriptor(disk).to_string_lossy().into_owned(),
        ],
    )
}

pub fn compact(disk: &Path, executor: &Arc<dyn Executor>) -> Result<()> {
    exec(
        executor,
        vec![
            "balloon".to_string(),
            "discard".to_string(),
            "--automount".to_string(),
            "--defrag".to_string(),
            descriptor(disk).to_string_lossy().into_owned(),
        ],
    )
}

pub fn merge(disk: &Path, executor: &Arc<dyn Executor>) -> Result<()> {
    exec(
        executor,
        vec![
            "snapshot-merge".to_string(),
            "-A".to_string(),
            descriptor(disk).to_string_lossy().into_owned(),
        ],
    )
}

/// Size estimates come from `ploop info`, which reads the statfs of the
/// mounted container; an unmounted ploop cannot answer.
pub fn resize_info(disk: &Path, runner: &Runner) -> Result<()> {
    let args = vec![
        "info".to_string(),
        "-s".to_string(),
        descriptor(disk).to_string_lossy().into_owned(),
    ];
    let out = runner.run(PLOOP, &args, Capture::BOTH, DEFAULT_TIMEOUT_S)?;
    if !out.success() {
        return Err(Error::PloopNotMounted);
    }
    print!("{}", out.stdout);
    Ok(())
}

/// Operations with no ploop counterpart.
pub fn unsupported() -> Error {
    Error::internal("This action is not implemented for ploop")
}
