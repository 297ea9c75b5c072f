//! In-place sparsification and its read-only estimate.

use std::path::PathBuf;
use std::sync::Arc;

use crate::common::lock::DiskLock;
use crate::common::process::{Capture, Executor, Runner, DEFAULT_TIMEOUT_S};
use crate::common::units::SECTOR_SIZE;
use crate::error::Result;
use crate::guestfs::Session;
use crate::image::qemu::QemuImg;

pub const VIRT_SPARSIFY: &str = "virt-sparsify";

/// The `compact` command: punch sparse holes in place.
pub struct Compact {
    pub disk: PathBuf,
    pub force: bool,
}

impl Compact {
    pub fn execute(&self, _runner: &Runner, executor: &Arc<dyn Executor>) -> Result<()> {
        let _lock = DiskLock::write(&self.disk)?;

        if self.force {
            crate::common::log::info("--force has no effect on qcow2 images");
        }
        let args = vec![
            "--machine-readable".to_string(),
            "--in-place".to_string(),
            self.disk.to_string_lossy().into_owned(),
        ];
        executor.run_checked(VIRT_SPARSIFY, &args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        Ok(())
    }
}

/// The `compact --info` command: block-usage accounting.
pub struct CompactInfo {
    pub disk: PathBuf,
}

impl CompactInfo {
    pub fn execute(&self, runner: &Runner, executor: &Arc<dyn Executor>) -> Result<()> {
        let _lock = DiskLock::read(&self.disk)?;

        let qemu = QemuImg::new(runner.clone(), Arc::clone(executor));
        let chain = qemu.chain(&self.disk)?;
        let top = chain.top();

        let (block_size, free) = {
            let session = Session::open_ro(&top.filename, runner.clone(), Arc::clone(executor))?;
            let mut free = 0;
            for device in session.list_partitions()? {
                let stats = session.filesystem_stats(&device)?;
                free += stats.free_bytes();
            }
            (session.block_size()?, free)
        };

        let size = top.virtual_size;
        // Approximate: qemu-img does not report an allocated-block count.
        let allocated = top.actual_size;
        let used = size - free;

        println!("        Block size:       {:>15}", block_size / SECTOR_SIZE);
        println!("        Total blocks:     {:>15}", size / block_size);
        println!("        Allocated blocks: {:>15}", allocated / block_size);
        println!("        Used blocks:      {:>15}", used / block_size);
        Ok(())
    }
}
