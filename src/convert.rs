//! Preallocation conversion between plain and expanding images.

use std::path::PathBuf;
use std::sync::Arc;

use crate::common::guard::DropGuard;
use crate::common::lock::DiskLock;
use crate::common::paths::tmp_image_path;
use crate::common::process::{available_space, Capture, Executor, Runner, DEFAULT_TIMEOUT_S};
use crate::error::{Error, Result};
use crate::image::qemu::QemuImg;
use crate::image::Image;

pub const FALLOCATE: &str = "fallocate";

/// Target allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preallocation {
    /// Fully allocated on the host up front.
    Plain,
    /// Lazily allocated, grows with guest writes.
    Expanding,
}

impl Preallocation {
    fn needed_space(&self, image: &Image) -> u64 {
        match self {
            Preallocation::Plain => image.virtual_size,
            Preallocation::Expanding => image.actual_size,
        }
    }
}

/// The `convert` command.
pub struct Convert {
    pub disk: PathBuf,
    pub preallocation: Preallocation,
}

impl Convert {
    pub fn execute(&self, runner: &Runner, executor: &Arc<dyn Executor>) -> Result<()> {
        let _lock = DiskLock::write(&self.disk)?;

        let qemu = QemuImg::new(runner.clone(), Arc::clone(executor));
        let chain = qemu.chain(&self.disk)?;
        if chain.len() > 1 {
            return Err(Error::CannotConvertNeedMerge);
        }
        // Internal snapshots would be dropped by the rewrite.
        match qemu.check_no_snapshots(&self.disk) {
            Ok(()) => {}
            Err(Error::HasInternalSnapshots(_)) => return Err(Error::CannotConvertNeedMerge),
            Err(err) => return Err(err),
        }
        let image = chain.top();

        let needed = self.preallocation.needed_space(image);
        let available = available_space(&self.disk)?;
        if needed > available {
            return Err(Error::NoFreeSpace { needed, available });
        }

        let tmp = tmp_image_path(&self.disk);
        // Fires on success too, after the rename has moved the file away.
        let _cleanup = {
            let tmp = tmp.clone();
            DropGuard::new(move || {
                let _ = std::fs::remove_file(&tmp);
            })
        };

        let options = match self.preallocation {
            Preallocation::Plain => "lazy_refcounts=on,preallocation=falloc",
            Preallocation::Expanding => "lazy_refcounts=on",
        };
        qemu.convert(&self.disk, &tmp, options)?;

        if self.preallocation == Preallocation::Plain {
            // Make sure the whole virtual span is backed by host blocks.
            let args = vec![
                "-l".to_string(),
                image.virtual_size.to_string(),
                tmp.to_string_lossy().into_owned(),
            ];
            executor.run_checked(FALLOCATE, &args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        }

        executor.rename(&tmp, &self.disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_needs_virtual_size() {
        let image = Image {
            filename: PathBuf::from("/vm/disk.qcow2"),
            virtual_size: 100,
            actual_size: 40,
            format: "qcow2".into(),
            backing: None,
            full_backing: None,
        };
        assert_eq!(Preallocation::Plain.needed_space(&image), 100);
        assert_eq!(Preallocation::Expanding.needed_space(&image), 40);
    }
}
