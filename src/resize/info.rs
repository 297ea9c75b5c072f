//! Read-only size estimates for `resize --info`.

use std::path::PathBuf;
use std::sync::Arc;

use crate::common::lock::DiskLock;
use crate::common::log;
use crate::common::process::{Executor, Runner};
use crate::common::units::{format_size, SizeUnit};
use crate::error::{Error, Result};
use crate::guestfs::filesystem::Filesystem;
use crate::image::qemu::QemuImg;
use crate::resize::ResizeHelper;

const WARN_FS_NOT_SUPPORTED: &str = "Warning! The last partition cannot be resized \
because its file system is either not supported or damaged.";
const WARN_FS_DIRTY: &str = "Warning! The last filesystem is flagged dirty; \
size estimates may be inaccurate.";

/// Current and minimal sizes of an image, plus the caveats that apply.
#[derive(Debug, Clone)]
pub struct ResizeData {
    pub current_size: u64,
    pub min_size: u64,
    pub min_size_keep_fs: u64,
    pub last_partition: Option<String>,
    pub fs_supported: bool,
    pub partition_supported: bool,
    pub dirty: bool,
}

impl ResizeData {
    pub fn new(current_size: u64) -> Self {
        ResizeData {
            current_size,
            min_size: current_size,
            min_size_keep_fs: current_size,
            last_partition: None,
            fs_supported: true,
            partition_supported: true,
            dirty: false,
        }
    }

    pub fn print(&self, unit: SizeUnit) {
        println!("Disk information:");
        println!("\tSize:\t\t\t\t\t\t{}", format_size(self.current_size, unit));
        println!("\tMinimum:\t\t\t\t\t{}", format_size(self.min_size, unit));
        println!(
            "\tMinimum without resizing the last partition:\t{}",
            format_size(self.min_size_keep_fs, unit)
        );

        if !self.partition_supported {
            log::warn("Unsupported partition");
        } else if self.last_partition.is_none() {
            log::warn("No partitions found");
        } else if !self.fs_supported {
            log::warn(WARN_FS_NOT_SUPPORTED);
        }
        if self.dirty {
            log::warn(WARN_FS_DIRTY);
        }
    }
}

impl ResizeHelper {
    /// Compute `{current, minimum, minimum-keep-fs}` without touching the
    /// image.
    pub fn resize_data(&self) -> Result<ResizeData> {
        let mut data = ResizeData::new(self.image().virtual_size);

        let partition = match self.last_partition() {
            Ok(partition) => partition,
            Err(Error::NoPartitions) | Err(Error::NoPartitionTable) => {
                // A disk with nothing on it can shrink to nothing.
                data.min_size_keep_fs = 0;
                return Ok(data);
            }
            Err(Error::UnsupportedPartition) => {
                data.partition_supported = false;
                return Ok(data);
            }
            Err(err) => return Err(err),
        };
        data.last_partition = Some(partition.device.clone());

        let session = self.session_ro()?;
        let used_space = partition.end + 1;
        let tail = data.current_size - used_space;
        let overhead = session.virt_resize_overhead()?;
        // Shrinking always goes through virt-resize, whose overhead is
        // unavoidable.
        data.min_size_keep_fs = used_space + overhead;

        let fs = Filesystem::detect(&session, &partition.device)?;
        match fs.minimum_size(&session) {
            Ok(fs_min) => {
                log::info(format!("Minimum size: {fs_min}"));
                data.min_size =
                    data.current_size - (partition.size + tail) + fs_min + overhead;
            }
            Err(Error::UnsupportedFs(_)) => {
                data.fs_supported = false;
                data.min_size = data.current_size - tail + overhead;
            }
            Err(_) if matches!(fs, Filesystem::Ntfs { .. }) => {
                // Dirty NTFS refuses the min-size probe; fall back to
                // block accounting and flag the estimate.
                let stats = session.filesystem_stats(&partition.device)?;
                data.dirty = true;
                data.min_size = data.current_size - (partition.size + tail)
                    + stats.used_bytes()
                    + overhead;
            }
            Err(err) => return Err(err),
        }

        Ok(data)
    }
}

/// The `resize --info` command.
pub struct ResizeInfo {
    pub disk: PathBuf,
    pub unit: SizeUnit,
}

impl ResizeInfo {
    pub fn execute(&self, runner: &Runner, executor: &Arc<dyn Executor>) -> Result<()> {
        let _lock = DiskLock::read(&self.disk)?;

        let qemu = QemuImg::new(runner.clone(), Arc::clone(executor));
        let chain = qemu.chain(&self.disk)?;
        let helper = ResizeHelper::new(chain.top().clone(), runner.clone(), Arc::clone(executor));

        let data = helper.resize_data()?;
        data.print(self.unit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn fresh_data_assumes_no_shrink_possible() {
        let data = ResizeData::new(10 * GIB);
        assert_eq!(data.min_size, 10 * GIB);
        assert_eq!(data.min_size_keep_fs, 10 * GIB);
        assert!(data.fs_supported);
        assert!(data.partition_supported);
        assert!(!data.dirty);
    }
}
