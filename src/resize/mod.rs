//! The resize orchestrator.
//!
//! A resize is a coordinated walk over four nested layers: the QCOW2
//! file, the partition table, the last partition's filesystem and an
//! optional LVM stack inside it. Mode selection decides how deep the walk
//! goes; execution honors the ordering rules (shrink inside-out, expand
//! outside-in) and leaves the image recoverable on failure.

pub mod info;

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use crate::common::guard::DropGuard;
use crate::common::lock::DiskLock;
use crate::common::log;
use crate::common::process::{available_space, Capture, Executor, Runner, DEFAULT_TIMEOUT_S};
use crate::common::units::mb_to_bytes;
use crate::error::{Error, Result};
use crate::guestfs::filesystem::Filesystem;
use crate::guestfs::partition::{Partition, PartitionTable};
use crate::guestfs::pool::SessionPool;
use crate::guestfs::{Session, GPT_END_SECTS};
use crate::image::qemu::QemuImg;
use crate::image::{Chain, Image};
use crate::merge::{ExternalMerge, MergePolicy};

pub const VIRT_RESIZE: &str = "virt-resize";

/// What the user asked for.
#[derive(Debug, Clone)]
pub struct ResizeRequest {
    pub disk: PathBuf,
    pub size_mb: u64,
    pub resize_last_partition: bool,
    pub force: bool,
}

/// The six ways a resize can be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    /// Copy through virt-resize, partitions moved but not resized.
    IgnoreShrink,
    /// No partition table at all: recreate smaller, dropping tail data.
    IgnoreShrinkTruncate,
    /// In-place virtual-size grow.
    IgnoreExpand,
    /// In-place grow plus backup-GPT-header relocation.
    IgnoreExpandGpt,
    /// Shrink the last partition and its filesystem first.
    ConsiderShrink,
    /// Grow partition and filesystem through a COW overlay.
    ConsiderExpand,
}

/// Builder for virt-resize invocations.
struct VirtResize {
    args: Vec<String>,
    executor: Arc<dyn Executor>,
}

impl VirtResize {
    fn new(executor: Arc<dyn Executor>) -> Self {
        VirtResize {
            args: Vec::new(),
            executor,
        }
    }

    fn shrink(&mut self, partition: &str) -> &mut Self {
        self.args.push("--shrink".into());
        self.args.push(partition.into());
        self
    }

    fn resize_force(&mut self, partition: &str, size: u64) -> &mut Self {
        self.args.push("--resize-force".into());
        self.args.push(format!("{partition}={size}b"));
        self
    }

    fn no_expand_content(&mut self) -> &mut Self {
        self.args.push("--no-expand-content".into());
        self
    }

    fn run(mut self, src: &Path, dst: &Path) -> Result<()> {
        self.args.push("--machine-readable".into());
        self.args.push("--ntfsresize-force".into());
        self.args.push(src.to_string_lossy().into_owned());
        self.args.push(dst.to_string_lossy().into_owned());
        self.executor
            .run_checked(VIRT_RESIZE, &self.args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        Ok(())
    }
}

/// Shared state of one resize operation.
pub struct ResizeHelper {
    image: Image,
    pool: SessionPool,
    qemu: QemuImg,
    executor: Arc<dyn Executor>,
}

impl ResizeHelper {
    pub fn new(image: Image, runner: Runner, executor: Arc<dyn Executor>) -> Self {
        ResizeHelper {
            pool: SessionPool::new(runner.clone(), Arc::clone(&executor)),
            qemu: QemuImg::new(runner, Arc::clone(&executor)),
            image,
            executor,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn qemu(&self) -> &QemuImg {
        &self.qemu
    }

    fn session_ro(&self) -> Result<Rc<Session>> {
        self.pool.get_ro(&self.image.filename)
    }

    fn session_rw(&self) -> Result<Rc<Session>> {
        self.pool.get_rw(&self.image.filename)
    }

    pub fn last_partition(&self) -> Result<Partition> {
        self.session_ro()?.last_partition()
    }

    pub fn partition_table(&self) -> Result<PartitionTable> {
        self.session_ro()?.partition_table()
    }

    pub fn last_filesystem(&self, partition: &Partition) -> Result<Filesystem> {
        let session = self.session_ro()?;
        Filesystem::detect(&session, &partition.device)
    }

    /// Sync and shut every cached appliance down; must precede any
    /// external tool touching the same images.
    fn sync_and_close(&self) -> Result<()> {
        self.pool.sync_and_close_all()
    }

    /// Byte delta the last filesystem must absorb for a shrink to
    /// `size_mb`: negative means the free tail is not enough and the
    /// filesystem itself has to give up space.
    fn calculate_fs_delta(&self, size_mb: u64, partition: &Partition) -> Result<i64> {
        let session = self.session_ro()?;
        let delta = mb_to_bytes(size_mb) as i64 - self.image.virtual_size as i64;
        // Free space between the last partition and the end of the disk.
        let tail = self.image.virtual_size - partition.end - 1;
        let overhead = session.virt_resize_overhead()?;
        let fs_delta = delta - overhead as i64 + tail as i64;
        log::info(format!(
            "delta: {delta} overhead: {overhead} tail: {tail} fs delta: {fs_delta}"
        ));
        Ok(fs_delta)
    }

    fn new_fs_size(&self, size_mb: u64, partition: &Partition) -> Result<u64> {
        let fs_delta = self.calculate_fs_delta(size_mb, partition)?;
        partition
            .size
            .checked_add_signed(fs_delta)
            .ok_or_else(|| Error::internal("Unable to resize partition below 0"))
    }

    /// Shrink the filesystem on the last partition when the free tail
    /// alone cannot absorb the requested shrink.
    fn shrink_fs_if_needed(&self, size_mb: u64) -> Result<()> {
        let session = self.session_rw()?;
        let partition = session.last_partition()?;
        let fs_delta = self.calculate_fs_delta(size_mb, &partition)?;
        if fs_delta >= 0 {
            return Ok(());
        }

        let new_size = partition
            .size
            .checked_add_signed(fs_delta)
            .ok_or_else(|| Error::internal("Unable to resize partition below 0"))?;
        let fs = Filesystem::detect(&session, &partition.device)?;
        log::info(format!(
            "Shrinking FS on {} by {}",
            partition.device, -fs_delta
        ));
        fs.shrink(&session, new_size)
    }

    /// New geometry for growing `partition` to fill a `size_mb` disk.
    fn calculate_new_partition(
        &self,
        size_mb: u64,
        partition: &Partition,
        sector_size: u64,
        table: PartitionTable,
    ) -> (u64, u64) {
        let target_bytes = mb_to_bytes(size_mb);
        // The new partition ends on this sector, inclusive.
        let end_sector = match table {
            PartitionTable::Msdos => target_bytes / sector_size - 1,
            PartitionTable::Gpt => {
                // Preserve the original backup-header gap when it was
                // smaller than the default.
                let tail = self.image.virtual_size - partition.end - 1;
                let reserved = std::cmp::min(tail, GPT_END_SECTS * sector_size);
                (target_bytes - reserved) / sector_size - 1
            }
        };
        (partition.start / sector_size, end_sector)
    }

    /// Grow one partition in place; start stays fixed.
    fn expand_partition(
        &self,
        session: &Session,
        partition: &Partition,
        size_mb: u64,
        table: PartitionTable,
    ) -> Result<u64> {
        let sector_size = session.sector_size()?;
        let (start_sector, end_sector) =
            self.calculate_new_partition(size_mb, partition, sector_size, table);
        session.resize_partition(partition, start_sector, end_sector)?;
        let new_size = (end_sector + 1) * sector_size - partition.start;
        Ok(new_size)
    }

    /// Expand partition table, last partition and its content to fill the
    /// already-grown overlay.
    fn expand_to_fit(&self, size_mb: u64, session: &Session) -> Result<()> {
        // Reading the table kind on the overlay fails while the backup
        // GPT header is still misplaced, so ask the original image.
        let table = self.session_ro()?.partition_table()?;

        if table == PartitionTable::Gpt {
            session.expand_gpt()?;
        }

        let partition = session.last_partition()?;
        let fs = Filesystem::detect(session, &partition.device)?;

        // Geometry edits under an active VG corrupt the PV; quiesce it.
        let lvm_backed = matches!(fs, Filesystem::LvmPhysical { .. });
        if lvm_backed {
            session.deactivate_vgs()?;
        }

        if partition.is_logical() {
            let container = session.container()?;
            self.expand_partition(session, &container, size_mb, table)?;
        }

        let new_size = self.expand_partition(session, &partition, size_mb, table)?;

        if lvm_backed {
            session.activate_vgs()?;
        }
        fs.resize(session, new_size)
    }

    /// Fold the overlay at `path` back into its backing image, leaving
    /// the merged file under `path`.
    fn merge_into_previous(&self, path: &Path) -> Result<()> {
        let policy = MergePolicy::detect(&self.qemu)?;
        let chain = self.qemu.chain(path)?;
        let images = chain.images();
        // Only the original image and the overlay take part.
        let tail = Chain::new(images[images.len().saturating_sub(2)..].to_vec());
        ExternalMerge::new(path, policy, self.qemu.clone()).execute_chain(&tail)
    }
}

/// Pick the partition-unaware mode.
fn select_mode_ignore(helper: &ResizeHelper, size_mb: u64) -> Result<ResizeMode> {
    let shrinking = mb_to_bytes(size_mb) < helper.image().virtual_size;
    match helper.partition_table() {
        Err(Error::NoPartitionTable) => Ok(if shrinking {
            ResizeMode::IgnoreShrinkTruncate
        } else {
            ResizeMode::IgnoreExpand
        }),
        Ok(table) => Ok(if shrinking {
            ResizeMode::IgnoreShrink
        } else if table == PartitionTable::Gpt {
            ResizeMode::IgnoreExpandGpt
        } else {
            ResizeMode::IgnoreExpand
        }),
        Err(err) => Err(err),
    }
}

/// Pick the partition-aware mode, falling back to the ignore path when
/// that is the only safe option.
fn select_mode_consider(helper: &ResizeHelper, size_mb: u64) -> Result<ResizeMode> {
    match helper.last_partition() {
        Ok(partition) => {
            let fs = helper.last_filesystem(&partition)?;
            if !fs.is_supported() {
                // Resizing content we do not understand destroys it.
                return select_mode_ignore(helper, size_mb);
            }
            if mb_to_bytes(size_mb) < helper.image().virtual_size {
                Ok(ResizeMode::ConsiderShrink)
            } else {
                Ok(ResizeMode::ConsiderExpand)
            }
        }
        Err(Error::NoPartitions) | Err(Error::NoPartitionTable) => {
            select_mode_ignore(helper, size_mb)
        }
        Err(err) => Err(err),
    }
}

/// Host bytes a mode needs before it may start.
fn needed_space(mode: ResizeMode, image: &Image, size_mb: u64) -> u64 {
    match mode {
        // Full copy of the current top image.
        ResizeMode::IgnoreShrink | ResizeMode::IgnoreShrinkTruncate | ResizeMode::ConsiderShrink => {
            image.actual_size
        }
        // In-place grow only allocates the added span.
        ResizeMode::IgnoreExpand | ResizeMode::IgnoreExpandGpt => {
            mb_to_bytes(size_mb).saturating_sub(image.virtual_size)
        }
        // Empirical estimate of filesystem bookkeeping growth.
        ResizeMode::ConsiderExpand => mb_to_bytes(size_mb) / 20,
    }
}

fn check_space(mode: ResizeMode, image: &Image, size_mb: u64) -> Result<()> {
    let needed = needed_space(mode, image, size_mb);
    let available = available_space(&image.filename)?;
    if needed > available {
        return Err(Error::NoFreeSpace { needed, available });
    }
    Ok(())
}

impl ResizeRequest {
    pub fn execute(&self, runner: &Runner, executor: &Arc<dyn Executor>) -> Result<()> {
        let _lock = DiskLock::write(&self.disk)?;

        let qemu = QemuImg::new(runner.clone(), Arc::clone(executor));
        let chain = qemu.chain_no_snapshots(&self.disk)?;
        log::info(chain.describe());
        let image = chain.top().clone();

        // Idempotence: resizing to the current size is a no-op.
        if mb_to_bytes(self.size_mb) == image.virtual_size {
            return Ok(());
        }
        if self.force {
            // QCOW2 images carry no suspended state to drop; the flag is
            // accepted for interface compatibility with ploop disks.
            log::info("--force has no effect on qcow2 images");
        }

        let helper = ResizeHelper::new(image, runner.clone(), Arc::clone(executor));
        let mode = if self.resize_last_partition {
            select_mode_consider(&helper, self.size_mb)?
        } else {
            select_mode_ignore(&helper, self.size_mb)?
        };
        log::info(format!("Resize mode: {mode:?}"));

        check_space(mode, helper.image(), self.size_mb)?;
        execute_mode(mode, &helper, self.size_mb)
    }
}

fn execute_mode(mode: ResizeMode, helper: &ResizeHelper, size_mb: u64) -> Result<()> {
    match mode {
        ResizeMode::IgnoreShrinkTruncate => ignore_shrink_truncate(helper, size_mb),
        ResizeMode::IgnoreShrink => ignore_shrink(helper, size_mb),
        ResizeMode::IgnoreExpand => ignore_expand(helper, size_mb),
        ResizeMode::IgnoreExpandGpt => ignore_expand_gpt(helper, size_mb),
        ResizeMode::ConsiderShrink => consider_shrink(helper, size_mb),
        ResizeMode::ConsiderExpand => consider_expand(helper, size_mb),
    }
}

fn remove_tmp_guard(path: PathBuf) -> DropGuard<impl FnOnce()> {
    // Fires on both exits; after a successful rename there is nothing
    // left to unlink and the call quietly fails.
    DropGuard::new(move || {
        let _ = std::fs::remove_file(&path);
    })
}

/// No partition table: the content cannot survive a shrink, recreate the
/// image at the target size.
fn ignore_shrink_truncate(helper: &ResizeHelper, size_mb: u64) -> Result<()> {
    let image = helper.image();
    let tmp = helper.qemu().create_tmp_image(&image.filename, size_mb, None)?;
    let _cleanup = remove_tmp_guard(tmp.clone());
    helper.executor.rename(&tmp, &image.filename)
}

/// Partition-preserving shrink through a full virt-resize copy.
fn ignore_shrink(helper: &ResizeHelper, size_mb: u64) -> Result<()> {
    let image = helper.image();
    let tmp = helper.qemu().create_tmp_image(&image.filename, size_mb, None)?;
    let _cleanup = remove_tmp_guard(tmp.clone());

    helper.sync_and_close()?;
    VirtResize::new(Arc::clone(&helper.executor)).run(&image.filename, &tmp)?;
    helper.executor.rename(&tmp, &image.filename)
}

/// Plain in-place virtual-size grow.
fn ignore_expand(helper: &ResizeHelper, size_mb: u64) -> Result<()> {
    helper.qemu().resize(&helper.image().filename, size_mb)
}

/// Windows refuses to see the added span until the backup GPT header
/// moves to the new end of the disk.
fn ignore_expand_gpt(helper: &ResizeHelper, size_mb: u64) -> Result<()> {
    ignore_expand(helper, size_mb)?;
    let session = helper.session_rw()?;
    session.expand_gpt()?;
    helper.sync_and_close()
}

fn consider_shrink(helper: &ResizeHelper, size_mb: u64) -> Result<()> {
    let image = helper.image().clone();
    let qemu = helper.qemu().clone();

    // Rollback point: the filesystem shrink below mutates the image
    // before the copy even starts.
    let snapshot = qemu.create_snapshot(&image.filename)?;
    let rollback = {
        let qemu = qemu.clone();
        let path = image.filename.clone();
        let tag = snapshot.clone();
        DropGuard::new(move || {
            let _ = qemu.apply_snapshot(&path, &tag);
            let _ = qemu.delete_snapshot(&path, &tag);
        })
    };

    helper.shrink_fs_if_needed(size_mb)?;

    let tmp = qemu.create_tmp_image(&image.filename, size_mb, None)?;
    let _cleanup = remove_tmp_guard(tmp.clone());

    let session = helper.session_ro()?;
    let partition = session.last_partition()?;
    let fs = Filesystem::detect(&session, &partition.device)?;
    // virt-resize cannot address a logical partition; the extended
    // container is resized in its place.
    let target = if partition.is_logical() {
        session.container()?
    } else {
        partition.clone()
    };
    drop(session);

    let mut resize = VirtResize::new(Arc::clone(&helper.executor));
    match fs {
        Filesystem::Swap { .. } => {
            let new_size = helper.new_fs_size(size_mb, &partition)?;
            resize.resize_force(&target.device, new_size);
        }
        Filesystem::Ntfs { .. } => {
            resize.shrink(&target.device).no_expand_content();
        }
        _ => {
            resize.shrink(&target.device);
        }
    }

    helper.sync_and_close()?;
    resize.run(&image.filename, &tmp)?;
    helper.executor.rename(&tmp, &image.filename)?;

    // Success: the rollback point is no longer wanted.
    rollback.disarm();
    qemu.delete_snapshot(&image.filename, &snapshot)
}

fn consider_expand(helper: &ResizeHelper, size_mb: u64) -> Result<()> {
    let image = helper.image().clone();

    // All work happens on a COW overlay; the original stays pristine
    // until the merge at the very end.
    let overlay = helper
        .qemu()
        .create_tmp_image(&image.filename, size_mb, Some(&image.filename))?;
    let _cleanup = remove_tmp_guard(overlay.clone());

    {
        let session = helper.pool.get_rw(&overlay)?;
        helper.expand_to_fit(size_mb, &session)?;
        session.sync()?;
    }
    helper.pool.close_all();

    helper.merge_into_previous(&overlay)?;

    // The merge leaves the result under the overlay's name.
    helper.executor.rename(&overlay, &image.filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    fn image(virtual_size: u64, actual_size: u64) -> Image {
        Image {
            filename: PathBuf::from("/vm/disk.qcow2"),
            virtual_size,
            actual_size,
            format: "qcow2".into(),
            backing: None,
            full_backing: None,
        }
    }

    #[test]
    fn shrink_modes_need_a_full_copy() {
        let img = image(10 * GIB, 3 * GIB);
        assert_eq!(needed_space(ResizeMode::IgnoreShrink, &img, 5 * 1024), 3 * GIB);
        assert_eq!(
            needed_space(ResizeMode::IgnoreShrinkTruncate, &img, 5 * 1024),
            3 * GIB
        );
        assert_eq!(
            needed_space(ResizeMode::ConsiderShrink, &img, 5 * 1024),
            3 * GIB
        );
    }

    #[test]
    fn expand_modes_need_the_added_span() {
        let img = image(10 * GIB, 3 * GIB);
        assert_eq!(
            needed_space(ResizeMode::IgnoreExpand, &img, 20 * 1024),
            10 * GIB
        );
        assert_eq!(
            needed_space(ResizeMode::IgnoreExpandGpt, &img, 20 * 1024),
            10 * GIB
        );
    }

    #[test]
    fn consider_expand_needs_five_percent_of_target() {
        let img = image(10 * GIB, 3 * GIB);
        assert_eq!(
            needed_space(ResizeMode::ConsiderExpand, &img, 20 * 1024),
            GIB
        );
    }

    #[test]
    fn virt_resize_arguments_are_ordered() {
        let executor: Arc<dyn Executor> = Arc::new(crate::common::process::LoggingExecutor);
        let mut vr = VirtResize::new(executor);
        vr.shrink("/dev/sda2").no_expand_content();
        assert_eq!(
            vr.args,
            vec!["--shrink", "/dev/sda2", "--no-expand-content"]
        );

        let executor: Arc<dyn Executor> = Arc::new(crate::common::process::LoggingExecutor);
        let mut vr = VirtResize::new(executor);
        vr.resize_force("/dev/sda3", 123456);
        assert_eq!(vr.args, vec!["--resize-force", "/dev/sda3=123456b"]);
    }
}
