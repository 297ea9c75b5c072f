//! Collapsing snapshot chains.
//!
//! External (backing-file) chains commit deltas down into the base, either
//! in one `commit -b` step or sequentially when qemu-img is too old for
//! the base flag. Internal snapshots are simply deleted from the image.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::common::lock::DiskLock;
use crate::common::log;
use crate::common::process::{available_space, Executor, Runner};
use crate::error::{Error, Result};
use crate::image::qemu::QemuImg;
use crate::image::Chain;

/// How to collapse an external chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// `commit -b base top`, one pass over the whole chain.
    Direct,
    /// Repeated plain `commit` of the top image, oldest qemu-img dialect.
    Sequential,
}

impl MergePolicy {
    /// Probe qemu-img for `commit -b` support.
    pub fn detect(qemu: &QemuImg) -> Result<Self> {
        let supported = qemu.supports_commit_to_base()?;
        log::info(format!(
            "Backing file specification [-b] is {}supported",
            if supported { "" } else { "not " }
        ));
        Ok(if supported {
            MergePolicy::Direct
        } else {
            MergePolicy::Sequential
        })
    }

    /// Host bytes the merge may need on top of what the chain occupies.
    pub fn needed_space(&self, chain: &Chain) -> u64 {
        match self {
            MergePolicy::Direct => {
                // Walking top-down: A'[i] = min(V, A[i] + A'[i+1]).
                let images = chain.images();
                let virtual_max = chain.virtual_size_max();
                let mut delta = 0;
                let mut prev_actual = images.last().map_or(0, |i| i.actual_size);
                for image in images.iter().rev().skip(1) {
                    let actual = std::cmp::min(virtual_max, image.actual_size + prev_actual);
                    delta += actual - image.actual_size;
                    prev_actual = actual;
                }
                delta
            }
            MergePolicy::Sequential => {
                // The base grows in place toward min(sum, virtual size).
                let result = std::cmp::min(chain.actual_size_sum(), chain.virtual_size_max());
                result - chain.base().actual_size
            }
        }
    }

    fn commit(&self, qemu: &QemuImg, chain: &Chain) -> Result<()> {
        let images = chain.images();
        match self {
            MergePolicy::Direct => {
                qemu.commit_to_base(&images[0].filename, &images[images.len() - 1].filename)
            }
            MergePolicy::Sequential => {
                // Fold the newest remaining image into its parent, one at
                // a time; the files themselves are unlinked afterwards.
                for image in images.iter().skip(1).rev() {
                    qemu.commit(&image.filename)?;
                }
                Ok(())
            }
        }
    }
}

/// Merge of an external backing chain into a single image.
pub struct ExternalMerge {
    disk: PathBuf,
    policy: MergePolicy,
    qemu: QemuImg,
    executor: Arc<dyn Executor>,
}

impl ExternalMerge {
    pub fn new(disk: &Path, policy: MergePolicy, qemu: QemuImg) -> Self {
        let executor = Arc::clone(qemu.executor());
        ExternalMerge {
            disk: disk.to_path_buf(),
            policy,
            qemu,
            executor,
        }
    }

    /// The `merge --external` entry point: locks the disk itself.
    pub fn execute(&self) -> Result<()> {
        let _lock = DiskLock::write(&self.disk)?;
        let chain = self.qemu.chain(&self.disk)?;

        // Merging drops internal snapshots of every non-base image.
        for image in chain.images().iter().skip(1) {
            self.qemu.check_no_snapshots(&image.filename)?;
        }

        self.execute_chain(&chain)
    }

    /// Collapse an already-read chain; the caller holds the disk lock.
    pub fn execute_chain(&self, chain: &Chain) -> Result<()> {
        if chain.len() <= 1 {
            return Ok(());
        }

        let needed = self.policy.needed_space(chain);
        let available = available_space(&chain.base().filename)?;
        if needed > available {
            return Err(Error::NoFreeSpace { needed, available });
        }

        self.policy.commit(&self.qemu, chain)?;

        // The base carries the merged content now; give it the top's name
        // and drop the dangling intermediates.
        let images = chain.images();
        let base = &images[0].filename;
        let top = &images[images.len() - 1].filename;
        self.executor.rename(base, top)?;
        for image in &images[1..images.len() - 1] {
            self.executor.remove(&image.filename)?;
        }
        Ok(())
    }
}

/// Deletion of every internal snapshot of the image.
pub struct InternalMerge {
    disk: PathBuf,
    qemu: QemuImg,
}

impl InternalMerge {
    pub fn new(disk: &Path, qemu: QemuImg) -> Self {
        InternalMerge {
            disk: disk.to_path_buf(),
            qemu,
        }
    }

    pub fn execute(&self) -> Result<()> {
        let _lock = DiskLock::write(&self.disk)?;
        for id in self.qemu.snapshots(&self.disk)? {
            self.qemu.delete_snapshot(&self.disk, &id)?;
        }
        Ok(())
    }
}

/// Capability-probed merge entry used by the `merge` command.
pub fn run(disk: &Path, external: bool, runner: &Runner, executor: &Arc<dyn Executor>) -> Result<()> {
    let qemu = QemuImg::new(runner.clone(), Arc::clone(executor));
    if external {
        let policy = MergePolicy::detect(&qemu)?;
        ExternalMerge::new(disk, policy, qemu).execute()
    } else {
        InternalMerge::new(disk, qemu).execute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    fn image(name: &str, virtual_size: u64, actual_size: u64) -> Image {
        Image {
            filename: PathBuf::from(name),
            virtual_size,
            actual_size,
            format: "qcow2".into(),
            backing: None,
            full_backing: None,
        }
    }

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn direct_space_telescopes_from_the_top() {
        // V = 10G, A = [4G, 3G, 2G] base..top.
        let chain = Chain::new(vec![
            image("base", 10 * GIB, 4 * GIB),
            image("mid", 10 * GIB, 3 * GIB),
            image("top", 10 * GIB, 2 * GIB),
        ]);
        // A'[2] = 2G; A'[1] = min(10G, 3+2) = 5G (delta 2G);
        // A'[0] = min(10G, 4+5) = 9G (delta 5G). Total 7G.
        assert_eq!(MergePolicy::Direct.needed_space(&chain), 7 * GIB);
    }

    #[test]
    fn direct_space_is_clamped_by_virtual_size() {
        let chain = Chain::new(vec![
            image("base", 4 * GIB, 4 * GIB),
            image("top", 4 * GIB, 3 * GIB),
        ]);
        // A'[0] = min(4G, 4+3) = 4G, delta 0.
        assert_eq!(MergePolicy::Direct.needed_space(&chain), 0);
    }

    #[test]
    fn sequential_space_is_result_minus_base() {
        let chain = Chain::new(vec![
            image("base", 10 * GIB, 4 * GIB),
            image("mid", 10 * GIB, 3 * GIB),
            image("top", 10 * GIB, 2 * GIB),
        ]);
        // min(9G, 10G) - 4G = 5G.
        assert_eq!(MergePolicy::Sequential.needed_space(&chain), 5 * GIB);
    }

    #[test]
    fn sequential_space_clamps_to_virtual_size() {
        let chain = Chain::new(vec![
            image("base", 5 * GIB, 4 * GIB),
            image("top", 5 * GIB, 4 * GIB),
        ]);
        // min(8G, 5G) - 4G = 1G.
        assert_eq!(MergePolicy::Sequential.needed_space(&chain), GIB);
    }

    #[test]
    fn single_image_needs_no_space() {
        let chain = Chain::new(vec![image("only", GIB, GIB)]);
        assert_eq!(MergePolicy::Direct.needed_space(&chain), 0);
        assert_eq!(MergePolicy::Sequential.needed_space(&chain), 0);
    }
}
