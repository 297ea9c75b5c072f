//! Wrapper around the `qemu-img` command-line tool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::common::paths::tmp_image_path;
use crate::common::process::{Capture, Executor, Runner, DEFAULT_TIMEOUT_S};
use crate::error::{Error, Result};
use crate::image::{parse_chain, Chain, DISK_FORMAT};

pub const QEMU_IMG: &str = "qemu-img";

/// Tag used for the rollback snapshot taken before destructive resizes.
const ROLLBACK_SNAPSHOT: &str = "disktool.rollback";

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Typed access to qemu-img. Reads always run for real; mutations go
/// through the executor so `--dry-run` can log them instead.
#[derive(Clone)]
pub struct QemuImg {
    runner: Runner,
    executor: Arc<dyn Executor>,
}

impl QemuImg {
    pub fn new(runner: Runner, executor: Arc<dyn Executor>) -> Self {
        QemuImg { runner, executor }
    }

    /// Read the full backing chain of `path`, base first.
    pub fn chain(&self, path: &Path) -> Result<Chain> {
        let args = vec![
            "info".to_string(),
            "--backing-chain".to_string(),
            "--output".to_string(),
            "json".to_string(),
            path_arg(path),
        ];
        let out = self
            .runner
            .run_checked(QEMU_IMG, &args, Capture::BOTH, DEFAULT_TIMEOUT_S)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        parse_chain(&out.stdout, dir)
    }

    /// Chain for a mutating operation: the top image must carry no
    /// internal snapshots, they would be silently dropped.
    pub fn chain_no_snapshots(&self, path: &Path) -> Result<Chain> {
        let chain = self.chain(path)?;
        self.check_no_snapshots(&chain.top().filename)?;
        Ok(chain)
    }

    /// Internal snapshot ids of `path`, in listing order.
    pub fn snapshots(&self, path: &Path) -> Result<Vec<String>> {
        let args = vec!["snapshot".to_string(), "-l".to_string(), path_arg(path)];
        let out = self
            .runner
            .run_checked(QEMU_IMG, &args, Capture::BOTH, DEFAULT_TIMEOUT_S)?;

        // Data rows look like: "1   before-resize   0 B  2024-01-01 12:00:00  00:00:00.000"
        let row = Regex::new(r"(?m)^(\d+)\s+(.+?)\s+\d+\s+\d{4}-\d{2}-\d{2}")
            .expect("snapshot row regex");
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| row.captures(line))
            .map(|caps| caps[1].to_string())
            .collect())
    }

    pub fn check_no_snapshots(&self, path: &Path) -> Result<()> {
        if self.snapshots(path)?.is_empty() {
            return Ok(());
        }
        Err(Error::HasInternalSnapshots(path.to_path_buf()))
    }

    /// Create a blank (or overlay) QCOW2 next to `path`, returning the
    /// `.tmp` path. Runs even in dry-run so later steps have a real file
    /// to look at; the caller owns removal.
    pub fn create_tmp_image(&self, path: &Path, size_mb: u64, backing: Option<&Path>) -> Result<PathBuf> {
        let tmp = tmp_image_path(path);
        let options = match backing {
            Some(base) => format!("backing_file={},backing_fmt={DISK_FORMAT},lazy_refcounts=on", base.display()),
            None => "lazy_refcounts=on".to_string(),
        };
        let args = vec![
            "create".to_string(),
            "-f".to_string(),
            DISK_FORMAT.to_string(),
            "-o".to_string(),
            options,
            path_arg(&tmp),
            format!("{size_mb}M"),
        ];
        self.runner
            .run_checked(QEMU_IMG, &args, Capture::BOTH, DEFAULT_TIMEOUT_S)?;
        Ok(tmp)
    }

    /// Grow (or shrink) the virtual size in place.
    pub fn resize(&self, path: &Path, size_mb: u64) -> Result<()> {
        let args = vec![
            "resize".to_string(),
            path_arg(path),
            format!("{size_mb}M"),
        ];
        self.executor
            .run_checked(QEMU_IMG, &args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        Ok(())
    }

    /// `commit -b base top`: fold every delta between `top` and `base`
    /// directly into `base`.
    pub fn commit_to_base(&self, base: &Path, top: &Path) -> Result<()> {
        let args = vec![
            "commit".to_string(),
            "-b".to_string(),
            path_arg(base),
            path_arg(top),
        ];
        self.executor
            .run_checked(QEMU_IMG, &args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        Ok(())
    }

    /// Plain `commit`: fold `top` into its immediate backing file.
    pub fn commit(&self, top: &Path) -> Result<()> {
        let args = vec!["commit".to_string(), path_arg(top)];
        self.executor
            .run_checked(QEMU_IMG, &args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        Ok(())
    }

    /// Take the pre-operation rollback snapshot, returning its tag.
    pub fn create_snapshot(&self, path: &Path) -> Result<String> {
        let args = vec![
            "snapshot".to_string(),
            "-c".to_string(),
            ROLLBACK_SNAPSHOT.to_string(),
            path_arg(path),
        ];
        self.executor
            .run_checked(QEMU_IMG, &args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        Ok(ROLLBACK_SNAPSHOT.to_string())
    }

    pub fn apply_snapshot(&self, path: &Path, tag: &str) -> Result<()> {
        let args = vec![
            "snapshot".to_string(),
            "-a".to_string(),
            tag.to_string(),
            path_arg(path),
        ];
        self.executor
            .run_checked(QEMU_IMG, &args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        Ok(())
    }

    pub fn delete_snapshot(&self, path: &Path, tag: &str) -> Result<()> {
        let args = vec![
            "snapshot".to_string(),
            "-d".to_string(),
            tag.to_string(),
            path_arg(path),
        ];
        self.executor
            .run_checked(QEMU_IMG, &args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        Ok(())
    }

    /// Rewrite `src` into `dst` as standalone qcow2 with the given options.
    pub fn convert(&self, src: &Path, dst: &Path, options: &str) -> Result<()> {
        let args = vec![
            "convert".to_string(),
            "-O".to_string(),
            DISK_FORMAT.to_string(),
            "-o".to_string(),
            options.to_string(),
            path_arg(src),
            path_arg(dst),
        ];
        self.executor
            .run_checked(QEMU_IMG, &args, Capture::NONE, DEFAULT_TIMEOUT_S)?;
        Ok(())
    }

    /// Whether this qemu-img supports `commit -b <base>`.
    pub fn supports_commit_to_base(&self) -> Result<bool> {
        let args = vec!["--help".to_string()];
        let out = self
            .runner
            .run_checked(QEMU_IMG, &args, Capture::BOTH, DEFAULT_TIMEOUT_S)?;
        Ok(help_mentions_commit_base(&out.stdout))
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }
}

// TODO: replace the help-text probe with a version matrix once the oldest
// supported qemu-img is known.
fn help_mentions_commit_base(help: &str) -> bool {
    let line = Regex::new(r"(?m)^\s*commit.*-b.*$").expect("commit probe regex");
    line.is_match(help)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_base_probe_matches_usage_line() {
        let help = "\
Command syntax:
  check [--object objectdef] filename
  commit [-q] [--object objectdef] [-f fmt] [-t cache] [-b base] [-d] [-p] filename
  compare [--object objectdef] filename1 filename2
";
        assert!(help_mentions_commit_base(help));
    }

    #[test]
    fn commit_base_probe_rejects_old_usage_line() {
        let help = "\
Command syntax:
  check filename
  commit [-f fmt] [-t cache] filename
";
        assert!(!help_mentions_commit_base(help));
    }

    #[test]
    fn snapshot_listing_regex_extracts_ids() {
        let listing = "\
Snapshot list:
ID        TAG                 VM SIZE                DATE       VM CLOCK
1         before-resize             0 2024-02-01 10:30:01   00:00:00.000
2         weekly backup             0 2024-02-08 09:00:00   00:00:00.000
";
        let row = Regex::new(r"(?m)^(\d+)\s+(.+?)\s+\d+\s+\d{4}-\d{2}-\d{2}").unwrap();
        let ids: Vec<&str> = listing
            .lines()
            .filter_map(|l| row.captures(l))
            .map(|c| c.get(1).unwrap().as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
