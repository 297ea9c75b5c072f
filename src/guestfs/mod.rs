//! Typed facade over the libguestfs appliance.
//!
//! A [`Session`] is a `guestfish --listen` process with the image attached;
//! every operation is a `guestfish --remote` call. Queries always run for
//! real, mutations are routed through the [`Executor`] so `--dry-run`
//! prints them instead.

pub mod filesystem;
pub mod partition;
pub mod pool;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::common::log;
use crate::common::process::{Capture, Executor, Output, Runner, DEFAULT_TIMEOUT_S};
use crate::common::units::ceil_to_mb;
use crate::error::{Error, Result};
use partition::{Attributes, Geometry, Partition, PartitionTable};

pub const GUESTFISH: &str = "guestfish";

/// The single attached drive always appears as this device.
pub const DEVICE: &str = "/dev/sda";

// virt-resize refuses to work into less than this overhead; computed the
// same way as libguestfs' resize tool so our preflight agrees with it.
pub const MAX_BOOTLOADER_SECTS: u64 = 4096;
pub const GPT_START_SECTS: u64 = 64;
pub const GPT_END_SECTS: u64 = 64;
pub const ALIGNMENT_SECTS: u64 = 128;

/// Live appliance attached to one image.
pub struct Session {
    image: PathBuf,
    readonly: bool,
    remote_arg: String,
    runner: Runner,
    executor: Arc<dyn Executor>,
}

impl Session {
    pub fn open_ro(
        image: &Path,
        runner: Runner,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        Self::open(image, true, runner, executor)
    }

    pub fn open_rw(
        image: &Path,
        runner: Runner,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        Self::open(image, false, runner, executor)
    }

    fn open(
        image: &Path,
        readonly: bool,
        runner: Runner,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        runner.check_cancelled()?;

        let mut args = vec!["--listen".to_string()];
        if readonly {
            args.push("--ro".to_string());
        }
        args.push("-a".to_string());
        args.push(image.to_string_lossy().into_owned());

        let out = runner.run_checked(GUESTFISH, &args, Capture::BOTH, DEFAULT_TIMEOUT_S)?;
        let pid = parse_listen_pid(&out.stdout).ok_or_else(|| {
            Error::internal(format!(
                "guestfish did not report a listener pid for {}",
                image.display()
            ))
        })?;

        let session = Session {
            image: image.to_path_buf(),
            readonly,
            remote_arg: format!("--remote={pid}"),
            runner,
            executor,
        };
        // Boot the appliance.
        session.query(&["run"])?;
        Ok(session)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn remote_args(&self, cmd: &[&str]) -> Vec<String> {
        let mut args = vec![self.remote_arg.clone(), "--".to_string()];
        args.extend(cmd.iter().map(|s| s.to_string()));
        args
    }

    /// Raw remote call; the caller inspects exit code and stderr.
    fn call(&self, cmd: &[&str]) -> Result<Output> {
        self.runner.run(
            GUESTFISH,
            &self.remote_args(cmd),
            Capture::BOTH,
            DEFAULT_TIMEOUT_S,
        )
    }

    /// Read-only remote call, trimmed stdout, non-zero exit is an error.
    fn query(&self, cmd: &[&str]) -> Result<String> {
        let args = self.remote_args(cmd);
        let out = self
            .runner
            .run(GUESTFISH, &args, Capture::BOTH, DEFAULT_TIMEOUT_S)?;
        if !out.success() {
            log::info(format!("guestfish: {}", out.stderr.trim()));
            return Err(Error::subprogram(GUESTFISH, &args, out.code));
        }
        Ok(out.stdout.trim().to_string())
    }

    /// Disk-modifying remote call, routed through the executor.
    fn mutate(&self, cmd: &[&str]) -> Result<()> {
        self.executor
            .run_checked(GUESTFISH, &self.remote_args(cmd), Capture::BOTH, DEFAULT_TIMEOUT_S)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Disk geometry

    pub fn sector_size(&self) -> Result<u64> {
        parse_u64(&self.query(&["blockdev-getss", DEVICE])?)
    }

    pub fn block_size(&self) -> Result<u64> {
        parse_u64(&self.query(&["blockdev-getbsz", DEVICE])?)
    }

    pub fn device_size(&self, device: &str) -> Result<u64> {
        parse_u64(&self.query(&["blockdev-getsize64", device])?)
    }

    /// Partition table kind, or `NoPartitionTable`.
    pub fn partition_table(&self) -> Result<PartitionTable> {
        let out = self.call(&["part-get-parttype", DEVICE])?;
        if !out.success() {
            let stderr = out.stderr.to_lowercase();
            if stderr.contains("unrecognised disk label") || stderr.contains("unrecognized disk label") {
                return Err(Error::NoPartitionTable);
            }
            return Err(Error::subprogram(
                GUESTFISH,
                &self.remote_args(&["part-get-parttype", DEVICE]),
                out.code,
            ));
        }
        match out.stdout.trim() {
            "msdos" => Ok(PartitionTable::Msdos),
            "gpt" => Ok(PartitionTable::Gpt),
            other => {
                log::info(format!("partition table: {other}"));
                Err(Error::UnsupportedPartition)
            }
        }
    }

    /// Device names of all partitions, e.g. `["/dev/sda1", "/dev/sda2"]`.
    pub fn list_partitions(&self) -> Result<Vec<String>> {
        let out = self.query(&["list-partitions"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn geometries(&self) -> Result<Vec<Geometry>> {
        parse_part_list(&self.query(&["part-list", DEVICE])?)
    }

    /// All partitions with geometry and preserved attributes, index order.
    pub fn partitions(&self) -> Result<Vec<Partition>> {
        let table = self.partition_table()?;
        let geometries = self.geometries()?;
        if geometries.is_empty() {
            return Err(Error::NoPartitions);
        }

        let mut partitions = Vec::with_capacity(geometries.len());
        for geo in geometries {
            partitions.push(self.read_partition(table, geo)?);
        }
        partitions.sort_by_key(|p| p.index);
        Ok(partitions)
    }

    fn read_partition(&self, table: PartitionTable, geo: Geometry) -> Result<Partition> {
        let index = geo.index;
        let num = index.to_string();
        let bootable = self.query(&["part-get-bootable", DEVICE, &num])? == "true";

        let attrs = match table {
            PartitionTable::Msdos => {
                let id = self.query(&["part-get-mbr-id", DEVICE, &num])?;
                Attributes::Mbr {
                    bootable,
                    mbr_id: parse_mbr_id(&id)?,
                }
            }
            PartitionTable::Gpt => Attributes::Gpt {
                bootable,
                name: self.query(&["part-get-name", DEVICE, &num])?,
                type_guid: self.query(&["part-get-gpt-type", DEVICE, &num])?,
                part_guid: self.query(&["part-get-gpt-guid", DEVICE, &num])?,
            },
        };

        Ok(Partition {
            device: format!("{DEVICE}{index}"),
            index,
            start: geo.start,
            end: geo.end,
            size: geo.size,
            attrs,
        })
    }

    /// The partition with the greatest end offset.
    pub fn last_partition(&self) -> Result<Partition> {
        let partitions = self.partitions()?;
        partitions
            .into_iter()
            .max_by_key(|p| p.end)
            .ok_or(Error::NoPartitions)
    }

    /// The MBR extended (container) partition.
    pub fn container(&self) -> Result<Partition> {
        if self.partition_table()? == PartitionTable::Gpt {
            return Err(Error::UnsupportedPartition);
        }
        self.partitions()?
            .into_iter()
            .find(Partition::is_extended)
            .ok_or_else(|| Error::internal("No extended partition found"))
    }

    /// Overhead virt-resize insists on having available, rounded up to a
    /// whole mebibyte. Mirrors the arithmetic of libguestfs' resize tool;
    /// the constants must be kept in sync with it.
    pub fn virt_resize_overhead(&self) -> Result<u64> {
        let geometries = self.geometries()?;
        let first_start = geometries
            .first()
            .map(|g| g.start)
            .ok_or(Error::NoPartitions)?;
        let part_count = geometries.len() as u64;
        let sector_size = self.sector_size()?;

        Ok(virt_resize_overhead(first_start, part_count, sector_size))
    }

    // ---------------------------------------------------------------
    // Partition mutation

    /// Move the backup GPT header to the current end of the disk.
    pub fn expand_gpt(&self) -> Result<()> {
        self.mutate(&["part-expand-gpt", DEVICE])
    }

    /// Resize a partition by deleting and recreating it with identical
    /// type and attributes. An extended container first captures its
    /// logicals, then recreates them at their original coordinates.
    pub fn resize_partition(
        &self,
        partition: &Partition,
        start_sector: u64,
        end_sector: u64,
    ) -> Result<()> {
        let sector_size = self.sector_size()?;

        let logicals = if partition.is_extended() {
            self.partitions()?
                .into_iter()
                .filter(Partition::is_logical)
                .collect()
        } else {
            Vec::new()
        };

        // Deleting an extended partition cascades to its logicals.
        self.mutate(&["part-del", DEVICE, &partition.index.to_string()])?;
        self.add_partition(
            partition.part_type(),
            start_sector,
            end_sector,
            partition,
        )?;

        for logical in &logicals {
            self.add_partition(
                "logical",
                logical.start / sector_size,
                logical.end / sector_size,
                logical,
            )?;
        }
        Ok(())
    }

    fn add_partition(
        &self,
        part_type: &str,
        start_sector: u64,
        end_sector: u64,
        attrs_from: &Partition,
    ) -> Result<()> {
        self.mutate(&[
            "part-add",
            DEVICE,
            part_type,
            &start_sector.to_string(),
            &end_sector.to_string(),
        ])?;
        self.restore_attributes(attrs_from)
    }

    fn restore_attributes(&self, partition: &Partition) -> Result<()> {
        let num = partition.index.to_string();
        if partition.attrs.bootable() {
            self.mutate(&["part-set-bootable", DEVICE, &num, "true"])?;
        }
        match &partition.attrs {
            Attributes::Mbr { mbr_id, .. } => {
                // The extended container keeps its id through part-add.
                if !partition.is_extended() {
                    self.mutate(&["part-set-mbr-id", DEVICE, &num, &format!("{mbr_id:#x}")])?;
                }
            }
            Attributes::Gpt {
                name,
                type_guid,
                part_guid,
                ..
            } => {
                if !name.is_empty() {
                    self.mutate(&["part-set-name", DEVICE, &num, name])?;
                }
                self.mutate(&["part-set-gpt-type", DEVICE, &num, type_guid])?;
                self.mutate(&["part-set-gpt-guid", DEVICE, &num, part_guid])?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Filesystems

    /// `(device, filesystem)` pairs for everything the appliance found,
    /// logical volumes included.
    pub fn list_filesystems(&self) -> Result<Vec<(String, String)>> {
        let out = self.query(&["list-filesystems"])?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let (device, kind) = line.split_once(':')?;
                Some((device.trim().to_string(), kind.trim().to_string()))
            })
            .collect())
    }

    pub fn vfs_minimum_size(&self, device: &str) -> Result<u64> {
        parse_u64(&self.query(&["vfs-minimum-size", device])?)
    }

    pub fn mount_ro(&self, device: &str) -> Result<()> {
        self.query(&["mount-ro", device, "/"]).map(drop)
    }

    pub fn mount_rw(&self, device: &str) -> Result<()> {
        self.query(&["mount", device, "/"]).map(drop)
    }

    pub fn umount(&self) -> Result<()> {
        self.query(&["umount", "/"]).map(drop)
    }

    /// statvfs of a mounted-then-unmounted filesystem.
    pub fn filesystem_stats(&self, device: &str) -> Result<FsStats> {
        self.mount_ro(device)?;
        let out = self.query(&["statvfs", "/"]);
        let umount = self.umount();
        let stats = parse_statvfs(&out?)?;
        umount?;
        Ok(stats)
    }

    pub fn resize2fs(&self, device: &str, size: u64) -> Result<()> {
        self.mutate(&["resize2fs-size", device, &size.to_string()])
    }

    pub fn ntfsresize(&self, device: &str, size: u64) -> Result<()> {
        self.mutate(&[
            "ntfsresize",
            device,
            &format!("size:{size}"),
            "force:true",
        ])
    }

    pub fn ntfsfix(&self, device: &str) -> Result<()> {
        self.mutate(&["ntfsfix", device])
    }

    pub fn btrfs_resize(&self, size: u64) -> Result<()> {
        self.mutate(&["btrfs-filesystem-resize", "/", &format!("size:{size}")])
    }

    pub fn xfs_growfs(&self) -> Result<()> {
        self.mutate(&["xfs-growfs", "/"])
    }

    // ---------------------------------------------------------------
    // LVM

    pub fn vgs(&self) -> Result<Vec<String>> {
        let out = self.query(&["vgs"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn activate_vgs(&self) -> Result<()> {
        self.mutate(&["vg-activate-all", "true"])
    }

    pub fn deactivate_vgs(&self) -> Result<()> {
        self.mutate(&["vg-activate-all", "false"])
    }

    /// Raw metadata text of a volume group, as `vgcfgbackup` writes it.
    pub fn vg_metadata(&self, group: &str) -> Result<String> {
        let script = format!(
            "vgcfgbackup -f /tmp/disktool-vgmeta {group} >/dev/null 2>&1 && cat /tmp/disktool-vgmeta"
        );
        self.query(&["debug", "sh", &script])
    }

    pub fn pvresize_size(&self, device: &str, size: u64) -> Result<()> {
        self.mutate(&["pvresize-size", device, &size.to_string()])
    }

    /// Resize a logical volume to `mbytes` mebibytes.
    pub fn lvresize(&self, lv: &str, mbytes: u64) -> Result<()> {
        self.mutate(&["lvresize", lv, &mbytes.to_string()])
    }

    // ---------------------------------------------------------------

    /// Flush appliance caches before the image is handed to another tool.
    pub fn sync(&self) -> Result<()> {
        self.query(&["sync"]).map(drop)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        log::info(format!("Closing appliance for {}", self.image.display()));
        // Shuts the listener down; best effort.
        let _ = self.runner.run(
            GUESTFISH,
            &self.remote_args(&["exit"]),
            Capture::BOTH,
            60,
        );
    }
}

/// Mounted-filesystem statistics (subset of statvfs we consume).
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
}

impl FsStats {
    pub fn free_bytes(&self) -> u64 {
        self.bfree * self.frsize
    }

    pub fn used_bytes(&self) -> u64 {
        (self.blocks - self.bfree) * self.frsize
    }
}

pub(crate) fn virt_resize_overhead(first_part_start: u64, part_count: u64, sector_size: u64) -> u64 {
    let start_overhead_sects = std::cmp::max(
        first_part_start / sector_size,
        std::cmp::max(MAX_BOOTLOADER_SECTS, GPT_START_SECTS),
    );
    let alignment_sects = (part_count + 1) * ALIGNMENT_SECTS;
    let overhead_sects = start_overhead_sects + alignment_sects + GPT_END_SECTS;
    ceil_to_mb(overhead_sects * sector_size)
}

fn parse_listen_pid(stdout: &str) -> Option<u32> {
    let re = Regex::new(r"GUESTFISH_PID=(\d+)").expect("pid regex");
    re.captures(stdout)?.get(1)?.as_str().parse().ok()
}

fn parse_u64(value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::parse(format!("Expected a number, got '{value}'")))
}

fn parse_mbr_id(value: &str) -> Result<u8> {
    let value = value.trim();
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u8::from_str_radix(digits, 16)
        .map_err(|_| Error::parse(format!("Cannot parse MBR id '{value}'")))
}

/// Parse `part-list` struct output into geometry rows.
fn parse_part_list(output: &str) -> Result<Vec<Geometry>> {
    let field = Regex::new(r"^\s*part_(num|start|end|size):\s*(\d+)\s*$").expect("part field regex");

    let mut rows = Vec::new();
    let mut current: [Option<u64>; 4] = [None; 4];

    let mut flush = |current: &mut [Option<u64>; 4]| -> Result<()> {
        if current.iter().all(Option::is_none) {
            return Ok(());
        }
        let [num, start, end, size] = *current;
        let (Some(num), Some(start), Some(end), Some(size)) = (num, start, end, size) else {
            return Err(Error::parse("Unable to get partition list"));
        };
        rows.push(Geometry {
            index: num as u32,
            start,
            end,
            size,
        });
        *current = [None; 4];
        Ok(())
    };

    for line in output.lines() {
        if line.trim_start().starts_with('[') {
            flush(&mut current)?;
            continue;
        }
        if let Some(caps) = field.captures(line) {
            let value: u64 = caps[2]
                .parse()
                .map_err(|_| Error::parse("Unable to get partition list"))?;
            match &caps[1] {
                "num" => current[0] = Some(value),
                "start" => current[1] = Some(value),
                "end" => current[2] = Some(value),
                "size" => current[3] = Some(value),
                _ => unreachable!(),
            }
        }
    }
    flush(&mut current)?;

    Ok(rows)
}

/// Parse `statvfs /` struct output.
fn parse_statvfs(output: &str) -> Result<FsStats> {
    let mut stats = FsStats::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match key.trim() {
            "frsize" => stats.frsize = value,
            "blocks" => stats.blocks = value,
            "bfree" => stats.bfree = value,
            _ => {}
        }
    }
    if stats.frsize == 0 || stats.blocks == 0 {
        return Err(Error::parse("Unable to get filesystem stats"));
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_pid_is_extracted() {
        let out = "GUESTFISH_PID=4242; export GUESTFISH_PID\n";
        assert_eq!(parse_listen_pid(out), Some(4242));
        assert_eq!(parse_listen_pid("no pid here"), None);
    }

    #[test]
    fn part_list_parses_struct_output() {
        let out = "\
[0] = {
  part_num: 1
  part_start: 1048576
  part_end: 537919487
  part_size: 536870912
}
[1] = {
  part_num: 2
  part_start: 537919488
  part_end: 10737418239
  part_size: 10199498752
}
";
        let rows = parse_part_list(out).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            Geometry {
                index: 1,
                start: 1048576,
                end: 537919487,
                size: 536870912
            }
        );
        assert_eq!(rows[1].index, 2);
    }

    #[test]
    fn part_list_rejects_truncated_entries() {
        let out = "\
[0] = {
  part_num: 1
  part_start: 1048576
}
";
        assert!(parse_part_list(out).is_err());
    }

    #[test]
    fn empty_part_list_is_empty() {
        assert!(parse_part_list("").unwrap().is_empty());
    }

    #[test]
    fn statvfs_parses_fields() {
        let out = "\
bsize: 4096
frsize: 4096
blocks: 2621440
bfree: 2359296
bavail: 2228224
files: 655360
ffree: 600000
";
        let stats = parse_statvfs(out).unwrap();
        assert_eq!(stats.frsize, 4096);
        assert_eq!(stats.free_bytes(), 2359296 * 4096);
        assert_eq!(stats.used_bytes(), (2621440 - 2359296) * 4096);
    }

    #[test]
    fn mbr_id_accepts_hex() {
        assert_eq!(parse_mbr_id("0x83").unwrap(), 0x83);
        assert_eq!(parse_mbr_id("83").unwrap(), 0x83);
        assert!(parse_mbr_id("zz").is_err());
    }

    #[test]
    fn overhead_formula_matches_resize_tool() {
        // 1 MiB-aligned first partition, 2 partitions, 512-byte sectors:
        // start overhead is the bootloader allowance (4096 sectors).
        let overhead = virt_resize_overhead(1048576, 2, 512);
        let expected_sects = 4096 + (2 + 1) * 128 + 64;
        assert_eq!(overhead, ceil_to_mb(expected_sects * 512));
    }

    #[test]
    fn overhead_respects_large_first_partition_offset() {
        // First partition starting at 16 MiB dominates the bootloader term.
        let overhead = virt_resize_overhead(16 * 1048576, 1, 512);
        let expected_sects = (16 * 1048576 / 512) + 2 * 128 + 64;
        assert_eq!(overhead, ceil_to_mb(expected_sects * 512));
    }
}
