//! Filesystem back-ends for the last-partition resize.
//!
//! Each supported filesystem knows how to report its minimum size and how
//! to resize itself through the appliance. The variants are closed: the
//! orchestrator matches on them to pick virt-resize arguments.

use crate::common::log;
use crate::error::{Error, Result};
use crate::guestfs::Session;
use crate::lvm;

/// A swap header plus slack; smaller makes mkswap refuse.
pub const SWAP_MIN_SIZE: u64 = 40 * 1024;

const NTFS_DIRTY_ADVISORY: &str = "\
Unable to query the NTFS filesystem for its minimum size.
The volume is likely marked dirty by Windows; boot the guest and shut it
down cleanly (or run chkdsk /f) before resizing. Size estimates fall back
to block accounting and may be inaccurate.";

/// Filesystem living on a partition (or logical volume).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filesystem {
    Ext { device: String },
    Ntfs { device: String },
    Btrfs { device: String },
    Xfs { device: String },
    Swap { device: String },
    LvmPhysical { device: String },
    Unknown { device: String, kind: String },
}

impl Filesystem {
    /// Identify the filesystem on `device` from the appliance's view.
    pub fn detect(session: &Session, device: &str) -> Result<Self> {
        let listed = session.list_filesystems()?;
        let kind = listed
            .into_iter()
            .find(|(dev, _)| dev == device)
            .map(|(_, kind)| kind)
            .ok_or_else(|| Error::parse("Unable to get filesystem for partition"))?;

        Ok(Self::from_kind(device, &kind))
    }

    pub fn from_kind(device: &str, kind: &str) -> Self {
        let device = device.to_string();
        match kind {
            "ext2" | "ext3" | "ext4" => Filesystem::Ext { device },
            "ntfs" => Filesystem::Ntfs { device },
            "btrfs" => Filesystem::Btrfs { device },
            "xfs" => Filesystem::Xfs { device },
            "swap" => Filesystem::Swap { device },
            "LVM2_member" => Filesystem::LvmPhysical { device },
            other => Filesystem::Unknown {
                device,
                kind: other.to_string(),
            },
        }
    }

    pub fn device(&self) -> &str {
        match self {
            Filesystem::Ext { device }
            | Filesystem::Ntfs { device }
            | Filesystem::Btrfs { device }
            | Filesystem::Xfs { device }
            | Filesystem::Swap { device }
            | Filesystem::LvmPhysical { device }
            | Filesystem::Unknown { device, .. } => device,
        }
    }

    pub fn kind_name(&self) -> &str {
        match self {
            Filesystem::Ext { .. } => "ext",
            Filesystem::Ntfs { .. } => "ntfs",
            Filesystem::Btrfs { .. } => "btrfs",
            Filesystem::Xfs { .. } => "xfs",
            Filesystem::Swap { .. } => "swap",
            Filesystem::LvmPhysical { .. } => "LVM2_member",
            Filesystem::Unknown { kind, .. } => kind,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Filesystem::Unknown { .. })
    }

    fn unsupported(&self) -> Error {
        Error::UnsupportedFs(self.kind_name().to_string())
    }

    /// Smallest size this filesystem can be shrunk to, in bytes.
    pub fn minimum_size(&self, session: &Session) -> Result<u64> {
        match self {
            Filesystem::Ext { device } => session.vfs_minimum_size(device),
            Filesystem::Ntfs { device } => {
                session.vfs_minimum_size(device).map_err(|err| {
                    log::warn(NTFS_DIRTY_ADVISORY);
                    err
                })
            }
            Filesystem::Btrfs { device } | Filesystem::Xfs { device } => {
                session.mount_ro(device)?;
                let min = session.vfs_minimum_size(device);
                session.umount()?;
                min
            }
            Filesystem::Swap { .. } => Ok(SWAP_MIN_SIZE),
            Filesystem::LvmPhysical { device } => lvm::pv_minimum_size(session, device),
            Filesystem::Unknown { .. } => Err(self.unsupported()),
        }
    }

    /// Resize to `new_size` bytes. Growing and shrinking both end here;
    /// per-filesystem quirks are contained in the arms.
    pub fn resize(&self, session: &Session, new_size: u64) -> Result<()> {
        match self {
            Filesystem::Ext { device } => {
                // resize2fs works in units of 1 KiB.
                let size = new_size & !1023;
                log::info(format!("resize2fs {device} {size}"));
                session.resize2fs(device, size)
            }
            Filesystem::Ntfs { device } => {
                log::info(format!("ntfsresize -f {device} --size {new_size}"));
                session.ntfsresize(device, new_size)?;
                // ntfsresize leaves the volume flagged for chkdsk.
                session.ntfsfix(device)
            }
            Filesystem::Btrfs { device } => {
                log::info(format!("btrfs filesystem resize {new_size} /"));
                session.mount_rw(device)?;
                let res = session.btrfs_resize(new_size);
                session.umount()?;
                res
            }
            Filesystem::Xfs { device } => {
                // XFS cannot shrink; grow to whatever the partition allows.
                log::info(format!("xfs_growfs -d / (on {device})"));
                session.mount_rw(device)?;
                let res = session.xfs_growfs();
                session.umount()?;
                res
            }
            // The swap header is recreated by the caller when needed.
            Filesystem::Swap { .. } => Ok(()),
            Filesystem::LvmPhysical { device } => lvm::resize_pv(session, device, new_size),
            Filesystem::Unknown { .. } => Err(self.unsupported()),
        }
    }

    /// Shrink to `new_size`, refusing to cross the filesystem minimum.
    pub fn shrink(&self, session: &Session, new_size: u64) -> Result<()> {
        if let Filesystem::LvmPhysical { .. } = self {
            // The PV path performs its own minimum checks per volume.
            return self.resize(session, new_size);
        }

        let minimum = self.minimum_size(session)?;
        if minimum > new_size {
            return Err(Error::NoFsFreeSpace {
                requested: new_size,
                minimum,
            });
        }
        self.resize(session, new_size)
    }
}
