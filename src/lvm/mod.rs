//! Structured representation of LVM configuration.
//!
//! The volume-group metadata is read out of the guest (vgcfgbackup text
//! format) and parsed directly; see [`metadata`]. The resize arithmetic
//! over it lives in [`resize`].

pub mod metadata;
pub mod resize;

pub use resize::{pv_minimum_size, resize_pv, LVM_METADATA_SECTORS};

use crate::error::{Error, Result};
use crate::guestfs::Session;

/// Volume group attributes the resize path cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    /// Allocation unit, in disk sectors.
    pub extent_size_sectors: u64,
    pub resizeable: bool,
    pub writeable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    pub name: String,
    pub writeable: bool,
}

/// Contiguous extent range of one LV on one PV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub logical: LogicalVolume,
    /// 1-based position inside the LV.
    pub index: u32,
    pub linear: bool,
    pub last_in_logical: bool,
    /// Device node of the PV holding this segment.
    pub pv: String,
    /// Offsets on the PV, in extents, inclusive.
    pub start_extents: u64,
    pub end_extents: u64,
}

impl Segment {
    pub fn size_extents(&self) -> u64 {
        self.end_extents - self.start_extents + 1
    }

    /// Only a linear tail segment of a writable LV can move.
    pub fn is_resizeable(&self) -> bool {
        self.linear && self.last_in_logical && self.logical.writeable
    }
}

/// One PV with the segments that live on it.
#[derive(Debug, Clone)]
pub struct PhysicalVolume {
    pub group: Group,
    pub segments: Vec<Segment>,
}

impl PhysicalVolume {
    /// Segment with the greatest end offset on this PV.
    pub fn last_segment(&self) -> Option<&Segment> {
        self.segments.iter().max_by_key(|s| s.end_extents)
    }
}

/// Parsed view of one volume group.
#[derive(Debug, Clone)]
pub struct Config {
    pub group: Group,
    pub pv_devices: Vec<String>,
    pub segments: Vec<Segment>,
}

impl Config {
    pub fn contains_device(&self, device: &str) -> bool {
        self.pv_devices.iter().any(|d| d == device)
    }

    pub fn physical(&self, device: &str) -> PhysicalVolume {
        PhysicalVolume {
            group: self.group.clone(),
            segments: self
                .segments
                .iter()
                .filter(|s| s.pv == device)
                .cloned()
                .collect(),
        }
    }
}

/// Locate and parse the volume group containing the given PV device.
pub fn find_group_of(session: &Session, device: &str) -> Result<Config> {
    for vg in session.vgs()? {
        let text = session.vg_metadata(&vg)?;
        let config = metadata::parse(&text, &vg)?;
        if config.contains_device(device) {
            return Ok(config);
        }
    }
    Err(Error::internal(format!(
        "No volume group found for {device}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(index: u32, last: bool, linear: bool, writeable: bool, end: u64) -> Segment {
        Segment {
            logical: LogicalVolume {
                name: "root".into(),
                writeable,
            },
            index,
            linear,
            last_in_logical: last,
            pv: "/dev/sda2".into(),
            start_extents: 0,
            end_extents: end,
        }
    }

    #[test]
    fn segment_resizeable_needs_all_three() {
        assert!(segment(1, true, true, true, 9).is_resizeable());
        assert!(!segment(1, false, true, true, 9).is_resizeable());
        assert!(!segment(1, true, false, true, 9).is_resizeable());
        assert!(!segment(1, true, true, false, 9).is_resizeable());
    }

    #[test]
    fn last_segment_is_greatest_end() {
        let group = Group {
            name: "vg0".into(),
            extent_size_sectors: 8192,
            resizeable: true,
            writeable: true,
        };
        let pv = PhysicalVolume {
            group,
            segments: vec![
                segment(1, false, true, true, 99),
                segment(2, true, true, true, 499),
                segment(1, true, true, true, 299),
            ],
        };
        assert_eq!(pv.last_segment().unwrap().end_extents, 499);
    }

    #[test]
    fn segment_size_is_inclusive() {
        let s = segment(1, true, true, true, 9);
        assert_eq!(s.size_extents(), 10);
    }
}
