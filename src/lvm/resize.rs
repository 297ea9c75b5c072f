//! Resizing a physical volume together with the logical volume on its tail.
//!
//! The PV lives inside the last partition; changing the partition requires
//! moving the LV tail segment and the filesystem inside that LV in the
//! right order. Shrink works inside-out, expand outside-in.

use crate::common::log;
use crate::common::units::{ceil_to, MIB};
use crate::error::{Error, Result};
use crate::guestfs::filesystem::Filesystem;
use crate::guestfs::Session;
use crate::lvm::{self, PhysicalVolume, Segment};

/// Space reserved at the start of a PV for the LVM label and metadata
/// area, in disk sectors.
pub const LVM_METADATA_SECTORS: u64 = 14336;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Shrink,
    Expand,
}

/// Raw distance between the requested PV size and the end of the last
/// segment, rounded to a whole number of extents: shrink amounts round
/// away from zero, growth amounts round toward zero, so the result never
/// overcommits the PV.
fn calculate_lv_delta(new_pv_size: u64, sector_size: u64, extent_size: u64, last: &Segment) -> i64 {
    let metadata = (LVM_METADATA_SECTORS * sector_size) as i128;
    let occupied = ((last.end_extents + 1) as i128) * extent_size as i128;
    let raw = new_pv_size as i128 - metadata - occupied;
    let rounded = raw.div_euclid(extent_size as i128) * extent_size as i128;
    rounded as i64
}

/// Apply the direction rules on top of the raw delta.
fn lv_delta(
    new_pv_size: u64,
    sector_size: u64,
    extent_size: u64,
    last: &Segment,
    direction: Direction,
) -> Result<i64> {
    let raw = calculate_lv_delta(new_pv_size, sector_size, extent_size, last);
    match direction {
        Direction::Shrink => {
            if raw > 0 {
                // Free tail already absorbs the whole shrink.
                return Ok(0);
            }
            if raw < 0 && !last.is_resizeable() {
                return Err(Error::internal(format!(
                    "Unable to resize logical volume {}: its tail segment is fixed",
                    last.logical.name
                )));
            }
            Ok(raw)
        }
        Direction::Expand => {
            if raw < 0 {
                return Err(Error::internal(
                    "Logical volume shrink needed while expanding the physical volume",
                ));
            }
            if raw > 0 && !last.is_resizeable() {
                return Ok(0);
            }
            Ok(raw)
        }
    }
}

fn lv_device(pv: &PhysicalVolume, segment: &Segment) -> String {
    format!("/dev/{}/{}", pv.group.name, segment.logical.name)
}

fn check_group(pv: &PhysicalVolume) -> Result<()> {
    if !pv.group.resizeable || !pv.group.writeable {
        return Err(Error::internal(format!(
            "Volume group {} is not modifiable",
            pv.group.name
        )));
    }
    Ok(())
}

/// Smallest PV size (in bytes) that still fits the metadata area and all
/// segments, shrinking the tail LV down to its filesystem minimum.
pub fn pv_minimum_size(session: &Session, device: &str) -> Result<u64> {
    let config = lvm::find_group_of(session, device)?;
    let pv = config.physical(device);
    let sector_size = session.sector_size()?;
    let extent_size = pv.group.extent_size_sectors * sector_size;
    let metadata = LVM_METADATA_SECTORS * sector_size;

    let Some(last) = pv.last_segment() else {
        // Empty PV: only the metadata area is needed.
        return Ok(metadata);
    };

    if !last.is_resizeable() {
        return Ok(metadata + (last.end_extents + 1) * extent_size);
    }

    let lv = lv_device(&pv, last);
    let lv_current_size = session.device_size(&lv)?;
    let fs = Filesystem::detect(session, &lv)?;
    let fs_min = fs.minimum_size(session)?;

    // The LV cannot lose more than its tail segment.
    let segment_bytes = last.size_extents() * extent_size;
    let floor = lv_current_size.saturating_sub(segment_bytes);
    let lv_result_size = ceil_to(fs_min.max(floor), extent_size);

    let theoretical =
        metadata + (last.end_extents + 1) * extent_size - (lv_current_size - lv_result_size);

    // Metadata slack can push the theoretical value past the actual PV.
    let current_pv_size = session.device_size(device)?;
    Ok(theoretical.min(current_pv_size))
}

/// Resize the PV on `device` to `new_pv_size` bytes, moving the tail LV
/// and its filesystem along.
pub fn resize_pv(session: &Session, device: &str, new_pv_size: u64) -> Result<()> {
    let config = lvm::find_group_of(session, device)?;
    let pv = config.physical(device);
    check_group(&pv)?;

    let sector_size = session.sector_size()?;
    let extent_size = pv.group.extent_size_sectors * sector_size;
    let current_pv_size = session.device_size(device)?;

    let direction = if new_pv_size < current_pv_size {
        Direction::Shrink
    } else {
        Direction::Expand
    };

    let Some(last) = pv.last_segment() else {
        return session.pvresize_size(device, new_pv_size);
    };

    let delta = lv_delta(new_pv_size, sector_size, extent_size, last, direction)?;
    log::info(format!(
        "PV {device}: {current_pv_size} -> {new_pv_size}, LV delta {delta}"
    ));
    if delta == 0 {
        return session.pvresize_size(device, new_pv_size);
    }

    let lv = lv_device(&pv, last);
    let lv_current_size = session.device_size(&lv)?;
    let lv_new_size = lv_current_size
        .checked_add_signed(delta)
        .filter(|s| *s > 0)
        .ok_or_else(|| {
            Error::internal(format!(
                "Unable to resize logical volume {lv} below zero"
            ))
        })?;
    let fs = Filesystem::detect(session, &lv)?;

    match direction {
        Direction::Shrink => {
            // Innermost first: filesystem, then LV, then PV.
            fs.shrink(session, lv_new_size)?;
            session.lvresize(&lv, lv_new_size / MIB)?;
            session.pvresize_size(device, new_pv_size)
        }
        Direction::Expand => {
            // Outermost first: PV, then LV, then filesystem.
            session.pvresize_size(device, new_pv_size)?;
            session.lvresize(&lv, lv_new_size / MIB)?;
            fs.resize(session, lv_new_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lvm::LogicalVolume;

    const SECTOR: u64 = 512;
    // 4 MiB extents.
    const EXTENT_SECTORS: u64 = 8192;
    const EXTENT: u64 = EXTENT_SECTORS * SECTOR;
    const METADATA: u64 = LVM_METADATA_SECTORS * SECTOR;

    fn tail_segment(end_extents: u64, resizeable: bool) -> Segment {
        Segment {
            logical: LogicalVolume {
                name: "root".into(),
                writeable: resizeable,
            },
            index: 1,
            linear: true,
            last_in_logical: true,
            pv: "/dev/sda2".into(),
            start_extents: 0,
            end_extents,
        }
    }

    #[test]
    fn delta_is_zero_when_pv_exactly_fits() {
        let last = tail_segment(99, true);
        let pv_size = METADATA + 100 * EXTENT;
        assert_eq!(calculate_lv_delta(pv_size, SECTOR, EXTENT, &last), 0);
    }

    #[test]
    fn positive_delta_rounds_toward_zero() {
        let last = tail_segment(99, true);
        // One and a half spare extents only yields one.
        let pv_size = METADATA + 100 * EXTENT + EXTENT + EXTENT / 2;
        assert_eq!(
            calculate_lv_delta(pv_size, SECTOR, EXTENT, &last),
            EXTENT as i64
        );
    }

    #[test]
    fn negative_delta_rounds_away_from_zero() {
        let last = tail_segment(99, true);
        // Half an extent short must free a whole extent.
        let pv_size = METADATA + 100 * EXTENT - EXTENT / 2;
        assert_eq!(
            calculate_lv_delta(pv_size, SECTOR, EXTENT, &last),
            -(EXTENT as i64)
        );
    }

    #[test]
    fn shrink_treats_positive_delta_as_zero() {
        let last = tail_segment(99, true);
        let pv_size = METADATA + 105 * EXTENT;
        let delta = lv_delta(pv_size, SECTOR, EXTENT, &last, Direction::Shrink).unwrap();
        assert_eq!(delta, 0);
    }

    #[test]
    fn shrink_of_fixed_segment_is_refused() {
        let last = tail_segment(99, false);
        let pv_size = METADATA + 90 * EXTENT;
        assert!(lv_delta(pv_size, SECTOR, EXTENT, &last, Direction::Shrink).is_err());
    }

    #[test]
    fn expand_refuses_negative_delta() {
        let last = tail_segment(99, true);
        let pv_size = METADATA + 90 * EXTENT;
        assert!(lv_delta(pv_size, SECTOR, EXTENT, &last, Direction::Expand).is_err());
    }

    #[test]
    fn expand_of_fixed_segment_leaves_lv_alone() {
        let last = tail_segment(99, false);
        let pv_size = METADATA + 120 * EXTENT;
        let delta = lv_delta(pv_size, SECTOR, EXTENT, &last, Direction::Expand).unwrap();
        assert_eq!(delta, 0);
    }

    #[test]
    fn expand_grows_by_whole_extents() {
        let last = tail_segment(99, true);
        let pv_size = METADATA + 110 * EXTENT;
        let delta = lv_delta(pv_size, SECTOR, EXTENT, &last, Direction::Expand).unwrap();
        assert_eq!(delta, 10 * EXTENT as i64);
    }
}
