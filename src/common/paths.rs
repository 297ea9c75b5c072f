//! Disk path resolution.
//!
//! A disk is either a plain QCOW2 file or a ploop container: a directory
//! holding a `DiskDescriptor.xml`. A path pointing at a file that lives next
//! to a descriptor is normalized to the containing directory.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DESCRIPTOR: &str = "DiskDescriptor.xml";

/// Temporary-image suffix used by every mutating operation.
pub const TMP_IMAGE_EXT: &str = "tmp";

/// Normalize a user-supplied `--hdd` argument.
///
/// Accepts a QCOW2 file, a ploop directory, or a file inside a ploop
/// directory (normalized to the directory). Anything else is `InvalidHdd`.
pub fn resolve_disk_path(src: &Path) -> Result<PathBuf> {
    if !src.exists() {
        return Err(Error::InvalidHdd);
    }

    let canonical = src
        .canonicalize()
        .map_err(|_| Error::InvalidHdd)?;

    if canonical.is_dir() {
        if canonical.join(DESCRIPTOR).is_file() {
            return Ok(canonical);
        }
        return Err(Error::InvalidHdd);
    }

    if canonical.is_file() {
        if let Some(parent) = canonical.parent() {
            if parent.join(DESCRIPTOR).is_file() {
                // A file inside a ploop directory addresses the whole disk.
                return Ok(parent.to_path_buf());
            }
        }
        return Ok(canonical);
    }

    Err(Error::InvalidHdd)
}

/// True when the resolved disk path is a ploop container directory.
pub fn is_ploop(path: &Path) -> bool {
    path.is_dir() && path.join(DESCRIPTOR).is_file()
}

/// Path of the scratch image written next to `path` during mutations.
pub fn tmp_image_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TMP_IMAGE_EXT);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn plain_file_resolves_to_itself() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("disk.qcow2");
        fs::write(&img, b"QFI").unwrap();

        let resolved = resolve_disk_path(&img).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "disk.qcow2");
        assert!(!is_ploop(&resolved));
    }

    #[test]
    fn ploop_directory_resolves_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DESCRIPTOR), b"<xml/>").unwrap();

        let resolved = resolve_disk_path(dir.path()).unwrap();
        assert!(is_ploop(&resolved));
    }

    #[test]
    fn file_next_to_descriptor_normalizes_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DESCRIPTOR), b"<xml/>").unwrap();
        let delta = dir.path().join("root.hds");
        fs::write(&delta, b"data").unwrap();

        let resolved = resolve_disk_path(&delta).unwrap();
        assert!(resolved.is_dir());
        assert!(is_ploop(&resolved));
    }

    #[test]
    fn directory_without_descriptor_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_disk_path(dir.path()),
            Err(Error::InvalidHdd)
        ));
    }

    #[test]
    fn missing_path_is_invalid() {
        assert!(matches!(
            resolve_disk_path(Path::new("/nonexistent/disk.qcow2")),
            Err(Error::InvalidHdd)
        ));
    }

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_image_path(Path::new("/vm/disk.qcow2")),
            PathBuf::from("/vm/disk.qcow2.tmp")
        );
    }
}
