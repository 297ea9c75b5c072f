//! QCOW2 image and backing-chain information.
//!
//! Everything here is read from `qemu-img info` dumps; instances are
//! immutable snapshots and are re-read after every mutation.

pub mod qemu;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DISK_FORMAT: &str = "qcow2";

/// One image of a backing chain.
#[derive(Debug, Clone)]
pub struct Image {
    pub filename: PathBuf,
    pub virtual_size: u64,
    pub actual_size: u64,
    pub format: String,
    pub backing: Option<PathBuf>,
    /// Absolute path of `backing`, resolved against the image's directory
    /// when qemu-img does not report it.
    pub full_backing: Option<PathBuf>,
}

impl Image {
    pub fn describe(&self) -> String {
        format!(
            "filename: {}\nvirtualSize: {}\nactualSize: {}\nformat: {}",
            self.filename.display(),
            self.virtual_size,
            self.actual_size,
            self.format
        )
    }
}

/// Backing chain ordered base first, top (guest-visible) last.
#[derive(Debug, Clone)]
pub struct Chain {
    images: Vec<Image>,
}

impl Chain {
    pub fn new(images: Vec<Image>) -> Self {
        Chain { images }
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// The image the guest sees.
    pub fn top(&self) -> &Image {
        self.images.last().expect("chain is never empty")
    }

    pub fn base(&self) -> &Image {
        self.images.first().expect("chain is never empty")
    }

    pub fn actual_size_sum(&self) -> u64 {
        self.images.iter().map(|i| i.actual_size).sum()
    }

    pub fn virtual_size_max(&self) -> u64 {
        self.images.iter().map(|i| i.virtual_size).max().unwrap_or(0)
    }

    pub fn describe(&self) -> String {
        self.images
            .iter()
            .map(Image::describe)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Deserialize)]
struct RawImageInfo {
    filename: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "actual-size")]
    actual_size: u64,
    format: String,
    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
    #[serde(rename = "full-backing-filename")]
    full_backing_filename: Option<String>,
}

/// Parse the JSON emitted by `qemu-img info --backing-chain --output json`.
///
/// qemu-img lists the newest image first; the chain is stored base first.
/// `dir_path` is the directory of the inspected image, used to resolve a
/// relative backing name when the full path is absent.
pub fn parse_chain(data: &str, dir_path: &Path) -> Result<Chain> {
    let raw: Vec<RawImageInfo> =
        serde_json::from_str(data).map_err(|e| Error::parse(format!("Cannot parse image information: {e}")))?;

    if raw.is_empty() {
        return Err(Error::parse("Cannot parse image information: empty chain"));
    }

    let mut images = Vec::with_capacity(raw.len());
    for info in raw {
        if info.format != DISK_FORMAT {
            return Err(Error::parse(format!(
                "{}: unsupported format \"{}\". Only \"{}\" is supported.",
                info.filename, info.format, DISK_FORMAT
            )));
        }

        let backing = info.backing_filename.map(PathBuf::from);
        let full_backing = match (&backing, info.full_backing_filename) {
            (None, _) => None,
            (Some(_), Some(full)) => Some(PathBuf::from(full)),
            (Some(rel), None) => {
                if rel.is_absolute() {
                    Some(rel.clone())
                } else {
                    // Images of one chain live in the same directory.
                    Some(dir_path.join(rel))
                }
            }
        };

        // Prepend: newest-first input, base-first storage.
        images.insert(
            0,
            Image {
                filename: PathBuf::from(info.filename),
                virtual_size: info.virtual_size,
                actual_size: info.actual_size,
                format: info.format,
                backing,
                full_backing,
            },
        );
    }

    Ok(Chain::new(images))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"[
        {
            "filename": "/vm/disk.qcow2",
            "virtual-size": 10737418240,
            "actual-size": 1073741824,
            "format": "qcow2"
        }
    ]"#;

    const CHAINED: &str = r#"[
        {
            "filename": "/vm/top.qcow2",
            "virtual-size": 10737418240,
            "actual-size": 4096,
            "format": "qcow2",
            "backing-filename": "mid.qcow2"
        },
        {
            "filename": "/vm/mid.qcow2",
            "virtual-size": 10737418240,
            "actual-size": 65536,
            "format": "qcow2",
            "backing-filename": "base.qcow2",
            "full-backing-filename": "/vm/base.qcow2"
        },
        {
            "filename": "/vm/base.qcow2",
            "virtual-size": 10737418240,
            "actual-size": 1073741824,
            "format": "qcow2"
        }
    ]"#;

    #[test]
    fn single_image_chain() {
        let chain = parse_chain(SINGLE, Path::new("/vm")).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.top().virtual_size, 10 * 1024 * 1024 * 1024);
        assert!(chain.top().backing.is_none());
    }

    #[test]
    fn chain_is_reversed_to_base_first() {
        let chain = parse_chain(CHAINED, Path::new("/vm")).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.base().filename, PathBuf::from("/vm/base.qcow2"));
        assert_eq!(chain.top().filename, PathBuf::from("/vm/top.qcow2"));
    }

    #[test]
    fn relative_backing_resolves_against_directory() {
        let chain = parse_chain(CHAINED, Path::new("/vm")).unwrap();
        let top = chain.top();
        assert_eq!(top.backing, Some(PathBuf::from("mid.qcow2")));
        assert_eq!(top.full_backing, Some(PathBuf::from("/vm/mid.qcow2")));
    }

    #[test]
    fn explicit_full_backing_wins() {
        let chain = parse_chain(CHAINED, Path::new("/elsewhere")).unwrap();
        let mid = &chain.images()[1];
        assert_eq!(mid.full_backing, Some(PathBuf::from("/vm/base.qcow2")));
    }

    #[test]
    fn aggregates() {
        let chain = parse_chain(CHAINED, Path::new("/vm")).unwrap();
        assert_eq!(chain.actual_size_sum(), 4096 + 65536 + 1073741824);
        assert_eq!(chain.virtual_size_max(), 10737418240);
    }

    #[test]
    fn non_qcow2_is_rejected_by_name() {
        let raw = r#"[{
            "filename": "/vm/disk.img",
            "virtual-size": 1048576,
            "actual-size": 1048576,
            "format": "raw"
        }]"#;
        let err = parse_chain(raw, Path::new("/vm")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("/vm/disk.img"));
        assert!(msg.contains("raw"));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            parse_chain("not json", Path::new("/vm")),
            Err(Error::Parse(_))
        ));
    }
}
