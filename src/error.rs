use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the tool can report to the user.
///
/// Each variant renders as a single line on stderr; a few carry enough
/// structure for callers to make decisions (e.g. the resize orchestrator
/// downgrades `UnsupportedFs` and `NoPartitions` to partition-unaware modes).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Invalid disk path")]
    InvalidHdd,

    #[error("The specified disk image \"{}\" is locked by another process", .0.display())]
    Locked(PathBuf),

    #[error("Not enough free space ( needed: {needed} available: {available} )")]
    NoFreeSpace { needed: u64, available: u64 },

    #[error("Not enough free space on filesystem ( requested: {requested} minimum: {minimum} )\nFree at least {} bytes more", .minimum - .requested)]
    NoFsFreeSpace { requested: u64, minimum: u64 },

    #[error("No partitions found")]
    NoPartitions,

    #[error("No partition table found")]
    NoPartitionTable,

    #[error("Unsupported partition layout")]
    UnsupportedPartition,

    #[error("Unsupported filesystem: {0}")]
    UnsupportedFs(String),

    #[error("Ploop image is not mounted")]
    PloopNotMounted,

    #[error("Failed to execute ploop")]
    PloopExecFailed,

    #[error("Image \"{}\" has internal snapshots. Merge snapshots to proceed.", .0.display())]
    HasInternalSnapshots(PathBuf),

    #[error("Cannot convert an image with snapshots. Merge snapshots first.")]
    CannotConvertNeedMerge,

    #[error("{program} {} returned {code}", .args.join(" "))]
    SubprogramFailed {
        program: String,
        args: Vec<String>,
        code: i32,
    },

    #[error("{0}")]
    Parse(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Exit code reported by the binary. Stable so that callers scripting
    /// the tool can distinguish the common failure classes.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgs(_) => 2,
            Error::InvalidHdd => 3,
            Error::Locked(_) => 4,
            Error::NoFreeSpace { .. } | Error::NoFsFreeSpace { .. } => 5,
            Error::NoPartitions => 6,
            Error::NoPartitionTable => 7,
            Error::UnsupportedPartition => 8,
            Error::UnsupportedFs(_) => 9,
            Error::PloopNotMounted | Error::PloopExecFailed => 10,
            Error::HasInternalSnapshots(_) => 11,
            Error::CannotConvertNeedMerge => 12,
            Error::SubprogramFailed { .. } => 13,
            Error::Parse(_) => 14,
            Error::Cancelled => 15,
            Error::Internal(_) => 1,
        }
    }

    pub fn subprogram(program: &str, args: &[String], code: i32) -> Self {
        Error::SubprogramFailed {
            program: program.to_string(),
            args: args.to_vec(),
            code,
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Error::Parse(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_nonzero_and_stable() {
        let errors = [
            Error::InvalidArgs("x".into()),
            Error::InvalidHdd,
            Error::Locked(PathBuf::from("/tmp/a.qcow2")),
            Error::NoFreeSpace {
                needed: 10,
                available: 5,
            },
            Error::NoFsFreeSpace {
                requested: 10,
                minimum: 20,
            },
            Error::NoPartitions,
            Error::NoPartitionTable,
            Error::UnsupportedPartition,
            Error::UnsupportedFs("vfat".into()),
            Error::PloopNotMounted,
            Error::PloopExecFailed,
            Error::HasInternalSnapshots(PathBuf::from("/tmp/a.qcow2")),
            Error::CannotConvertNeedMerge,
            Error::subprogram("qemu-img", &["info".into()], 1),
            Error::parse("bad json"),
            Error::Cancelled,
            Error::internal("boom"),
        ];
        for err in &errors {
            assert_ne!(err.exit_code(), 0, "{err}");
        }
    }

    #[test]
    fn subprogram_message_contains_command_line() {
        let err = Error::subprogram("qemu-img", &["resize".into(), "disk.qcow2".into()], 1);
        assert_eq!(err.to_string(), "qemu-img resize disk.qcow2 returned 1");
    }

    #[test]
    fn fs_free_space_message_names_missing_bytes() {
        let err = Error::NoFsFreeSpace {
            requested: 100,
            minimum: 150,
        };
        assert!(err.to_string().contains("Free at least 50 bytes more"));
    }
}
