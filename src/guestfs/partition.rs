//! Partition model shared by the facade and the resize orchestrator.

/// MBR ids that mark an extended (container) partition.
pub const EXTENDED_MBR_IDS: [u8; 16] = [
    0x05, 0x0F, 0x15, 0x1F, 0x42, 0x82, 0x85, 0x91, 0x9B, 0xA5, 0xA6, 0xA9, 0xBF, 0xC5, 0xCF,
    0xD5,
];

/// Partition table kind of the whole disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTable {
    Msdos,
    Gpt,
}

impl PartitionTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionTable::Msdos => "msdos",
            PartitionTable::Gpt => "gpt",
        }
    }
}

/// Attributes that must survive a delete-and-recreate resize bit-exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attributes {
    Mbr {
        bootable: bool,
        mbr_id: u8,
    },
    Gpt {
        bootable: bool,
        name: String,
        type_guid: String,
        part_guid: String,
    },
}

impl Attributes {
    pub fn bootable(&self) -> bool {
        match self {
            Attributes::Mbr { bootable, .. } => *bootable,
            Attributes::Gpt { bootable, .. } => *bootable,
        }
    }
}

/// One partition as seen by the appliance. Offsets and sizes in bytes.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Device node, e.g. `/dev/sda2`.
    pub device: String,
    /// Partition number, 1-based; logicals start at 5.
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub attrs: Attributes,
}

impl Partition {
    /// MBR logical partition, lives inside the extended container.
    pub fn is_logical(&self) -> bool {
        matches!(self.attrs, Attributes::Mbr { .. }) && self.index > 4
    }

    /// MBR extended container partition.
    pub fn is_extended(&self) -> bool {
        match self.attrs {
            Attributes::Mbr { mbr_id, .. } => {
                self.index <= 4 && EXTENDED_MBR_IDS.contains(&mbr_id)
            }
            Attributes::Gpt { .. } => false,
        }
    }

    /// Type keyword for recreating this partition.
    pub fn part_type(&self) -> &'static str {
        if self.is_extended() {
            "extended"
        } else if self.is_logical() {
            "logical"
        } else {
            "primary"
        }
    }
}

/// Raw geometry row of `part-list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub size: u64,
}
