//! Size parsing and formatting.
//!
//! Sizes on the command line are an integer with an optional unit letter;
//! a bare number means mebibytes. Internally everything is megabyte- or
//! byte-denominated `u64`.

use crate::error::{Error, Result};

pub const SECTOR_SIZE: u64 = 512;
pub const MIB: u64 = 1024 * 1024;

/// Units accepted by `--size` and `--units`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Kilo,
    Mega,
    Giga,
    Tera,
}

impl SizeUnit {
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'K' => Some(SizeUnit::Kilo),
            'M' => Some(SizeUnit::Mega),
            'G' => Some(SizeUnit::Giga),
            'T' => Some(SizeUnit::Tera),
            _ => None,
        }
    }

    /// Parse the `--units` argument of `resize --info`.
    pub fn from_arg(arg: &str) -> Result<Self> {
        let mut chars = arg.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => SizeUnit::from_letter(c)
                .ok_or_else(|| Error::InvalidArgs(format!("Cannot parse units '{arg}'"))),
            _ => Err(Error::InvalidArgs(format!("Cannot parse units '{arg}'"))),
        }
    }
}

pub fn mb_to_bytes(mb: u64) -> u64 {
    mb * MIB
}

/// Convert a value in `unit` to whole mebibytes, truncating for smaller
/// units and failing on overflow for the larger ones.
pub fn to_size_mb(size: u64, unit: SizeUnit) -> Result<u64> {
    match unit {
        SizeUnit::Kilo => Ok(size / 1024),
        SizeUnit::Mega => Ok(size),
        SizeUnit::Giga => {
            if size > u64::MAX / 1024 {
                return Err(Error::InvalidArgs("Size too big".into()));
            }
            Ok(size * 1024)
        }
        SizeUnit::Tera => {
            if size > u64::MAX / 1024 / 1024 {
                return Err(Error::InvalidArgs("Size too big".into()));
            }
            Ok(size * 1024 * 1024)
        }
    }
}

/// Parse a `--size` argument (`N`, `NK`, `NM`, `NG`, `NT`) into mebibytes.
pub fn parse_size_mb(value: &str) -> Result<u64> {
    let value = value.trim();
    let last = value
        .chars()
        .last()
        .ok_or_else(|| Error::InvalidArgs("Empty size".into()))?;

    let (digits, unit) = if last.is_ascii_alphabetic() {
        let unit = SizeUnit::from_letter(last)
            .ok_or_else(|| Error::InvalidArgs(format!("Unknown size unit '{last}'")))?;
        (&value[..value.len() - 1], unit)
    } else if last.is_ascii_digit() {
        (value, SizeUnit::Mega)
    } else {
        return Err(Error::InvalidArgs(format!(
            "Wrong character in size '{value}'"
        )));
    };

    let size: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidArgs(format!("Cannot parse size '{value}'")))?;
    to_size_mb(size, unit)
}

/// Print a byte count in the given unit, ceil-rounded, right-aligned to the
/// info report column.
pub fn format_size(bytes: u64, unit: SizeUnit) -> String {
    fn ceil_div(value: u64, div: u64) -> u64 {
        value.div_ceil(div)
    }

    match unit {
        SizeUnit::Kilo => format!("{:>14}K", ceil_div(bytes, 1024)),
        SizeUnit::Mega => format!("{:>14}M", ceil_div(bytes, MIB)),
        SizeUnit::Giga => format!("{:>14}G", ceil_div(bytes, 1024 * MIB)),
        SizeUnit::Tera => format!("{:>14}T", ceil_div(bytes, 1024 * 1024 * MIB)),
    }
}

pub fn ceil_to(bytes: u64, div: u64) -> u64 {
    bytes.div_ceil(div) * div
}

pub fn ceil_to_mb(bytes: u64) -> u64 {
    ceil_to(bytes, MIB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_megabytes() {
        assert_eq!(parse_size_mb("512").unwrap(), 512);
    }

    #[test]
    fn unit_letters() {
        assert_eq!(parse_size_mb("2048K").unwrap(), 2);
        assert_eq!(parse_size_mb("5G").unwrap(), 5 * 1024);
        assert_eq!(parse_size_mb("1T").unwrap(), 1024 * 1024);
    }

    #[test]
    fn kilobytes_truncate_down() {
        assert_eq!(parse_size_mb("1500K").unwrap(), 1);
    }

    #[test]
    fn overflow_is_rejected() {
        let huge = format!("{}G", u64::MAX / 1024 + 1);
        assert!(parse_size_mb(&huge).is_err());
        let huge = format!("{}T", u64::MAX / 1024 / 1024 + 1);
        assert!(parse_size_mb(&huge).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_size_mb("").is_err());
        assert!(parse_size_mb("12Q").is_err());
        assert!(parse_size_mb("size").is_err());
        assert!(parse_size_mb("-5G").is_err());
    }

    #[test]
    fn format_rounds_up() {
        assert_eq!(format_size(10 * 1024 * MIB, SizeUnit::Giga).trim(), "10G");
        assert_eq!(format_size(1, SizeUnit::Giga).trim(), "1G");
        assert_eq!(format_size(0, SizeUnit::Mega).trim(), "0M");
    }

    #[test]
    fn units_arg_parsing() {
        assert_eq!(SizeUnit::from_arg("K").unwrap(), SizeUnit::Kilo);
        assert_eq!(SizeUnit::from_arg("G").unwrap(), SizeUnit::Giga);
        assert!(SizeUnit::from_arg("KB").is_err());
        assert!(SizeUnit::from_arg("").is_err());
    }
}
