//! Parser for the LVM2 text metadata format.
//!
//! The format written by `vgcfgbackup` is line oriented and stable:
//! `name { ... }` sections, `key = value` pairs, `key = [ ... ]` lists,
//! `#` comments. Only the handful of fields the resize path needs is
//! pulled out of the tree.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::lvm::{Config, Group, LogicalVolume, Segment};

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Number(u64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    fn as_number(&self) -> Option<u64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Status lists render as text items: `["READ", "WRITE"]`.
    fn list_contains(&self, needle: &str) -> bool {
        match self {
            Value::List(items) => items
                .iter()
                .any(|v| v.as_text() == Some(needle)),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Section {
    values: HashMap<String, Value>,
    // Declaration order matters for nothing we read, but keep it anyway.
    children: Vec<(String, Section)>,
}

impl Section {
    fn child(&self, name: &str) -> Option<&Section> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    fn number(&self, key: &str) -> Option<u64> {
        self.values.get(key)?.as_number()
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.values.get(key)?.as_text()
    }

    fn status_contains(&self, needle: &str) -> bool {
        self.values
            .get("status")
            .is_some_and(|v| v.list_contains(needle))
    }
}

/// Strip a `#` comment, honoring quoted strings.
fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (pos, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..pos],
            _ => {}
        }
    }
    line
}

fn parse_scalar(token: &str) -> Value {
    let token = token.trim();
    if let Some(stripped) = token.strip_prefix('"') {
        return Value::Text(stripped.trim_end_matches('"').to_string());
    }
    match token.parse::<u64>() {
        Ok(n) => Value::Number(n),
        Err(_) => Value::Text(token.to_string()),
    }
}

fn parse_list_items(body: &str, items: &mut Vec<Value>) {
    for token in body.split(',') {
        let token = token.trim();
        if !token.is_empty() {
            items.push(parse_scalar(token));
        }
    }
}

/// Parse the whole metadata text into a section tree.
fn parse_tree(text: &str) -> Result<Section> {
    let mut root = Section::default();
    // Stack of open sections; indices into an arena to appease ownership.
    let mut arena: Vec<Section> = vec![];
    let mut stack: Vec<(String, usize)> = vec![];
    // Open list accumulation.
    let mut open_list: Option<(String, Vec<Value>)> = None;

    fn current<'a>(
        root: &'a mut Section,
        arena: &'a mut Vec<Section>,
        stack: &[(String, usize)],
    ) -> &'a mut Section {
        match stack.last() {
            Some((_, idx)) => &mut arena[*idx],
            None => root,
        }
    }

    for raw_line in text.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some((key, items)) = open_list.as_mut() {
            if let Some(body) = line.strip_suffix(']') {
                parse_list_items(body, items);
                let (key, items) = (key.clone(), std::mem::take(items));
                open_list = None;
                current(&mut root, &mut arena, &stack)
                    .values
                    .insert(key, Value::List(items));
            } else {
                parse_list_items(line, items);
            }
            continue;
        }

        if let Some(name) = line.strip_suffix('{') {
            arena.push(Section::default());
            stack.push((name.trim().to_string(), arena.len() - 1));
            continue;
        }

        if line == "}" {
            let (name, idx) = stack
                .pop()
                .ok_or_else(|| Error::parse("Unbalanced '}' in LVM metadata"))?;
            let section = std::mem::take(&mut arena[idx]);
            current(&mut root, &mut arena, &stack)
                .children
                .push((name, section));
            continue;
        }

        if let Some((key, rest)) = line.split_once('=') {
            let key = key.trim().to_string();
            let rest = rest.trim();
            if let Some(body) = rest.strip_prefix('[') {
                if let Some(body) = body.strip_suffix(']') {
                    let mut items = Vec::new();
                    parse_list_items(body, &mut items);
                    current(&mut root, &mut arena, &stack)
                        .values
                        .insert(key, Value::List(items));
                } else {
                    let mut items = Vec::new();
                    parse_list_items(body, &mut items);
                    open_list = Some((key, items));
                }
            } else {
                current(&mut root, &mut arena, &stack)
                    .values
                    .insert(key, parse_scalar(rest));
            }
            continue;
        }

        return Err(Error::parse(format!(
            "Unexpected line in LVM metadata: '{line}'"
        )));
    }

    if !stack.is_empty() {
        return Err(Error::parse("Unterminated section in LVM metadata"));
    }
    Ok(root)
}

/// Parse the metadata of volume group `vg_name` into a [`Config`].
pub fn parse(text: &str, vg_name: &str) -> Result<Config> {
    let root = parse_tree(text)?;
    let vg = root
        .child(vg_name)
        .ok_or_else(|| Error::parse(format!("No LVM group '{vg_name}' found")))?;

    let extent_size_sectors = vg
        .number("extent_size")
        .ok_or_else(|| Error::parse("LVM metadata lacks extent_size"))?;

    let group = Group {
        name: vg_name.to_string(),
        extent_size_sectors,
        resizeable: vg.status_contains("RESIZEABLE"),
        writeable: vg.status_contains("WRITE"),
    };

    // pv0 -> /dev/sda2
    let mut pv_map: HashMap<String, String> = HashMap::new();
    if let Some(pvs) = vg.child("physical_volumes") {
        for (pv_name, pv) in &pvs.children {
            if let Some(device) = pv.text("device") {
                pv_map.insert(pv_name.clone(), device.to_string());
            }
        }
    }
    let mut pv_devices: Vec<String> = pv_map.values().cloned().collect();
    pv_devices.sort();

    let mut segments = Vec::new();
    if let Some(lvs) = vg.child("logical_volumes") {
        for (lv_name, lv) in &lvs.children {
            let logical = LogicalVolume {
                name: lv_name.clone(),
                writeable: lv.status_contains("WRITE"),
            };
            let segment_count = lv.number("segment_count").unwrap_or(0);

            for index in 1..=segment_count {
                let Some(seg) = lv.child(&format!("segment{index}")) else {
                    return Err(Error::parse(format!(
                        "LV {lv_name} lacks segment{index}"
                    )));
                };
                let extent_count = seg
                    .number("extent_count")
                    .ok_or_else(|| Error::parse("Segment lacks extent_count"))?;
                let stripe_count = seg.number("stripe_count").unwrap_or(1).max(1);
                let stripe_size = extent_count / stripe_count;

                let Some(Value::List(stripes)) = seg.values.get("stripes") else {
                    // Non-striped target types (mirrors, thin pools) are
                    // treated as fixed segments without PV coordinates.
                    continue;
                };

                for pair in stripes.chunks(2) {
                    let [pv_ref, offset] = pair else { continue };
                    let (Some(pv_name), Some(offset)) = (pv_ref.as_text(), offset.as_number())
                    else {
                        return Err(Error::parse("Malformed stripe list"));
                    };
                    let Some(device) = pv_map.get(pv_name) else {
                        return Err(Error::parse(format!("Unknown PV '{pv_name}'")));
                    };
                    segments.push(Segment {
                        logical: logical.clone(),
                        index: index as u32,
                        linear: stripe_count == 1,
                        last_in_logical: index == segment_count,
                        pv: device.clone(),
                        start_extents: offset,
                        end_extents: offset + stripe_size - 1,
                    });
                }
            }
        }
    }

    Ok(Config {
        group,
        pv_devices,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = r#"
# Generated by LVM2: some date
contents = "Text Format Volume Group"
version = 1

vg0 {
	id = "xxxx-yyyy"
	seqno = 4
	format = "lvm2"			# informational
	status = ["RESIZEABLE", "READ", "WRITE"]
	flags = []
	extent_size = 8192		# 4 Megabytes
	max_lv = 0
	max_pv = 0

	physical_volumes {

		pv0 {
			id = "aaaa-bbbb"
			device = "/dev/sda2"	# Hint only

			status = ["ALLOCATABLE"]
			flags = []
			dev_size = 41410560
			pe_start = 2048
			pe_count = 5054
		}
	}

	logical_volumes {

		swap {
			id = "cccc-dddd"
			status = ["READ", "WRITE", "VISIBLE"]
			flags = []
			segment_count = 1

			segment1 {
				start_extent = 0
				extent_count = 256

				type = "striped"
				stripe_count = 1	# linear

				stripes = [
					"pv0", 0
				]
			}
		}

		root {
			id = "eeee-ffff"
			status = ["READ", "WRITE", "VISIBLE"]
			flags = []
			segment_count = 2

			segment1 {
				start_extent = 0
				extent_count = 2048

				type = "striped"
				stripe_count = 1	# linear

				stripes = [
					"pv0", 256
				]
			}
			segment2 {
				start_extent = 2048
				extent_count = 750

				type = "striped"
				stripe_count = 1	# linear

				stripes = [
					"pv0", 2304
				]
			}
		}
	}
}
"#;

    #[test]
    fn group_attributes_are_read() {
        let config = parse(METADATA, "vg0").unwrap();
        assert_eq!(config.group.name, "vg0");
        assert_eq!(config.group.extent_size_sectors, 8192);
        assert!(config.group.resizeable);
        assert!(config.group.writeable);
    }

    #[test]
    fn pv_devices_are_mapped() {
        let config = parse(METADATA, "vg0").unwrap();
        assert_eq!(config.pv_devices, vec!["/dev/sda2".to_string()]);
        assert!(config.contains_device("/dev/sda2"));
        assert!(!config.contains_device("/dev/sda1"));
    }

    #[test]
    fn segments_carry_pv_coordinates() {
        let config = parse(METADATA, "vg0").unwrap();
        assert_eq!(config.segments.len(), 3);

        let pv = config.physical("/dev/sda2");
        let last = pv.last_segment().unwrap();
        assert_eq!(last.logical.name, "root");
        assert_eq!(last.index, 2);
        assert!(last.last_in_logical);
        assert!(last.linear);
        assert_eq!(last.start_extents, 2304);
        assert_eq!(last.end_extents, 2304 + 750 - 1);
        assert!(last.is_resizeable());
    }

    #[test]
    fn middle_segment_is_not_last() {
        let config = parse(METADATA, "vg0").unwrap();
        let root_first = config
            .segments
            .iter()
            .find(|s| s.logical.name == "root" && s.index == 1)
            .unwrap();
        assert!(!root_first.last_in_logical);
        assert!(!root_first.is_resizeable());
    }

    #[test]
    fn empty_vg_parses_without_segments() {
        let text = r#"
vg1 {
	status = ["RESIZEABLE", "READ", "WRITE"]
	extent_size = 8192

	physical_volumes {
		pv0 {
			device = "/dev/sda3"
			pe_count = 100
		}
	}
}
"#;
        let config = parse(text, "vg1").unwrap();
        assert!(config.segments.is_empty());
        assert!(config.contains_device("/dev/sda3"));
    }

    #[test]
    fn striped_segment_is_not_linear() {
        let text = r#"
vg2 {
	status = ["RESIZEABLE", "READ", "WRITE"]
	extent_size = 8192

	physical_volumes {
		pv0 {
			device = "/dev/sda2"
		}
		pv1 {
			device = "/dev/sdb1"
		}
	}

	logical_volumes {
		striped {
			status = ["READ", "WRITE", "VISIBLE"]
			segment_count = 1

			segment1 {
				start_extent = 0
				extent_count = 200
				type = "striped"
				stripe_count = 2
				stripes = [
					"pv0", 0,
					"pv1", 0
				]
			}
		}
	}
}
"#;
        let config = parse(text, "vg2").unwrap();
        // One row per stripe, each covering extent_count / stripe_count.
        assert_eq!(config.segments.len(), 2);
        for segment in &config.segments {
            assert!(!segment.linear);
            assert!(!segment.is_resizeable());
            assert_eq!(segment.size_extents(), 100);
        }
    }

    #[test]
    fn readonly_group_is_not_writeable() {
        let text = r#"
vg3 {
	status = ["READ"]
	extent_size = 4096
	physical_volumes {
		pv0 {
			device = "/dev/sda2"
		}
	}
}
"#;
        let config = parse(text, "vg3").unwrap();
        assert!(!config.group.writeable);
        assert!(!config.group.resizeable);
    }

    #[test]
    fn missing_group_is_an_error() {
        assert!(parse(METADATA, "other").is_err());
    }

    #[test]
    fn comments_inside_quotes_are_kept() {
        assert_eq!(strip_comment(r#"id = "a#b" # trailing"#), r#"id = "a#b" "#);
        assert_eq!(strip_comment("plain line"), "plain line");
    }
}
