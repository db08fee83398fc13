use regex::Regex;
use std::collections::HashMap;
use std::io::BufRead;

use super::types::{MemoryRegion, Perms};
use crate::error::{CoreError, Result};

/// Parser for the `/proc/<pid>/smaps` format.
///
/// A header line opens a region, every following `key: value` row up to the
/// next header belongs to it. Regions come out in file order, which the
/// kernel emits by ascending address.
pub struct SmapsParser {
    header: Regex,
}

impl SmapsParser {
    pub fn new() -> Self {
        let header = Regex::new(
            r"^(?:0x)?([0-9a-f]+)-(?:0x)?([0-9a-f]+) ([-r][-w][-x][-sp]) ([0-9a-f]+) ([0-9a-f]+:[0-9a-f]+) ([0-9]+)(?:\s+(.*))?$",
        )
        .expect("Failed to compile smaps header regex");

        SmapsParser { header }
    }

    pub fn parse<R: BufRead>(&self, reader: R) -> Result<Vec<MemoryRegion>> {
        let mut regions = Vec::new();
        let mut current: Option<MemoryRegion> = None;

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = index + 1;
            if line.trim().is_empty() {
                continue;
            }

            if let Some(region) = self.parse_header(&line, line_no)? {
                regions.extend(current.replace(region));
                continue;
            }

            let region = current.as_mut().ok_or_else(|| corrupt(line_no, "attribute before any header"))?;
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| corrupt(line_no, format!("unrecognized line {line:?}")))?;

            let key = key.trim().to_lowercase();
            if region.attributes.contains_key(&key) {
                return Err(corrupt(line_no, format!("duplicate key {key:?}")));
            }
            region.attributes.insert(key, value.trim().to_lowercase());
        }

        regions.extend(current);
        Ok(regions)
    }

    fn parse_header(&self, line: &str, line_no: usize) -> Result<Option<MemoryRegion>> {
        let Some(caps) = self.header.captures(line) else {
            return Ok(None);
        };

        let hex = |i: usize| {
            u64::from_str_radix(&caps[i], 16).map_err(|e| corrupt(line_no, e.to_string()))
        };
        let start = hex(1)?;
        let end = hex(2)?;
        let offset = hex(4)?;
        let inode = caps[6]
            .parse::<u64>()
            .map_err(|e| corrupt(line_no, e.to_string()))?;

        if start >= end {
            return Err(corrupt(line_no, format!("empty range {start:#x}-{end:#x}")));
        }

        Ok(Some(MemoryRegion {
            start,
            end,
            perms: Perms::from_column(&caps[3]),
            offset,
            device: caps[5].to_string(),
            inode,
            pathname: caps.get(7).map_or("", |m| m.as_str().trim()).to_string(),
            attributes: HashMap::new(),
        }))
    }
}

impl Default for SmapsParser {
    fn default() -> Self {
        Self::new()
    }
}

fn corrupt(line: usize, reason: impl Into<String>) -> CoreError {
    CoreError::Smaps {
        line,
        reason: reason.into(),
    }
}
