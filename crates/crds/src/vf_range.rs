//! VF index ranges
//!
//! VF groups select their members with an inclusive index range written as
//! `"start-end"` or a single index.

use crate::error::CrdError;

/// Inclusive range of VF indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfRange {
    /// First index in the range
    pub start: u32,
    /// Last index in the range
    pub end: u32,
}

impl VfRange {
    /// Parses `"start-end"` or `"index"`.
    pub fn parse(raw: &str) -> Result<Self, CrdError> {
        let raw = raw.trim();
        let (start, end) = match raw.split_once('-') {
            Some((start, end)) => (parse_index(raw, start)?, parse_index(raw, end)?),
            None => {
                let index = parse_index(raw, raw)?;
                (index, index)
            }
        };

        if start > end {
            return Err(CrdError::InvalidVfRange(format!(
                "{}: start {} is after end {}",
                raw, start, end
            )));
        }

        Ok(Self { start, end })
    }

    /// Whether `index` falls inside the range.
    pub fn contains(&self, index: u32) -> bool {
        index >= self.start && index <= self.end
    }

    /// Whether the two ranges share at least one index.
    pub fn overlaps(&self, other: &VfRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

fn parse_index(raw: &str, part: &str) -> Result<u32, CrdError> {
    part.trim()
        .parse::<u32>()
        .map_err(|e| CrdError::InvalidVfRange(format!("{}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        let range = VfRange::parse("0-3").unwrap();
        assert_eq!(range, VfRange { start: 0, end: 3 });
        assert!(range.contains(0));
        assert!(range.contains(3));
        assert!(!range.contains(4));
    }

    #[test]
    fn test_parse_single_index() {
        let range = VfRange::parse("5").unwrap();
        assert_eq!(range, VfRange { start: 5, end: 5 });
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(VfRange::parse("a-3").is_err());
        assert!(VfRange::parse("4-2").is_err(), "Reversed ranges are invalid");
        assert!(VfRange::parse("").is_err());
    }

    #[test]
    fn test_overlaps() {
        let a = VfRange::parse("0-3").unwrap();
        assert!(a.overlaps(&VfRange::parse("3-5").unwrap()));
        assert!(!a.overlaps(&VfRange::parse("4-7").unwrap()));
    }
}
