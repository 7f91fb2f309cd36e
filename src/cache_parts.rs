//! Covered Ranges Module
//! A cache file only holds downloaded bytes, packed in ascending logical order.
//! `CacheParts` is the list of logical ranges those bytes stand for; the byte at
//! physical offset k is the k-th byte across the list taken in order.
//!
//! Everything here is arithmetic over that list. Nothing touches the disk, so
//! the store can plan an insert first and only then shift bytes around.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use thiserror::Error;

/// An inclusive logical byte range held in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePart {
    pub start: u64,
    pub end: u64,
}

impl CachePart {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos <= self.end
    }
}

/// Answer to "can the byte at `start` come from the cache?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    Cached,
    /// Bytes to fetch from the origin before cached data resumes
    Missing(u64),
}

/// Where to read a logical range inside the packed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSpan {
    pub skip: u64,
    pub len: u64,
}

/// Result of planning an insert: the ranges after the insert, the physical
/// offset the new bytes go to, and which slice of the caller's data to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPlan {
    pub parts: CacheParts,
    pub skip: u64,
    pub data: Range<usize>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    #[error("Nothing to insert")]
    Empty,
    #[error("Cache file holds {physical} bytes but the index accounts for {indexed}")]
    Inconsistent { physical: u64, indexed: u64 },
    #[error("Range {start}-{end} conflicts with cached ranges [{parts}]")]
    Conflict { start: u64, end: u64, parts: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed cache ranges {0:?}")]
pub struct ParsePartsError(String);

/// Sorted, disjoint, non-adjacent covered ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheParts(Vec<CachePart>);

impl CacheParts {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn as_slice(&self) -> &[CachePart] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bytes the packed file should hold.
    pub fn cached_len(&self) -> u64 {
        self.0.iter().map(CachePart::len).sum()
    }

    pub fn need_download(&self, start: u64, file_size: u64) -> Coverage {
        for part in &self.0 {
            if start < part.start {
                return Coverage::Missing(part.start - start);
            } else if start <= part.end {
                return Coverage::Cached;
            }
        }
        Coverage::Missing(file_size.saturating_sub(start))
    }

    /// Physical span for reading up to `max_len` bytes at `start`, clamped at
    /// the end of the covering range. `None` if `start` isn't cached.
    pub fn locate(&self, start: u64, max_len: u64) -> Option<ReadSpan> {
        let mut skip = 0;
        for part in &self.0 {
            if part.contains(start) {
                return Some(ReadSpan {
                    skip: skip + start - part.start,
                    len: max_len.min(part.end - start + 1),
                });
            }
            skip += part.len();
        }
        None
    }

    /// How far the cache reaches past the byte at `play_progress`, as a
    /// fraction of the file.
    pub fn buffering_progress(&self, play_progress: f32, file_size: u64) -> f32 {
        if file_size == 0 {
            return 0.0;
        }
        let pos = (f64::from(play_progress) * file_size as f64) as u64;
        self.0
            .iter()
            .find(|part| part.contains(pos))
            .map_or(0.0, |part| (part.end + 1) as f32 / file_size as f32)
    }

    /// Plan merging `len` bytes at logical `start` into a packed file that is
    /// currently `physical_len` bytes long.
    ///
    /// A range that runs into the first cached range from either side is
    /// clipped to its uncached part. That happens when a prefetch and live
    /// playback both fill the head of a file. Any other overlap is a conflict.
    pub fn plan_insert(
        &self,
        physical_len: u64,
        file_size: Option<u64>,
        start: u64,
        len: u64,
    ) -> Result<InsertPlan, InsertError> {
        if len == 0 {
            return Err(InsertError::Empty);
        }
        let indexed = self.cached_len();
        if indexed != physical_len {
            return Err(InsertError::Inconsistent {
                physical: physical_len,
                indexed,
            });
        }

        let (mut begin, mut end) = (start, start + len - 1);
        loop {
            if let Some((parts, skip)) = self.place(begin, end, file_size) {
                let offset = (begin - start) as usize;
                return Ok(InsertPlan {
                    parts,
                    skip,
                    data: offset..offset + (end - begin + 1) as usize,
                });
            }
            match self.clip_to_first(begin, end) {
                Some(clipped) => (begin, end) = clipped,
                None => {
                    return Err(InsertError::Conflict {
                        start,
                        end: start + len - 1,
                        parts: self.to_string(),
                    })
                }
            }
        }
    }

    fn clip_to_first(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        let first = self.0.first()?;
        if first.contains(start) && end > first.end {
            Some((first.end + 1, end))
        } else if start < first.start && first.contains(end) {
            Some((start, first.start - 1))
        } else {
            None
        }
    }

    /// Slot `[start, end]` into a gap, coalescing with neighbours. Returns the
    /// new list and the physical offset of `start`.
    fn place(&self, start: u64, end: u64, file_size: Option<u64>) -> Option<(CacheParts, u64)> {
        if file_size.is_some_and(|size| end >= size) {
            return None;
        }
        let mut parts = self.0.clone();
        let Some(&first) = parts.first() else {
            return Some((CacheParts(vec![CachePart::new(start, end)]), 0));
        };

        if end < first.start {
            if end + 1 == first.start {
                parts[0].start = start;
            } else {
                parts.insert(0, CachePart::new(start, end));
            }
            return Some((CacheParts(parts), 0));
        }

        let mut skip = 0;
        for i in 0..parts.len() - 1 {
            skip += parts[i].len();
            let (prev, next) = (parts[i], parts[i + 1]);
            if start > prev.end && end < next.start {
                match (start == prev.end + 1, end + 1 == next.start) {
                    (true, true) => {
                        parts[i].end = next.end;
                        parts.remove(i + 1);
                    }
                    (true, false) => parts[i].end = end,
                    (false, true) => parts[i + 1].start = start,
                    (false, false) => parts.insert(i + 1, CachePart::new(start, end)),
                }
                return Some((CacheParts(parts), skip));
            }
        }

        let last = parts.len() - 1;
        if start > parts[last].end {
            if start == parts[last].end + 1 {
                parts[last].end = end;
            } else {
                parts.push(CachePart::new(start, end));
            }
            return Some((CacheParts(parts), self.cached_len()));
        }
        None
    }
}

impl FromStr for CacheParts {
    type Err = ParsePartsError;

    /// Parses the `start-end,start-end` form kept in the index.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<CachePart> = Vec::new();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let part = token
                .split_once('-')
                .and_then(|(start, end)| Some(CachePart::new(start.parse().ok()?, end.parse().ok()?)))
                .filter(|part| part.start <= part.end)
                .ok_or_else(|| ParsePartsError(s.to_string()))?;
            if parts.last().is_some_and(|prev| prev.end + 1 >= part.start) {
                return Err(ParsePartsError(s.to_string()));
            }
            parts.push(part);
        }
        Ok(CacheParts(parts))
    }
}

impl fmt::Display for CacheParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}-{}", part.start, part.end)?;
        }
        Ok(())
    }
}
