use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Inclusive byte span `[start, end]` of a remote file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Marker for "no partition": fetch the whole (possibly empty) body.
    pub const SENTINEL: ByteRange = ByteRange { start: 0, end: 0 };

    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn try_new(start: u64, end: u64) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::InvalidRange(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        segment_size(self)
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::SENTINEL
    }

    /// Value for the HTTP `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for ByteRange {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (start, end) = value
            .trim()
            .split_once('-')
            .ok_or_else(|| CoreError::InvalidRange(value.to_string()))?;
        let start = start
            .trim()
            .parse::<u64>()
            .map_err(|err| CoreError::InvalidRange(format!("{}: {}", value, err)))?;
        let end = end
            .trim()
            .parse::<u64>()
            .map_err(|err| CoreError::InvalidRange(format!("{}: {}", value, err)))?;
        ByteRange::try_new(start, end)
    }
}

/// One entry per worker; `None` means fetch without a `Range` header.
pub type RangePlan = Vec<Option<ByteRange>>;

/// Splits `size` bytes into consecutive ranges of `part_size` bytes. The
/// last range always ends on `size - 1`, so there are `ceil(size / part_size)`
/// parts and the last one may be short.
pub fn split(size: u64, part_size: u64) -> Vec<ByteRange> {
    if size == 0 {
        return vec![ByteRange::SENTINEL];
    }

    let span = part_size.max(1).min(size);
    let last = size - 1;

    let mut ranges = Vec::with_capacity(size.div_ceil(span) as usize);
    let mut start = 0u64;
    while start <= last {
        let end = start.saturating_add(span - 1).min(last);
        ranges.push(ByteRange::new(start, end));
        if end == last {
            break;
        }
        start = end + 1;
    }

    ranges
}

/// Partitions a file for at most `max_connections` workers. Segment count is
/// `min(max(file_size / segment_size, 1), max_connections)`; the final range
/// absorbs the integer-division remainder.
pub fn plan(file_size: u64, segment_size: u64, max_connections: u32) -> RangePlan {
    if file_size == 0 {
        return vec![None];
    }

    let max_segments = (file_size / segment_size.max(1)).max(1);
    let segment_count = max_segments.min(u64::from(max_connections.max(1)));
    let per_segment = file_size / segment_count;

    let mut ranges = Vec::with_capacity(segment_count as usize);
    for index in 0..segment_count {
        let start = index * per_segment;
        let end = if index == segment_count - 1 {
            file_size - 1
        } else {
            start + per_segment - 1
        };
        ranges.push(Some(ByteRange::new(start, end)));
    }

    ranges
}

/// Byte count covered by `range`; 0 for the sentinel or a reversed pair.
pub fn segment_size(range: &ByteRange) -> u64 {
    if range.end > 0 && range.end >= range.start {
        range.end - range.start + 1
    } else {
        0
    }
}

/// Like [`segment_size`] for the textual `start-end` form. Anything that
/// does not parse counts as 0 so progress displays never fail.
pub fn segment_size_str(value: &str) -> u64 {
    let Some((start, end)) = value.trim().split_once('-') else {
        return 0;
    };
    match (start.trim().parse::<u64>(), end.trim().parse::<u64>()) {
        (Ok(start), Ok(end)) => segment_size(&ByteRange::new(start, end)),
        _ => 0,
    }
}
