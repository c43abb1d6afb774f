//! Shared report vocabulary: reasons, directions, sides, summary counters.

use std::fmt;

/// Which deployment a finding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Source,
    Target,
}

impl Location {
    pub fn as_str(self) -> &'static str {
        match self {
            Location::Source => "source",
            Location::Target => "target",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side a sample batch was drawn from.
///
/// A `SrcToTgt` batch was sampled on the source; `missing` then means missing
/// on the target, and `different` means the source disagrees with the target.
/// Symmetric for `TgtToSrc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SrcToTgt,
    TgtToSrc,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::SrcToTgt => "src -> dst",
            Direction::TgtToSrc => "dst -> src",
        }
    }

    /// Field-name-safe form, used for per-direction summary counters.
    pub fn key(self) -> &'static str {
        match self {
            Direction::SrcToTgt => "srcToDst",
            Direction::TgtToSrc => "dstToSrc",
        }
    }

    /// The side a document sampled in this direction can be missing from.
    pub fn missing_from(self) -> Location {
        match self {
            Direction::SrcToTgt => Location::Target,
            Direction::TgtToSrc => Location::Source,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a report exists. Every persisted report carries one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NamespaceMissing,
    NamespaceMismatch,
    CountMismatch,
    IndexMissing,
    IndexMismatch,
    DocMissing,
    DocMismatch,
    CollSampleSummary,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::NamespaceMissing => "namespaceMissing",
            Reason::NamespaceMismatch => "namespaceMismatch",
            Reason::CountMismatch => "countMismatch",
            Reason::IndexMissing => "indexMissing",
            Reason::IndexMismatch => "indexMismatch",
            Reason::DocMissing => "docMissing",
            Reason::DocMismatch => "docMismatch",
            Reason::CollSampleSummary => "collSampleSummary",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-batch outcome counters for the sample pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocSummary {
    pub equal: i64,
    pub different: i64,
    pub missing: i64,
}

impl DocSummary {
    pub fn has_mismatches(&self) -> bool {
        self.different > 0 || self.missing > 0
    }

    pub fn total(&self) -> i64 {
        self.equal + self.different + self.missing
    }
}
