//! Generic sorted-merge diff walker.
//!
//! Namespace and index comparison both reduce to the same problem: two
//! name-sorted catalogs, classify every entry as equal, missing on one side,
//! or present on both and different. The walker here is the single source of
//! truth for that classification.

use std::fmt;
use tracing::trace;

/// Capability interface for entries the walker can classify.
///
/// Implementors expose a sort key and a content-equality check; the walker
/// never inspects the underlying value any other way.
pub trait NamedComparable {
    /// Sort key, also used for the deterministic tie-break.
    fn name(&self) -> &str;

    /// Content equality for two entries that share a name.
    fn matches(&self, other: &Self) -> bool;
}

/// A source/target pair that shares a name but differs in content.
#[derive(Debug, Clone)]
pub struct DiffPair<T> {
    pub source: T,
    pub target: T,
}

/// Classification of two sorted catalogs.
#[derive(Debug, Clone)]
pub struct DiffResult<T> {
    pub equal: Vec<T>,
    pub missing_on_src: Vec<T>,
    pub missing_on_tgt: Vec<T>,
    pub different: Vec<DiffPair<T>>,
}

impl<T> Default for DiffResult<T> {
    fn default() -> Self {
        Self {
            equal: Vec::new(),
            missing_on_src: Vec::new(),
            missing_on_tgt: Vec::new(),
            different: Vec::new(),
        }
    }
}

impl<T: NamedComparable> DiffResult<T> {
    /// True when anything other than `equal` is non-empty.
    pub fn has_mismatches(&self) -> bool {
        !self.missing_on_src.is_empty()
            || !self.missing_on_tgt.is_empty()
            || !self.different.is_empty()
    }
}

impl<T: NamedComparable> fmt::Display for DiffResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ missingOnSrc: [")?;
        for each in &self.missing_on_src {
            write!(f, " {}", each.name())?;
        }
        write!(f, " ], missingOnTgt: [")?;
        for each in &self.missing_on_tgt {
            write!(f, " {}", each.name())?;
        }
        write!(f, " ], different: [")?;
        for each in &self.different {
            write!(f, " src:{}|tgt:{}", each.source.name(), each.target.name())?;
        }
        write!(f, " ], equal: [")?;
        for each in &self.equal {
            write!(f, " {}", each.name())?;
        }
        write!(f, " ] }}")
    }
}

/// Stable sort by `name()` ascending, the order [`diff`] requires.
pub fn sort_by_name<T: NamedComparable>(mut entries: Vec<T>) -> Vec<T> {
    entries.sort_by(|a, b| a.name().cmp(b.name()));
    entries
}

/// Walk two name-sorted catalogs, classifying every entry.
///
/// Linear in `|source| + |target|`. Both inputs must already be sorted by
/// `name()` ascending (see [`sort_by_name`]). Duplicate names are treated as
/// successive independent entries: the first pair meets in the equal-names
/// arm, any surplus falls through as missing on the other side.
pub fn diff<T: NamedComparable + Clone>(source: &[T], target: &[T]) -> DiffResult<T> {
    let mut result = DiffResult::default();
    let (src_len, tgt_len) = (source.len(), target.len());
    trace!(src_len, tgt_len, "walking catalogs");

    let (mut i, mut j) = (0, 0);
    while i < src_len || j < tgt_len {
        if i >= src_len {
            result.missing_on_src.push(target[j].clone());
            j += 1;
            continue;
        }
        if j >= tgt_len {
            result.missing_on_tgt.push(source[i].clone());
            i += 1;
            continue;
        }

        let (src_name, tgt_name) = (source[i].name(), target[j].name());
        match src_name.cmp(tgt_name) {
            std::cmp::Ordering::Greater => {
                trace!(name = tgt_name, "missing on source");
                result.missing_on_src.push(target[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Less => {
                trace!(name = src_name, "missing on target");
                result.missing_on_tgt.push(source[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Equal => {
                if source[i].matches(&target[j]) {
                    result.equal.push(source[i].clone());
                } else {
                    trace!(name = src_name, "present on both sides but different");
                    result.different.push(DiffPair {
                        source: source[i].clone(),
                        target: target[j].clone(),
                    });
                }
                i += 1;
                j += 1;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry {
        name: &'static str,
        content: u32,
    }

    impl Entry {
        fn new(name: &'static str, content: u32) -> Self {
            Self { name, content }
        }
    }

    impl NamedComparable for Entry {
        fn name(&self) -> &str {
            self.name
        }

        fn matches(&self, other: &Self) -> bool {
            self.content == other.content
        }
    }

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.name).collect()
    }

    // every input entry is classified exactly once:
    // 2|equal| + 2|different| + |missingOnSrc| + |missingOnTgt| = |S| + |T|
    fn assert_conservation(result: &DiffResult<Entry>, src_len: usize, tgt_len: usize) {
        assert_eq!(
            result.equal.len()
                + result.different.len()
                + result.missing_on_src.len()
                + result.missing_on_tgt.len(),
            src_len + tgt_len - result.equal.len() - result.different.len(),
        );
    }

    #[test]
    fn test_identical_catalogs() {
        let src = vec![Entry::new("a", 1), Entry::new("b", 2)];
        let tgt = src.clone();
        let result = diff(&src, &tgt);
        assert_eq!(names(&result.equal), ["a", "b"]);
        assert!(!result.has_mismatches());
        assert_conservation(&result, 2, 2);
    }

    #[test]
    fn test_empty_source() {
        let tgt = vec![Entry::new("a", 1), Entry::new("b", 2)];
        let result = diff(&[], &tgt);
        assert_eq!(names(&result.missing_on_src), ["a", "b"]);
        assert!(result.equal.is_empty());
        assert!(result.missing_on_tgt.is_empty());
        assert_conservation(&result, 0, 2);
    }

    #[test]
    fn test_empty_target() {
        let src = vec![Entry::new("a", 1)];
        let result = diff(&src, &[]);
        assert_eq!(names(&result.missing_on_tgt), ["a"]);
        assert_conservation(&result, 1, 0);
    }

    #[test]
    fn test_interleaved_missing() {
        let src = vec![Entry::new("a", 1), Entry::new("c", 3), Entry::new("e", 5)];
        let tgt = vec![Entry::new("b", 2), Entry::new("c", 3), Entry::new("d", 4)];
        let result = diff(&src, &tgt);
        assert_eq!(names(&result.equal), ["c"]);
        assert_eq!(names(&result.missing_on_src), ["b", "d"]);
        assert_eq!(names(&result.missing_on_tgt), ["a", "e"]);
        assert_conservation(&result, 3, 3);
    }

    #[test]
    fn test_same_name_different_content() {
        let src = vec![Entry::new("a", 1)];
        let tgt = vec![Entry::new("a", 9)];
        let result = diff(&src, &tgt);
        assert!(result.equal.is_empty());
        assert_eq!(result.different.len(), 1);
        assert_eq!(result.different[0].source.content, 1);
        assert_eq!(result.different[0].target.content, 9);
        assert!(result.has_mismatches());
    }

    #[test]
    fn test_duplicate_names_fall_through() {
        // the first pair meets in the equal-names arm, the surplus entry is
        // classified missing on the other side
        let src = vec![Entry::new("a", 1), Entry::new("a", 1)];
        let tgt = vec![Entry::new("a", 1)];
        let result = diff(&src, &tgt);
        assert_eq!(names(&result.equal), ["a"]);
        assert_eq!(names(&result.missing_on_tgt), ["a"]);
        assert_conservation(&result, 2, 1);
    }

    #[test]
    fn test_sort_by_name_is_stable() {
        let entries = vec![Entry::new("b", 1), Entry::new("a", 2), Entry::new("b", 3)];
        let sorted = sort_by_name(entries);
        assert_eq!(names(&sorted), ["a", "b", "b"]);
        assert_eq!(sorted[1].content, 1);
        assert_eq!(sorted[2].content, 3);
    }

    #[test]
    fn test_display() {
        let src = vec![Entry::new("a", 1)];
        let tgt = vec![Entry::new("b", 2)];
        let rendered = diff(&src, &tgt).to_string();
        assert!(rendered.contains("missingOnSrc: [ b ]"));
        assert!(rendered.contains("missingOnTgt: [ a ]"));
    }
}
