//! Small shared helpers: source/target pairs, namespace tokens, Cochran's
//! sample size.

use crate::error::{Result, SamplerError};

/// A value measured independently on the source and the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pair<T> {
    pub source: T,
    pub target: T,
}

impl<T> Pair<T> {
    pub fn new(source: T, target: T) -> Self {
        Self { source, target }
    }
}

/// Split a `db.coll` token into its database and collection parts.
///
/// Only the first dot separates the database; collection names may themselves
/// contain dots.
pub fn split_namespace(ns: &str) -> Result<(&str, &str)> {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok((db, coll)),
        _ => Err(SamplerError::MalformedNamespace(ns.to_string())),
    }
}

/// Cochran's sample size with finite-population correction.
///
/// ```text
/// n0 = z^2 * p * (1 - p) / e^2        with p = 0.5
/// n  = round( n0 / (1 + n0 / N) )
/// ```
///
/// The result is always at most `population`; the 4% ceiling applied on top
/// of this lives with the caller, where the estimated counts are known.
pub fn sample_size(population: u64, zscore: f64, error_rate: f64) -> u64 {
    const PROPORTION: f64 = 0.5;

    if population == 0 {
        return 0;
    }
    let n0 = (zscore.powi(2) * PROPORTION * (1.0 - PROPORTION)) / error_rate.powi(2);
    let n = n0 / (1.0 + n0 / population as f64);
    n.round() as u64
}

/// Strip a single trailing slash from a path-like string.
pub fn clean_path(path: &str) -> &str {
    path.strip_suffix('/').unwrap_or(path)
}
