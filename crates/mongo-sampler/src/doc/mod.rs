//! Unordered field-wise document comparison.
//!
//! Field order is immaterial at every nesting level; arrays are compared
//! positionally. Numeric equality follows one rule, applied recursively:
//! `Int32`, `Int64`, and `Double` values are equal when they represent the
//! same mathematical value (matching the server's cross-type comparison for
//! these types), `Decimal128` compares only against `Decimal128` by
//! representation, and every other BSON type uses the codec's value equality.

use bson::{Bson, Document};

/// One field present on both sides with different values.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    /// Dotted path to the field; array elements appear by index.
    pub path: String,
    pub source: Bson,
    pub target: Bson,
}

/// Field-level differences between two documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocDiff {
    /// Field paths present only on the target.
    pub missing_on_src: Vec<String>,
    /// Field paths present only on the source.
    pub missing_on_tgt: Vec<String>,
    /// Fields present on both sides with differing values.
    pub different: Vec<FieldDiff>,
}

impl DocDiff {
    fn is_empty(&self) -> bool {
        self.missing_on_src.is_empty()
            && self.missing_on_tgt.is_empty()
            && self.different.is_empty()
    }
}

/// Compare two documents without regard to field order.
///
/// Returns `None` when the documents are equivalent, otherwise the full
/// field-level classification.
pub fn compare(source: &Document, target: &Document) -> Option<DocDiff> {
    let mut details = DocDiff::default();
    compare_into(source, target, "", &mut details);
    if details.is_empty() {
        None
    } else {
        Some(details)
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn compare_into(source: &Document, target: &Document, prefix: &str, details: &mut DocDiff) {
    for (key, src_value) in source {
        let path = join_path(prefix, key);
        match target.get(key) {
            None => details.missing_on_tgt.push(path),
            Some(tgt_value) => compare_values(src_value, tgt_value, &path, details),
        }
    }
    for key in target.keys() {
        if !source.contains_key(key) {
            details.missing_on_src.push(join_path(prefix, key));
        }
    }
}

fn compare_values(source: &Bson, target: &Bson, path: &str, details: &mut DocDiff) {
    match (source, target) {
        (Bson::Document(src), Bson::Document(tgt)) => compare_into(src, tgt, path, details),
        (Bson::Array(src), Bson::Array(tgt)) => {
            for (idx, src_value) in src.iter().enumerate() {
                let elem_path = join_path(path, &idx.to_string());
                match tgt.get(idx) {
                    None => details.missing_on_tgt.push(elem_path),
                    Some(tgt_value) => compare_values(src_value, tgt_value, &elem_path, details),
                }
            }
            for idx in src.len()..tgt.len() {
                details.missing_on_src.push(join_path(path, &idx.to_string()));
            }
        }
        _ => {
            if !scalars_equal(source, target) {
                details.different.push(FieldDiff {
                    path: path.to_string(),
                    source: source.clone(),
                    target: target.clone(),
                });
            }
        }
    }
}

/// Scalar equality with cross-type numeric semantics for Int32/Int64/Double.
fn scalars_equal(a: &Bson, b: &Bson) -> bool {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x == y,
        (None, None) => a == b,
        _ => false,
    }
}

/// Widen Int32/Int64/Double to a comparable form. Integers that a double
/// cannot represent exactly stay exact through the i64 arm.
fn numeric(value: &Bson) -> Option<Numeric> {
    match value {
        Bson::Int32(v) => Some(Numeric::Int(i64::from(*v))),
        Bson::Int64(v) => Some(Numeric::Int(*v)),
        Bson::Double(v) => Some(Numeric::Float(*v)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl PartialEq for Numeric {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => a == b,
            (Numeric::Float(a), Numeric::Float(b)) => a == b,
            (Numeric::Int(i), Numeric::Float(f)) | (Numeric::Float(f), Numeric::Int(i)) => {
                // equal only when the double is integral and converts to i64
                // without loss; the upper bound is strict because 2^63 itself
                // is representable as f64 but not as i64
                f.fract() == 0.0
                    && *f >= -9_223_372_036_854_775_808.0
                    && *f < 9_223_372_036_854_775_808.0
                    && *f as i64 == *i
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_document_equals_itself() {
        let d = doc! { "a": 1, "b": { "c": [1, 2, 3] }, "d": "x" };
        assert_eq!(compare(&d, &d), None);
    }

    #[test]
    fn test_field_order_is_immaterial() {
        let a = doc! { "x": 1, "y": { "p": true, "q": "s" } };
        let b = doc! { "y": { "q": "s", "p": true }, "x": 1 };
        assert_eq!(compare(&a, &b), None);
    }

    #[test]
    fn test_missing_fields_both_directions() {
        let a = doc! { "shared": 1, "only_src": 2 };
        let b = doc! { "shared": 1, "only_tgt": 3 };
        let details = compare(&a, &b).unwrap();
        assert_eq!(details.missing_on_tgt, ["only_src"]);
        assert_eq!(details.missing_on_src, ["only_tgt"]);
        assert!(details.different.is_empty());
    }

    #[test]
    fn test_different_scalar_reports_path_and_values() {
        let a = doc! { "user": { "email": "a@x" } };
        let b = doc! { "user": { "email": "b@x" } };
        let details = compare(&a, &b).unwrap();
        assert_eq!(details.different.len(), 1);
        assert_eq!(details.different[0].path, "user.email");
        assert_eq!(details.different[0].source, Bson::String("a@x".into()));
        assert_eq!(details.different[0].target, Bson::String("b@x".into()));
    }

    #[test]
    fn test_arrays_compare_positionally() {
        let a = doc! { "tags": ["x", "y"] };
        let b = doc! { "tags": ["y", "x"] };
        let details = compare(&a, &b).unwrap();
        assert_eq!(details.different.len(), 2);
        assert_eq!(details.different[0].path, "tags.0");
        assert_eq!(details.different[1].path, "tags.1");
    }

    #[test]
    fn test_array_length_mismatch() {
        let a = doc! { "tags": ["x"] };
        let b = doc! { "tags": ["x", "y", "z"] };
        let details = compare(&a, &b).unwrap();
        assert_eq!(details.missing_on_src, ["tags.1", "tags.2"]);
    }

    #[test]
    fn test_numeric_types_compare_by_value() {
        let a = doc! { "n": 5_i32, "m": 7_i64, "f": 2.0 };
        let b = doc! { "n": 5_i64, "m": 7.0, "f": 2_i32 };
        assert_eq!(compare(&a, &b), None);
    }

    #[test]
    fn test_numeric_values_still_differ() {
        let a = doc! { "n": 5_i32 };
        let b = doc! { "n": 5.5 };
        let details = compare(&a, &b).unwrap();
        assert_eq!(details.different[0].path, "n");
    }

    #[test]
    fn test_large_int_not_equal_to_nearby_double() {
        // 2^63 - 1 is not representable as f64; the nearest double is 2^63
        let a = doc! { "n": i64::MAX };
        let b = doc! { "n": i64::MAX as f64 };
        assert!(compare(&a, &b).is_some());
    }

    #[test]
    fn test_numeric_does_not_cross_into_strings() {
        let a = doc! { "n": 5_i32 };
        let b = doc! { "n": "5" };
        assert!(compare(&a, &b).is_some());
    }

    #[test]
    fn test_nested_permutation_at_depth() {
        let a = doc! { "o": { "arr": [ { "k": 1, "l": 2 } ] } };
        let b = doc! { "o": { "arr": [ { "l": 2, "k": 1 } ] } };
        assert_eq!(compare(&a, &b), None);
    }

    #[test]
    fn test_null_and_absent_are_distinct() {
        let a = doc! { "v": Bson::Null };
        let b = doc! {};
        let details = compare(&a, &b).unwrap();
        assert_eq!(details.missing_on_tgt, ["v"]);
    }
}
