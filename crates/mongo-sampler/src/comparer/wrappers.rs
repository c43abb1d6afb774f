//! Adapters that give namespaces and index specifications the diff walker's
//! capability interface.

use bson::Document;

use crate::diff::NamedComparable;
use crate::error::Result;
use crate::ns::Namespace;

/// A namespace under its qualified name, for sorting and diffing catalogs.
#[derive(Debug, Clone)]
pub(crate) struct NsEntry {
    name: String,
    pub(crate) ns: Namespace,
}

impl NamedComparable for NsEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, other: &Self) -> bool {
        self.ns.spec.matches(&other.ns.spec)
    }
}

pub(crate) fn wrap_namespaces(namespaces: Vec<Namespace>) -> Vec<NsEntry> {
    namespaces
        .into_iter()
        .map(|ns| NsEntry {
            name: ns.to_string(),
            ns,
        })
        .collect()
}

/// An index under its name, carrying the raw specification. Equality is
/// byte-equality of the encoded form.
#[derive(Debug, Clone)]
pub(crate) struct IndexSpec {
    name: String,
    raw: Vec<u8>,
    pub(crate) spec: Document,
}

impl IndexSpec {
    pub(crate) fn new(spec: Document) -> Result<Self> {
        let name = spec.get_str("name").unwrap_or_default().to_string();
        let raw = bson::to_vec(&spec)?;
        Ok(Self { name, raw, spec })
    }
}

impl NamedComparable for IndexSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::sort_by_name;
    use bson::doc;

    #[test]
    fn test_index_sort_already_in_order() {
        let a = IndexSpec::new(doc! { "name": "a_1", "key": { "a": 1 } }).unwrap();
        let b = IndexSpec::new(doc! { "name": "b_1", "key": { "b": 1 } }).unwrap();
        let sorted = sort_by_name(vec![a.clone(), b.clone()]);
        assert_eq!(sorted[0].name(), "a_1");
        assert_eq!(sorted[1].name(), "b_1");
    }

    #[test]
    fn test_index_sort_reorders_by_name() {
        let a = IndexSpec::new(doc! { "name": "a_1", "key": { "a": 1 } }).unwrap();
        let b = IndexSpec::new(doc! { "name": "b_1", "key": { "b": 1 } }).unwrap();
        let sorted = sort_by_name(vec![b, a]);
        assert_eq!(sorted[0].name(), "a_1");
        assert_eq!(sorted[1].name(), "b_1");
    }

    #[test]
    fn test_index_equality_is_byte_equality_of_the_raw_spec() {
        let plain = IndexSpec::new(doc! { "name": "email_1", "key": { "email": 1 } }).unwrap();
        let same = IndexSpec::new(doc! { "name": "email_1", "key": { "email": 1 } }).unwrap();
        let unique =
            IndexSpec::new(doc! { "name": "email_1", "key": { "email": 1 }, "unique": true })
                .unwrap();
        assert!(plain.matches(&same));
        assert!(!plain.matches(&unique));
    }

    #[test]
    fn test_index_without_name_sorts_first() {
        let unnamed = IndexSpec::new(doc! { "key": { "x": 1 } }).unwrap();
        let named = IndexSpec::new(doc! { "name": "x_1", "key": { "x": 1 } }).unwrap();
        let sorted = sort_by_name(vec![named, unnamed]);
        assert_eq!(sorted[0].name(), "");
    }
}
