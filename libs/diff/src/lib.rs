//! Snapshot partitioning primitives.
//!
//! A reconciliation pass works from two keyed snapshots: the map that
//! was last applied and the map that was just loaded. [`partition`]
//! splits the key space into the three groups a merge has to handle:
//!
//! - **removed**: present in the previous snapshot only
//! - **common**: present in both (the caller decides whether the value
//!   materially changed)
//! - **added**: present in the new snapshot only
//!
//! # Invariants
//!
//! - Every key of either snapshot lands in exactly one group
//! - Group order is the key order of the underlying `BTreeMap`s, so a
//!   merge applies changes deterministically given the same inputs

use std::collections::BTreeMap;

/// The three-way split of two keyed snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Partition<K> {
    /// Keys present in the previous snapshot but not the new one.
    pub removed: Vec<K>,
    /// Keys present in both snapshots.
    pub common: Vec<K>,
    /// Keys present in the new snapshot but not the previous one.
    pub added: Vec<K>,
}

impl<K> Partition<K> {
    /// Returns true if the two snapshots covered the same key space.
    pub fn same_keys(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Partition the keys of two snapshots into removed / common / added.
pub fn partition<K, V, W>(previous: &BTreeMap<K, V>, next: &BTreeMap<K, W>) -> Partition<K>
where
    K: Ord + Clone,
{
    let mut split = Partition {
        removed: Vec::new(),
        common: Vec::new(),
        added: Vec::new(),
    };

    for key in previous.keys() {
        if next.contains_key(key) {
            split.common.push(key.clone());
        } else {
            split.removed.push(key.clone());
        }
    }

    for key in next.keys() {
        if !previous.contains_key(key) {
            split.added.push(key.clone());
        }
    }

    split
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, i32)]) -> BTreeMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_partition_disjoint_and_overlap() {
        let previous = snapshot(&[("a", 1), ("b", 2), ("c", 3)]);
        let next = snapshot(&[("b", 2), ("c", 9), ("d", 4)]);

        let split = partition(&previous, &next);

        assert_eq!(split.removed, vec!["a".to_string()]);
        assert_eq!(split.common, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(split.added, vec!["d".to_string()]);
        assert!(!split.same_keys());
    }

    #[test]
    fn test_partition_empty_previous() {
        let previous: BTreeMap<String, i32> = BTreeMap::new();
        let next = snapshot(&[("a", 1)]);

        let split = partition(&previous, &next);

        assert!(split.removed.is_empty());
        assert!(split.common.is_empty());
        assert_eq!(split.added, vec!["a".to_string()]);
    }

    #[test]
    fn test_partition_empty_next() {
        let previous = snapshot(&[("a", 1), ("b", 2)]);
        let next: BTreeMap<String, i32> = BTreeMap::new();

        let split = partition(&previous, &next);

        assert_eq!(split.removed, vec!["a".to_string(), "b".to_string()]);
        assert!(split.common.is_empty());
        assert!(split.added.is_empty());
    }

    #[test]
    fn test_partition_identical_keys() {
        let previous = snapshot(&[("a", 1), ("b", 2)]);
        let next = snapshot(&[("a", 5), ("b", 2)]);

        let split = partition(&previous, &next);

        assert!(split.same_keys());
        assert_eq!(split.common, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_value_types_may_differ() {
        let previous = snapshot(&[("a", 1)]);
        let next: BTreeMap<String, &str> = [("a".to_string(), "one")].into_iter().collect();

        let split = partition(&previous, &next);
        assert_eq!(split.common, vec!["a".to_string()]);
    }
}
