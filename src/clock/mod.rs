use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Causal ordering between two vector clocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClockOrdering {
    LessThan,
    GreaterThan,
    Equal,
    Concurrent,
}

/// Per-client monotonic counters establishing causal (not wall-clock)
/// order between operations from different devices. Missing keys read
/// as counter 0.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(pub BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, client_id: &str) -> u64 {
        self.0.get(client_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns a new clock with `client_id`'s counter bumped by one.
    /// All other entries are untouched.
    pub fn increment(&self, client_id: &str) -> Self {
        let mut next = self.clone();
        let counter = next.0.entry(client_id.to_string()).or_insert(0);
        *counter += 1;
        next
    }

    /// Pointwise max over the union of keys. Commutative.
    pub fn merge(&self, other: &Self) -> Self {
        let mut out = self.0.clone();
        for (client_id, counter) in &other.0 {
            let slot = out.entry(client_id.clone()).or_insert(0);
            if *counter > *slot {
                *slot = *counter;
            }
        }
        Self(out)
    }

    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        let keys: BTreeSet<&str> = self
            .0
            .keys()
            .chain(other.0.keys())
            .map(String::as_str)
            .collect();

        for key in keys {
            let a = self.get(key);
            let b = other.get(key);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
            if self_ahead && other_ahead {
                return ClockOrdering::Concurrent;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::GreaterThan,
            (false, true) => ClockOrdering::LessThan,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Caps the entry count by dropping lowest-counter entries first.
    /// Entries in `protected` are never dropped: an outstanding full-state
    /// import's causal dominance depends on them, and pruning one would
    /// make post-import operations classify as concurrent with the import
    /// on other devices.
    pub fn limit_size(&self, protected: &BTreeSet<String>, max_entries: usize) -> Self {
        if self.0.len() <= max_entries {
            return self.clone();
        }

        let mut droppable: Vec<(&String, u64)> = self
            .0
            .iter()
            .filter(|(id, _)| !protected.contains(*id))
            .map(|(id, counter)| (id, *counter))
            .collect();
        droppable.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        let excess = self.0.len() - max_entries;
        let to_drop: BTreeSet<String> = droppable
            .into_iter()
            .take(excess)
            .map(|(id, _)| id.clone())
            .collect();

        Self(
            self.0
                .iter()
                .filter(|(id, _)| !to_drop.contains(*id))
                .map(|(id, counter)| (id.clone(), *counter))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock(
            entries
                .iter()
                .map(|(id, n)| (id.to_string(), *n))
                .collect(),
        )
    }

    #[test]
    fn empty_clocks_are_equal() {
        assert_eq!(
            VectorClock::new().compare(&VectorClock::new()),
            ClockOrdering::Equal
        );
    }

    #[test]
    fn empty_vs_non_empty_is_less_than() {
        let a = VectorClock::new();
        let b = clock(&[("b", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::LessThan);
        assert_eq!(b.compare(&a), ClockOrdering::GreaterThan);
    }

    #[test]
    fn compare_is_symmetric_inverse() {
        let cases = [
            (clock(&[("a", 1)]), clock(&[("a", 2)])),
            (clock(&[("a", 2), ("b", 1)]), clock(&[("a", 2), ("b", 1)])),
            (clock(&[("a", 2)]), clock(&[("b", 1)])),
            (clock(&[("a", 1), ("b", 3)]), clock(&[("a", 2), ("b", 1)])),
        ];
        for (a, b) in cases {
            let forward = a.compare(&b);
            let backward = b.compare(&a);
            let expected = match forward {
                ClockOrdering::LessThan => ClockOrdering::GreaterThan,
                ClockOrdering::GreaterThan => ClockOrdering::LessThan,
                other => other,
            };
            assert_eq!(backward, expected, "a={a:?} b={b:?}");
        }
    }

    #[test]
    fn divergent_counters_are_concurrent() {
        let a = clock(&[("a", 2)]);
        let b = clock(&[("b", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
    }

    #[test]
    fn merge_is_commutative_and_dominating() {
        let a = clock(&[("a", 3), ("b", 1)]);
        let b = clock(&[("b", 4), ("c", 2)]);
        let merged = a.merge(&b);
        assert_eq!(merged, b.merge(&a));
        assert_eq!(merged, clock(&[("a", 3), ("b", 4), ("c", 2)]));
        assert!(matches!(
            a.compare(&merged),
            ClockOrdering::LessThan | ClockOrdering::Equal
        ));
        assert!(matches!(
            b.compare(&merged),
            ClockOrdering::LessThan | ClockOrdering::Equal
        ));
    }

    #[test]
    fn increment_bumps_only_one_counter() {
        let a = clock(&[("a", 2), ("b", 5)]);
        let bumped = a.increment("a");
        assert_eq!(bumped.get("a"), 3);
        assert_eq!(bumped.get("b"), 5);
        assert_eq!(a.compare(&bumped), ClockOrdering::LessThan);
    }

    #[test]
    fn increment_creates_missing_entry() {
        let a = VectorClock::new();
        let bumped = a.increment("fresh");
        assert_eq!(bumped.get("fresh"), 1);
        assert_eq!(bumped.compare(&a), ClockOrdering::GreaterThan);
    }

    #[test]
    fn limit_size_drops_lowest_counters_first() {
        let c = clock(&[("a", 10), ("b", 1), ("c", 5), ("d", 2)]);
        let limited = c.limit_size(&BTreeSet::new(), 2);
        assert_eq!(limited, clock(&[("a", 10), ("c", 5)]));
    }

    #[test]
    fn limit_size_never_drops_protected_entries() {
        let c = clock(&[("a", 10), ("b", 1), ("c", 5)]);
        let protected: BTreeSet<String> = ["b".to_string()].into_iter().collect();
        let limited = c.limit_size(&protected, 2);
        assert_eq!(limited.get("b"), 1);
        assert_eq!(limited.0.len(), 2);
    }

    #[test]
    fn limit_size_is_a_no_op_under_cap() {
        let c = clock(&[("a", 1), ("b", 2)]);
        assert_eq!(c.limit_size(&BTreeSet::new(), 8), c);
    }
}
