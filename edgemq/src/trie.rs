//! Subscription trie.
//!
//! Patterns are stored level by level, a node holds the set of values bound to the
//! pattern ending there:
//!
//! ```text
//! Root
//! ├── sport
//! │   ├── +
//! │   │   └── score    {s1}
//! │   └── #            {s2}
//! └── #                {s3}
//! ```
//!
//! Matching a concrete topic follows the literal edge, the `+` edge and the `#` edge
//! of every visited node and returns the union of the values found.

use std::hash::Hash;

use ahash::{AHashMap, AHashSet};

use crate::topic::{Level, Topic};

#[inline]
fn is_metadata(s: &str) -> bool {
    s.starts_with('$')
}

pub struct TopicTree<V> {
    values: AHashSet<V>,
    branches: AHashMap<Level, TopicTree<V>>,
}

impl<V> Default for TopicTree<V> {
    #[inline]
    fn default() -> TopicTree<V> {
        Self { values: AHashSet::default(), branches: AHashMap::default() }
    }
}

impl<V> TopicTree<V>
where
    V: Eq + Hash + Clone,
{
    /// Binds `value` to `topic`, returns false if it was already bound.
    #[inline]
    pub fn insert(&mut self, topic: &Topic, value: V) -> bool {
        let mut node = self;
        for level in topic.levels() {
            node = node.branches.entry(level.clone()).or_default();
        }
        node.values.insert(value)
    }

    /// Unbinds `value` from `topic`, pruning nodes left empty.
    #[inline]
    pub fn remove(&mut self, topic: &Topic, value: &V) -> bool {
        self._remove(topic.levels(), value)
    }

    fn _remove(&mut self, path: &[Level], value: &V) -> bool {
        match path.split_first() {
            None => self.values.remove(value),
            Some((first, rest)) => {
                if let Some(child) = self.branches.get_mut(first) {
                    let removed = child._remove(rest, value);
                    if child.is_empty() {
                        self.branches.remove(first);
                    }
                    removed
                } else {
                    false
                }
            }
        }
    }

    /// Removes `value` from every pattern, returns how many bindings were dropped.
    pub fn clear(&mut self, value: &V) -> usize {
        let mut removeds = if self.values.remove(value) { 1 } else { 0 };
        self.branches.retain(|_, child| {
            removeds += child.clear(value);
            !child.is_empty()
        });
        removeds
    }

    /// Values bound to every pattern matching the concrete `topic`, without duplicates.
    pub fn matches(&self, topic: &str) -> Vec<V> {
        let path = topic.split('/').collect::<Vec<_>>();
        let mut out = AHashSet::default();
        self._matches(&path, 0, &mut out);
        out.into_iter().collect()
    }

    fn _matches(&self, path: &[&str], depth: usize, out: &mut AHashSet<V>) {
        //Topic names starting with $ are not matched by a leading wildcard
        let hidden = depth == 0 && path.first().map(|s| is_metadata(s)).unwrap_or(false);

        if !hidden {
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                out.extend(n.values.iter().cloned());
            }
        }

        match path.split_first() {
            None => out.extend(self.values.iter().cloned()),
            Some((first, rest)) => {
                let level = if first.is_empty() {
                    Level::Blank
                } else if hidden {
                    Level::Metadata((*first).into())
                } else {
                    Level::Normal((*first).into())
                };
                if let Some(n) = self.branches.get(&level) {
                    n._matches(rest, depth + 1, out);
                }
                if !hidden {
                    if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                        n._matches(rest, depth + 1, out);
                    }
                }
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.branches.is_empty()
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        len + self.values.len()
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        self.branches.values().map(|n| n.nodes_size() + 1).sum()
    }
}
