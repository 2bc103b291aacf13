//! BK-tree over Hamming distance.
//!
//! Each node stores a fingerprint and its children keyed by their distance
//! to it. The triangle inequality lets a radius-`r` query skip every child
//! edge outside `[d - r, d + r]`, which keeps small-radius lookups
//! sub-linear in the number of stored fingerprints.
//!
//! Nodes live in a flat arena; their index doubles as insertion order and
//! is the tie-breaker between equally distant matches.

use crate::fingerprint::Fingerprint;

struct Node<T> {
    fingerprint: Fingerprint,
    value: T,
    /// `(distance to this node, child node index)`.
    children: Vec<(u32, usize)>,
}

/// A BK-tree keyed by [`Fingerprint`].
pub struct BkTree<T> {
    nodes: Vec<Node<T>>,
}

impl<T> BkTree<T> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a value. Duplicated fingerprints are allowed and kept in
    /// insertion order; callers enforce any uniqueness policy.
    pub fn insert(&mut self, fingerprint: Fingerprint, value: T) {
        let new_index = self.nodes.len();
        self.nodes.push(Node {
            fingerprint,
            value,
            children: Vec::new(),
        });
        if new_index == 0 {
            return;
        }

        let mut current = 0;
        loop {
            let d = self.nodes[current].fingerprint.distance(&fingerprint);
            let next = self.nodes[current]
                .children
                .iter()
                .find(|(edge, _)| *edge == d)
                .map(|(_, child)| *child);
            match next {
                Some(child) => current = child,
                None => {
                    self.nodes[current].children.push((d, new_index));
                    return;
                }
            }
        }
    }

    /// The closest value within `radius` of `query`, with its distance.
    /// Equal distances resolve to the earliest inserted value.
    pub fn nearest(&self, query: &Fingerprint, radius: u32) -> Option<(&T, u32)> {
        self.nearest_where(query, radius, |_| true)
    }

    /// Like [`nearest`](Self::nearest), but only values for which `accept`
    /// returns true are candidates. Rejected nodes are still traversed.
    pub fn nearest_where(
        &self,
        query: &Fingerprint,
        radius: u32,
        accept: impl Fn(&T) -> bool,
    ) -> Option<(&T, u32)> {
        if self.nodes.is_empty() {
            return None;
        }

        let mut best: Option<(usize, u32)> = None;
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            let d = node.fingerprint.distance(query);
            if d <= radius && accept(&node.value) {
                let better = match best {
                    None => true,
                    Some((best_index, best_d)) => d < best_d || (d == best_d && index < best_index),
                };
                if better {
                    best = Some((index, d));
                }
            }
            let low = d.saturating_sub(radius);
            let high = d + radius;
            stack.extend(
                node.children
                    .iter()
                    .filter(|(edge, _)| (low..=high).contains(edge))
                    .map(|(_, child)| *child),
            );
        }

        best.map(|(index, d)| (&self.nodes[index].value, d))
    }

    /// Iterate over all stored values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter().map(|n| &n.value)
    }
}

impl<T> Default for BkTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(bits: u64) -> Fingerprint {
        Fingerprint::from_bits(bits)
    }

    /// Reference answer by linear scan.
    fn brute_nearest(items: &[(u64, usize)], q: u64, radius: u32) -> Option<(usize, u32)> {
        items
            .iter()
            .map(|(bits, id)| (*id, (bits ^ q).count_ones()))
            .filter(|(_, d)| *d <= radius)
            .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
    }

    #[test]
    fn test_empty() {
        let tree: BkTree<()> = BkTree::new();
        assert!(tree.is_empty());
        assert!(tree.nearest(&fp(0), 64).is_none());
    }

    #[test]
    fn test_exact_and_near_hits() {
        let mut tree = BkTree::new();
        tree.insert(fp(0b0000), "a");
        tree.insert(fp(0b1111), "b");
        tree.insert(fp(u64::MAX), "c");

        assert_eq!(tree.nearest(&fp(0b0000), 0), Some((&"a", 0)));
        assert_eq!(tree.nearest(&fp(0b0111), 1), Some((&"b", 1)));
        assert_eq!(tree.nearest(&fp(0b0011), 2), Some((&"a", 2)));
        assert!(tree.nearest(&fp(0xFF00), 3).is_none());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_tie_prefers_earliest() {
        let mut tree = BkTree::new();
        tree.insert(fp(0b01), 1);
        tree.insert(fp(0b10), 2);
        assert_eq!(tree.nearest(&fp(0b00), 1), Some((&1, 1)));
    }

    #[test]
    fn test_rejected_nearest_falls_back_to_next() {
        let mut tree = BkTree::new();
        tree.insert(fp(0b0001), "closest");
        tree.insert(fp(0b0111), "further");
        tree.insert(fp(u64::MAX), "far");

        let q = fp(0b0000);
        assert_eq!(tree.nearest(&q, 4), Some((&"closest", 1)));
        assert_eq!(
            tree.nearest_where(&q, 4, |v| *v != "closest"),
            Some((&"further", 3))
        );
        assert!(tree.nearest_where(&q, 2, |v| *v != "closest").is_none());
    }

    #[test]
    fn test_matches_linear_scan() {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut items = Vec::new();
        let mut tree = BkTree::new();
        for id in 0..500 {
            let bits = next();
            items.push((bits, id));
            tree.insert(fp(bits), id);
        }
        // Plant near neighbours of a few stored values.
        for (k, (bits, _)) in items.clone().iter().take(20).enumerate() {
            let id = 1000 + k;
            let near = bits ^ (1u64 << (k % 64)) ^ (1u64 << ((k * 7) % 64));
            items.push((near, id));
            tree.insert(fp(near), id);
        }

        for radius in [0, 3, 10, 20] {
            for _ in 0..200 {
                let q = if next() % 2 == 0 {
                    items[(next() % items.len() as u64) as usize].0 ^ (1u64 << (next() % 64))
                } else {
                    next()
                };
                let expected = brute_nearest(&items, q, radius);
                let got = tree.nearest(&fp(q), radius).map(|(v, d)| (*v, d));
                assert_eq!(got, expected, "radius {} query {:016x}", radius, q);
            }
        }
    }
}
