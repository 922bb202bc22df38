//! Sorted set: a score-keyed skip list paired with a member -> score
//! map for O(1) score lookup and member dedup.

use std::collections::HashMap;

use crate::skiplist::{RangeIter, ScoreBound, ScoreRangeIter, Skiplist};

/// Aggregation mode for ZUNIONSTORE / ZINTERSTORE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Min,
    Max,
}

impl Aggregate {
    #[must_use]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Aggregate::Sum => a + b,
            Aggregate::Min => a.min(b),
            Aggregate::Max => a.max(b),
        }
    }
}

#[derive(Debug, Default)]
pub struct Zset {
    list: Skiplist,
    scores: HashMap<Vec<u8>, f64>,
}

impl PartialEq for Zset {
    fn eq(&self, other: &Self) -> bool {
        self.scores == other.scores
    }
}

impl Zset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Insert or update a member. Returns `true` when the member is
    /// new. A score change relocates the skip-list node, since the
    /// list is ordered by score.
    pub fn add(&mut self, score: f64, member: Vec<u8>) -> bool {
        if let Some(&existing) = self.scores.get(&member) {
            if existing == score {
                return false;
            }
            self.remove(&member);
            self.scores.insert(member.clone(), score);
            self.list.insert(score, member);
            return false;
        }
        self.scores.insert(member.clone(), score);
        self.list.insert(score, member);
        true
    }

    /// Remove a member, returning its score.
    pub fn remove(&mut self, member: &[u8]) -> Option<f64> {
        let score = self.scores.remove(member)?;
        // The skip list is keyed by score alone; walk the equal-score
        // run to find the node carrying this member.
        let start = match self.list.rank(score) {
            Ok(rank) => rank,
            Err(_) => return Some(score),
        };
        let mut target = None;
        for (offset, (node_score, node_member)) in
            self.list.range(start, self.list.len()).enumerate()
        {
            if node_score != score {
                break;
            }
            if node_member == member {
                target = Some(start + offset);
                break;
            }
        }
        if let Some(rank) = target {
            self.list.remove_range(rank, rank + 1);
        }
        Some(score)
    }

    pub fn remove_items(&mut self, members: &[&[u8]]) -> usize {
        members
            .iter()
            .filter(|member| self.remove(member).is_some())
            .count()
    }

    #[must_use]
    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    #[must_use]
    pub fn contains(&self, member: &[u8]) -> bool {
        self.scores.contains_key(member)
    }

    /// Rank of a member: the rank of its score's first occurrence,
    /// matching the score-keyed index.
    #[must_use]
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let score = self.score(member)?;
        self.list.rank(score).ok()
    }

    #[must_use]
    pub fn count(&self, min: ScoreBound, max: ScoreBound) -> usize {
        self.list.count(min, max)
    }

    pub fn range(&self, start: usize, end: usize) -> RangeIter<'_> {
        self.list.range(start, end)
    }

    pub fn range_by_score(
        &self,
        min: ScoreBound,
        max: ScoreBound,
        offset: usize,
        limit: Option<usize>,
    ) -> ScoreRangeIter<'_> {
        self.list.range_by_score(min, max, offset, limit)
    }

    pub fn remove_range(&mut self, start: usize, end: usize) -> usize {
        let removed = self.list.remove_range(start, end);
        for (_, member) in &removed {
            self.scores.remove(member);
        }
        removed.len()
    }

    pub fn remove_range_by_score(&mut self, min: ScoreBound, max: ScoreBound) -> usize {
        let removed = self.list.remove_range_by_score(min, max);
        for (_, member) in &removed {
            self.scores.remove(member);
        }
        removed.len()
    }

    pub fn iter(&self) -> RangeIter<'_> {
        self.list.iter()
    }

    /// Weighted union with per-set weights and an aggregate for
    /// members present in more than one input.
    #[must_use]
    pub fn union(sets: &[&Zset], weights: &[f64], aggregate: Aggregate) -> Zset {
        let mut result = Zset::new();
        for (set, weight) in sets.iter().zip(weights) {
            for (score, member) in set.iter() {
                let mut score = score * weight;
                if let Some(existing) = result.score(member) {
                    score = aggregate.apply(score, existing);
                }
                result.add(score, member.to_vec());
            }
        }
        result
    }

    /// Weighted intersection: only members present in every input
    /// survive.
    #[must_use]
    pub fn inter(sets: &[&Zset], weights: &[f64], aggregate: Aggregate) -> Zset {
        let Some((first, rest)) = sets.split_first() else {
            return Zset::new();
        };
        let mut result = Zset::new();
        let first_weight = weights.first().copied().unwrap_or(1.0);
        'members: for (score, member) in first.iter() {
            for other in rest {
                if !other.contains(member) {
                    continue 'members;
                }
            }
            let mut combined = score * first_weight;
            for (other, weight) in rest.iter().zip(&weights[1..]) {
                // contains() above guarantees the member is present.
                if let Some(other_score) = other.score(member) {
                    combined = aggregate.apply(combined, other_score * weight);
                }
            }
            result.add(combined, member.to_vec());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{Aggregate, Zset};
    use crate::skiplist::ScoreBound;

    fn members(zset: &Zset) -> Vec<Vec<u8>> {
        zset.iter().map(|(_, m)| m.to_vec()).collect()
    }

    #[test]
    fn add_reports_new_vs_update() {
        let mut zset = Zset::new();
        assert!(zset.add(1.0, b"a".to_vec()));
        assert!(zset.add(2.0, b"b".to_vec()));
        assert!(!zset.add(5.0, b"a".to_vec()));
        assert_eq!(zset.len(), 2);
        assert_eq!(zset.score(b"a"), Some(5.0));
        assert_eq!(members(&zset), vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn same_score_add_is_a_noop() {
        let mut zset = Zset::new();
        zset.add(1.0, b"a".to_vec());
        assert!(!zset.add(1.0, b"a".to_vec()));
        assert_eq!(zset.len(), 1);
    }

    #[test]
    fn remove_keeps_list_and_map_in_step() {
        let mut zset = Zset::new();
        zset.add(1.0, b"a".to_vec());
        zset.add(1.0, b"b".to_vec());
        zset.add(2.0, b"c".to_vec());
        assert_eq!(zset.remove(b"b"), Some(1.0));
        assert_eq!(zset.remove(b"b"), None);
        assert_eq!(zset.len(), 2);
        assert_eq!(members(&zset), vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(zset.rank(b"c"), Some(1));
    }

    #[test]
    fn remove_items_counts_hits_only() {
        let mut zset = Zset::new();
        zset.add(1.0, b"a".to_vec());
        zset.add(2.0, b"b".to_vec());
        assert_eq!(zset.remove_items(&[b"a", b"missing", b"b"]), 2);
        assert!(zset.is_empty());
    }

    #[test]
    fn rank_is_score_keyed() {
        let mut zset = Zset::new();
        zset.add(1.0, b"a".to_vec());
        zset.add(2.0, b"b".to_vec());
        zset.add(3.0, b"c".to_vec());
        assert_eq!(zset.rank(b"a"), Some(0));
        assert_eq!(zset.rank(b"b"), Some(1));
        assert_eq!(zset.rank(b"c"), Some(2));
        assert_eq!(zset.rank(b"nope"), None);
    }

    #[test]
    fn remove_range_by_rank_updates_map() {
        let mut zset = Zset::new();
        for (score, member) in [(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d")] {
            zset.add(score, member.as_bytes().to_vec());
        }
        assert_eq!(zset.remove_range(1, 3), 2);
        assert_eq!(zset.len(), 2);
        assert!(zset.score(b"b").is_none());
        assert!(zset.score(b"c").is_none());
        assert_eq!(members(&zset), vec![b"a".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn remove_range_by_score_updates_map() {
        let mut zset = Zset::new();
        for (score, member) in [(1.0, "a"), (2.0, "b"), (3.0, "c")] {
            zset.add(score, member.as_bytes().to_vec());
        }
        let removed = zset.remove_range_by_score(
            ScoreBound::inclusive(2.0),
            ScoreBound::inclusive(3.0),
        );
        assert_eq!(removed, 2);
        assert_eq!(members(&zset), vec![b"a".to_vec()]);
    }

    #[test]
    fn union_applies_weights_and_aggregate() {
        let mut left = Zset::new();
        left.add(1.0, b"a".to_vec());
        left.add(2.0, b"b".to_vec());
        let mut right = Zset::new();
        right.add(10.0, b"b".to_vec());
        right.add(4.0, b"c".to_vec());

        let sum = Zset::union(&[&left, &right], &[1.0, 1.0], Aggregate::Sum);
        assert_eq!(sum.score(b"a"), Some(1.0));
        assert_eq!(sum.score(b"b"), Some(12.0));
        assert_eq!(sum.score(b"c"), Some(4.0));

        let weighted_max = Zset::union(&[&left, &right], &[3.0, 1.0], Aggregate::Max);
        assert_eq!(weighted_max.score(b"b"), Some(10.0));
    }

    #[test]
    fn inter_keeps_common_members_only() {
        let mut left = Zset::new();
        left.add(1.0, b"a".to_vec());
        left.add(2.0, b"b".to_vec());
        let mut right = Zset::new();
        right.add(5.0, b"b".to_vec());
        right.add(9.0, b"c".to_vec());

        let inter = Zset::inter(&[&left, &right], &[1.0, 1.0], Aggregate::Sum);
        assert_eq!(inter.len(), 1);
        assert_eq!(inter.score(b"b"), Some(7.0));

        let min = Zset::inter(&[&left, &right], &[1.0, 1.0], Aggregate::Min);
        assert_eq!(min.score(b"b"), Some(2.0));
    }
}
