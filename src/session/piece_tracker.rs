use std::collections::{BTreeSet, HashMap, HashSet};

/// Order-statistic index over `(rarity, piece)`.
///
/// Rarity of a piece is the number of currently connected peers known to own
/// it. Keeping the pairs in a `BTreeSet` keyed by rarity first gives rarest
/// lookups in better than linear time and makes ties resolve to the lowest
/// piece index deterministically.
#[derive(Debug)]
pub struct PieceTracker {
    by_rarity: BTreeSet<(u32, u32)>,
    rarity: HashMap<u32, u32>,
}

impl PieceTracker {
    /// Creates a tracker with every piece at rarity zero.
    pub fn new(piece_count: u32) -> Self {
        Self {
            by_rarity: (0..piece_count).map(|piece| (0, piece)).collect(),
            rarity: (0..piece_count).map(|piece| (piece, 0)).collect(),
        }
    }

    /// Returns the rarity of a piece; unknown pieces count as never seen.
    pub fn rarity(&self, piece: u32) -> u32 {
        self.rarity.get(&piece).copied().unwrap_or(0)
    }

    /// Moves a piece to a new rarity.
    pub fn update(&mut self, piece: u32, new_rarity: u32) {
        if let Some(old_rarity) = self.rarity.insert(piece, new_rarity) {
            self.by_rarity.remove(&(old_rarity, piece));
        }
        self.by_rarity.insert((new_rarity, piece));
    }

    /// Returns the rarest piece among the candidates, lowest index on ties.
    pub fn rarest_in(&self, candidates: &HashSet<u32>) -> Option<u32> {
        self.by_rarity
            .iter()
            .find(|(_, piece)| candidates.contains(piece))
            .map(|(_, piece)| *piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tracker_starts_at_zero() {
        let tracker = PieceTracker::new(4);

        for piece in 0..4 {
            assert_eq!(tracker.rarity(piece), 0);
        }
    }

    #[test]
    fn test_update_changes_rarity() {
        let mut tracker = PieceTracker::new(4);
        tracker.update(2, 3);

        assert_eq!(tracker.rarity(2), 3);
        assert_eq!(tracker.rarity(1), 0);
    }

    #[test]
    fn test_rarest_in_picks_minimal_rarity() {
        let mut tracker = PieceTracker::new(3);
        tracker.update(0, 1);
        tracker.update(1, 2);
        tracker.update(2, 1);

        let candidates = HashSet::from([1, 2]);

        assert_eq!(tracker.rarest_in(&candidates), Some(2));
    }

    #[test]
    fn test_rarest_in_breaks_ties_with_lowest_index() {
        let mut tracker = PieceTracker::new(3);
        tracker.update(0, 1);
        tracker.update(1, 1);
        tracker.update(2, 1);

        let candidates = HashSet::from([0, 1, 2]);

        assert_eq!(tracker.rarest_in(&candidates), Some(0));
    }

    #[test]
    fn test_rarest_in_ignores_non_candidates() {
        let mut tracker = PieceTracker::new(3);
        tracker.update(0, 0);
        tracker.update(1, 5);
        tracker.update(2, 9);

        let candidates = HashSet::from([2]);

        assert_eq!(tracker.rarest_in(&candidates), Some(2));
    }

    #[test]
    fn test_rarest_in_empty_candidates() {
        let tracker = PieceTracker::new(3);

        assert_eq!(tracker.rarest_in(&HashSet::new()), None);
    }
}
