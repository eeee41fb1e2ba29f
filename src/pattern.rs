use serde::{Deserialize, Serialize};

pub const MAX_TREE_ARITY: usize = 3;

/// Ring membership for one channel, from the local rank's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingPattern {
    pub prev: usize,
    pub next: usize,
    /// Global ring order rotated to start at the local rank.
    pub user_ranks: Vec<usize>,
    /// Local rank's offset in the published (unrotated) ring order.
    pub index: usize,
}

/// Tree links for one channel: at most one parent, bounded fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreePattern {
    pub up: Option<usize>,
    pub down: Vec<usize>,
}

/// Collective-network chain for one channel: the node segment chains through
/// `up` towards the per-node master and fans out through `down` on the way
/// back. The master itself has no `up` peer; its uplink is the network root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollNetChain {
    pub up: Option<usize>,
    pub down: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphPattern {
    Ring,
    /// Simple tree; selected when the job spans at most two nodes.
    Tree,
    /// Split tree balancing both directions; selected for three or more nodes.
    BalancedTree,
}

impl RingPattern {
    /// Rotates the published ring order so the membership list starts at
    /// `rank`, and derives prev/next from the rotated order.
    pub fn from_ring_order(rank: usize, order: &[usize]) -> Option<RingPattern> {
        let nranks = order.len();
        let index = order.iter().position(|r| *r == rank)?;
        let user_ranks: Vec<usize> = (0..nranks).map(|i| order[(i + index) % nranks]).collect();
        Some(RingPattern {
            prev: user_ranks[nranks - 1],
            next: user_ranks[1 % nranks],
            user_ranks,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_rotation_starts_at_local_rank() {
        let order = [0usize, 1, 2, 3];
        let ring = RingPattern::from_ring_order(2, &order).unwrap();
        assert_eq!(ring.user_ranks, vec![2, 3, 0, 1]);
        assert_eq!(ring.prev, 1);
        assert_eq!(ring.next, 3);
        assert_eq!(ring.index, 2);
    }

    #[test]
    fn ring_rotation_rejects_missing_rank() {
        assert!(RingPattern::from_ring_order(7, &[0, 1, 2]).is_none());
    }
}
