use serde::{Deserialize, Serialize};

use crate::comm::{PeerInfo, MAX_CHANNELS};
use crate::error::{CommError, Result};
use crate::pattern::{CollNetChain, GraphPattern, TreePattern, MAX_TREE_ARITY};
use crate::transport::{NUM_ALGORITHMS, NUM_PROTOCOLS};

/// Link class between two devices. Variants are ordered slowest-first so the
/// elementwise minimum across ranks is the conservative choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LinkType {
    Net,
    Sys,
    Pci,
    Nvl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86,
    Arm,
    Power,
}

/// Request handed to the topology builder for one candidate graph.
pub struct GraphSpec {
    pub pattern: GraphPattern,
    pub collnet: bool,
    pub min_channels: usize,
    pub max_channels: usize,
    pub cross_nic: u8,
}

/// One candidate topology graph, rank-local until reconciled.
#[derive(Debug, Clone)]
pub struct TopoGraph {
    pub pattern: GraphPattern,
    pub n_channels: usize,
    pub same_channels: bool,
    pub speed_intra: f32,
    pub speed_inter: f32,
    pub type_intra: LinkType,
    pub type_inter: LinkType,
    /// Per-channel rank order for the local node's segment.
    pub intra: Vec<Vec<usize>>,
}

/// Wire subset of a graph exchanged in the parameter-negotiation AllGather.
/// All fields are fixed-size so every rank contributes equal bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GraphInfo {
    pub pattern: GraphPattern,
    pub same_channels: bool,
    pub speed_intra: f32,
    pub speed_inter: f32,
    pub type_intra: LinkType,
    pub type_inter: LinkType,
}

impl GraphInfo {
    pub fn from_graph(graph: &TopoGraph) -> Self {
        GraphInfo {
            pattern: graph.pattern,
            same_channels: graph.same_channels,
            speed_intra: graph.speed_intra,
            speed_inter: graph.speed_inter,
            type_intra: graph.type_intra,
            type_inter: graph.type_inter,
        }
    }

    /// Folds a peer's view into this one, taking the minimum of every numeric
    /// attribute. Heterogeneous peers degrade to the slowest member; no rank
    /// may assume better-than-worst-case capability.
    pub fn merge_min(&mut self, other: &GraphInfo) {
        self.same_channels &= other.same_channels;
        self.speed_intra = self.speed_intra.min(other.speed_intra);
        self.speed_inter = self.speed_inter.min(other.speed_inter);
        self.type_intra = self.type_intra.min(other.type_intra);
        self.type_inter = self.type_inter.min(other.type_inter);
    }

    pub fn apply_to(&self, graph: &mut TopoGraph) {
        graph.same_channels = self.same_channels;
        graph.speed_intra = self.speed_intra;
        graph.speed_inter = self.speed_inter;
        graph.type_intra = self.type_intra;
        graph.type_inter = self.type_inter;
    }
}

pub const RANK_NONE: u32 = u32::MAX;

/// Per-rank ring-position descriptor published in the negotiation AllGather.
/// Fixed-size arrays keep the wire record identical in length on every rank
/// even when channel counts still differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopoRanks {
    /// First rank of the local node's segment, per channel. This value seeds
    /// node accounting: it is identical for all ranks of one node.
    pub ring_recv: [u32; MAX_CHANNELS],
    /// Last rank of the local node's segment, per channel.
    pub ring_send: [u32; MAX_CHANNELS],
    /// Intra-node predecessor, or RANK_NONE at the segment head.
    pub ring_prev: [u32; MAX_CHANNELS],
    /// Intra-node successor, or RANK_NONE at the segment tail.
    pub ring_next: [u32; MAX_CHANNELS],
}

impl TopoRanks {
    fn empty() -> Self {
        TopoRanks {
            ring_recv: [RANK_NONE; MAX_CHANNELS],
            ring_send: [RANK_NONE; MAX_CHANNELS],
            ring_prev: [RANK_NONE; MAX_CHANNELS],
            ring_next: [RANK_NONE; MAX_CHANNELS],
        }
    }
}

/// Fills the local topo-ranks descriptor and the initial channel segments
/// from the computed ring graph. Channels are duplicated once (ring lane and
/// tree lane share a segment layout), as reconciliation may later shrink and
/// compact them.
pub fn preset(rank: usize, ring_graph: &TopoGraph) -> Result<(TopoRanks, Vec<Vec<usize>>)> {
    let n_channels = ring_graph.n_channels;
    let mut topo_ranks = TopoRanks::empty();
    let mut segments = Vec::with_capacity(2 * n_channels);
    for c in 0..n_channels {
        let order = &ring_graph.intra[c];
        let pos = order.iter().position(|r| *r == rank).ok_or_else(|| {
            CommError::InternalError(format!(
                "rank {} missing from its own ring segment on channel {}",
                rank, c
            ))
        })?;
        topo_ranks.ring_recv[c] = order[0] as u32;
        topo_ranks.ring_send[c] = order[order.len() - 1] as u32;
        topo_ranks.ring_prev[c] = if pos == 0 {
            RANK_NONE
        } else {
            order[pos - 1] as u32
        };
        topo_ranks.ring_next[c] = if pos == order.len() - 1 {
            RANK_NONE
        } else {
            order[pos + 1] as u32
        };
        segments.push(order.clone());
    }
    for c in 0..n_channels {
        topo_ranks.ring_recv[n_channels + c] = topo_ranks.ring_recv[c];
        topo_ranks.ring_send[n_channels + c] = topo_ranks.ring_send[c];
        topo_ranks.ring_prev[n_channels + c] = topo_ranks.ring_prev[c];
        topo_ranks.ring_next[n_channels + c] = topo_ranks.ring_next[c];
        segments.push(segments[c].clone());
    }
    Ok((topo_ranks, segments))
}

/// Removes the gap left by a reconciled channel-count shrink: the duplicated
/// block starting at `c0` moves down to start at `c1`, and everything above
/// `2 * c1` is discarded.
pub fn compact_channels<T: Clone>(channels: &mut Vec<T>, c0: usize, c1: usize) {
    if c1 >= c0 {
        return;
    }
    for i in 0..c1 {
        channels[c1 + i] = channels[c0 + i].clone();
    }
    channels.truncate(2 * c1);
}

/// Deterministic node accounting derived from the gathered descriptors: the
/// first distinct "first rank of my segment" seen in ascending rank order
/// defines a new node. Every rank scans the identical array, so every rank
/// derives the identical assignment.
pub struct NodeAccounting {
    pub n_nodes: usize,
    pub node_of_rank: Vec<usize>,
    pub first_ranks: Vec<usize>,
    /// Tree pattern recorded per node; nodes may differ by device generation.
    pub tree_patterns: Vec<GraphPattern>,
}

pub fn account_nodes(
    all_topo: &[TopoRanks],
    all_tree_patterns: &[GraphPattern],
) -> NodeAccounting {
    let mut first_ranks: Vec<usize> = Vec::new();
    let mut tree_patterns = Vec::new();
    let mut node_of_rank = Vec::with_capacity(all_topo.len());
    for (i, topo) in all_topo.iter().enumerate() {
        let first = topo.ring_recv[0] as usize;
        let node = match first_ranks.iter().position(|f| *f == first) {
            Some(node) => node,
            None => {
                first_ranks.push(first);
                tree_patterns.push(all_tree_patterns[i]);
                first_ranks.len() - 1
            }
        };
        node_of_rank.push(node);
    }
    NodeAccounting {
        n_nodes: first_ranks.len(),
        node_of_rank,
        first_ranks,
        tree_patterns,
    }
}

/// Stitches the per-node segments into one global ring order for a channel,
/// visiting nodes in their accounting order and following each rank's
/// published intra-node successor.
pub fn build_ring_order(
    channel: usize,
    accounting: &NodeAccounting,
    all_topo: &[TopoRanks],
) -> Result<Vec<usize>> {
    let n_ranks = all_topo.len();
    let mut order = Vec::with_capacity(n_ranks);
    for node in 0..accounting.n_nodes {
        let mut cursor = all_topo[accounting.first_ranks[node]].ring_recv[channel] as usize;
        loop {
            if order.len() > n_ranks {
                return Err(CommError::InternalError(format!(
                    "ring segment cycle on channel {}",
                    channel
                )));
            }
            order.push(cursor);
            match all_topo[cursor].ring_next[channel] {
                RANK_NONE => break,
                next => cursor = next as usize,
            }
        }
    }
    if order.len() != n_ranks {
        return Err(CommError::InternalError(format!(
            "ring on channel {} covers {} of {} ranks",
            channel,
            order.len(),
            n_ranks
        )));
    }
    Ok(order)
}

fn node_parent_children(
    node: usize,
    n_nodes: usize,
    pattern: GraphPattern,
) -> (Option<usize>, Vec<usize>) {
    match pattern {
        // two nodes at most: node 0 is the root, node 1 hangs off it
        GraphPattern::Ring | GraphPattern::Tree => {
            let parent = if node == 0 { None } else { Some(0) };
            let children = if node == 0 { (1..n_nodes).collect() } else { Vec::new() };
            (parent, children)
        }
        GraphPattern::BalancedTree => {
            let parent = if node == 0 { None } else { Some((node - 1) / 2) };
            let children = [2 * node + 1, 2 * node + 2]
                .into_iter()
                .filter(|c| *c < n_nodes)
                .collect();
            (parent, children)
        }
    }
}

/// Derives the local rank's tree links for one channel from the global ring
/// order: ranks chain along their node segment, and segment heads carry the
/// inter-node links of the node-level tree.
pub fn build_tree(
    rank: usize,
    channel_ring: &[usize],
    accounting: &NodeAccounting,
) -> TreePattern {
    let node = accounting.node_of_rank[rank];
    let pattern = accounting.tree_patterns[node];
    let (parent_node, child_nodes) = node_parent_children(node, accounting.n_nodes, pattern);

    let segment: Vec<usize> = channel_ring
        .iter()
        .copied()
        .filter(|r| accounting.node_of_rank[*r] == node)
        .collect();
    let pos = segment.iter().position(|r| *r == rank).unwrap();

    let mut tree = TreePattern::default();
    if pos > 0 {
        tree.up = Some(segment[pos - 1]);
    } else {
        tree.up = parent_node.map(|p| accounting.first_ranks[p]);
    }
    if pos + 1 < segment.len() {
        tree.down.push(segment[pos + 1]);
    }
    if pos == 0 {
        for child in child_nodes {
            if tree.down.len() == MAX_TREE_ARITY {
                break;
            }
            tree.down.push(accounting.first_ranks[child]);
        }
    }
    tree
}

/// Collective-network chain for one channel, derived from the local node's
/// segment: ranks chain toward the segment head (the per-node master); the
/// master's own uplink goes through the collnet transport, not through a
/// peer rank.
pub fn build_collnet_chain(rank: usize, segment: &[usize]) -> CollNetChain {
    let pos = segment.iter().position(|r| *r == rank).unwrap();
    CollNetChain {
        up: if pos > 0 { Some(segment[pos - 1]) } else { None },
        down: if pos + 1 < segment.len() {
            Some(segment[pos + 1])
        } else {
            None
        },
    }
}

/// Latency/bandwidth coefficients per (algorithm, protocol), consumed by the
/// data-plane's algorithm selector.
#[derive(Debug, Clone)]
pub struct TuningModel {
    pub latencies: [[f32; NUM_PROTOCOLS]; NUM_ALGORITHMS],
    pub bandwidths: [[f32; NUM_PROTOCOLS]; NUM_ALGORITHMS],
}

/// Rank-local view of the hardware produced from the gathered peer array.
pub struct TopoSystem {
    pub n_ranks: usize,
    /// Ranks sharing this rank's host, ascending.
    pub local_ranks: Vec<usize>,
    pub n_nets: usize,
}

/// External path-search collaborator. Implementations turn the peer array
/// into candidate graphs; this crate only negotiates and connects them.
pub trait TopologyBuilder: Send + Sync {
    fn build_system(&self, rank: usize, peers: &[PeerInfo]) -> Result<TopoSystem>;
    fn compute_paths(&self, system: &mut TopoSystem, peers: &[PeerInfo]) -> Result<()>;
    fn trim_unreachable(&self, system: &mut TopoSystem) -> Result<()>;
    fn compute_graph(&self, system: &TopoSystem, spec: &GraphSpec) -> Result<TopoGraph>;
    fn cpu_arch(&self, system: &TopoSystem) -> CpuArch;
    /// CPU indices close to the device, for NUMA-local host allocations.
    fn device_affinity(&self, system: &TopoSystem, device: i32) -> Vec<usize>;
    fn tune_model(
        &self,
        system: &TopoSystem,
        min_comp_cap: u32,
        max_comp_cap: u32,
        graphs: [&TopoGraph; 3],
    ) -> TuningModel;
    /// Channel striping width for point-to-point transfers.
    fn p2p_channel_count(&self, system: &TopoSystem, n_channels: usize) -> usize;
}

/// Built-in builder for flat, uniform hosts: every device on a node is one
/// PCI hop away, rings walk ranks in ascending order. Real deployments plug
/// in a search-based builder.
pub struct FlatTopology {
    channel_count: u32,
}

impl FlatTopology {
    pub fn new(channel_count: u32) -> Self {
        FlatTopology { channel_count }
    }
}

impl TopologyBuilder for FlatTopology {
    fn build_system(&self, rank: usize, peers: &[PeerInfo]) -> Result<TopoSystem> {
        let my_host = peers[rank].host_hash;
        let local_ranks: Vec<usize> = peers
            .iter()
            .filter(|p| p.host_hash == my_host)
            .map(|p| p.rank)
            .collect();
        let remote = peers.len() - local_ranks.len();
        Ok(TopoSystem {
            n_ranks: peers.len(),
            local_ranks,
            n_nets: if remote > 0 { 1 } else { 0 },
        })
    }

    fn compute_paths(&self, _system: &mut TopoSystem, _peers: &[PeerInfo]) -> Result<()> {
        Ok(())
    }

    fn trim_unreachable(&self, _system: &mut TopoSystem) -> Result<()> {
        Ok(())
    }

    fn compute_graph(&self, system: &TopoSystem, spec: &GraphSpec) -> Result<TopoGraph> {
        let n_channels = (self.channel_count as usize)
            .clamp(spec.min_channels, spec.max_channels);
        let intra = vec![system.local_ranks.clone(); n_channels];
        Ok(TopoGraph {
            pattern: spec.pattern,
            n_channels,
            same_channels: true,
            speed_intra: 12.0,
            speed_inter: 5.0,
            type_intra: LinkType::Pci,
            type_inter: LinkType::Net,
            intra,
        })
    }

    fn cpu_arch(&self, _system: &TopoSystem) -> CpuArch {
        if cfg!(target_arch = "aarch64") {
            CpuArch::Arm
        } else if cfg!(target_arch = "powerpc64") {
            CpuArch::Power
        } else {
            CpuArch::X86
        }
    }

    fn device_affinity(&self, _system: &TopoSystem, _device: i32) -> Vec<usize> {
        Vec::new()
    }

    fn tune_model(
        &self,
        _system: &TopoSystem,
        min_comp_cap: u32,
        _max_comp_cap: u32,
        graphs: [&TopoGraph; 3],
    ) -> TuningModel {
        // crude affine model: base latency per protocol, bandwidth scaled by
        // the reconciled graph speeds and discounted for older devices
        let base_lat = [4.4_f32, 2.0, 1.0];
        let discount = if min_comp_cap < 70 { 0.8 } else { 1.0 };
        let mut latencies = [[0.0; NUM_PROTOCOLS]; NUM_ALGORITHMS];
        let mut bandwidths = [[0.0; NUM_PROTOCOLS]; NUM_ALGORITHMS];
        for (a, graph) in graphs.iter().enumerate() {
            let speed = graph.speed_intra.min(graph.speed_inter);
            for p in 0..NUM_PROTOCOLS {
                latencies[a][p] = base_lat[p] * (1.0 + a as f32 * 0.5);
                bandwidths[a][p] = speed * graph.n_channels as f32 * discount;
            }
        }
        TuningModel {
            latencies,
            bandwidths,
        }
    }

    fn p2p_channel_count(&self, _system: &TopoSystem, n_channels: usize) -> usize {
        n_channels.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_info(speed_intra: f32, speed_inter: f32, ty: LinkType, same: bool) -> GraphInfo {
        GraphInfo {
            pattern: GraphPattern::Ring,
            same_channels: same,
            speed_intra,
            speed_inter,
            type_intra: ty,
            type_inter: LinkType::Net,
        }
    }

    #[test]
    fn merge_min_converges_regardless_of_order() {
        let views = [
            graph_info(24.0, 5.0, LinkType::Nvl, true),
            graph_info(12.0, 6.0, LinkType::Pci, true),
            graph_info(18.0, 4.0, LinkType::Sys, false),
        ];
        // every rank folds the identical array, possibly visiting entries in
        // a different starting position; the result must not depend on it
        let mut expected = None;
        for start in 0..views.len() {
            let mut merged = views[start];
            for i in 0..views.len() {
                merged.merge_min(&views[(start + i) % views.len()]);
            }
            assert_eq!(merged.speed_intra, 12.0);
            assert_eq!(merged.speed_inter, 4.0);
            assert_eq!(merged.type_intra, LinkType::Sys);
            assert!(!merged.same_channels);
            let repr = format!("{:?}", merged);
            if let Some(prev) = &expected {
                assert_eq!(prev, &repr);
            }
            expected = Some(repr);
        }
    }

    fn topo_for_segment(segment: &[usize], rank: usize, n_channels: usize) -> TopoRanks {
        let pos = segment.iter().position(|r| *r == rank).unwrap();
        let mut topo = TopoRanks::empty();
        for c in 0..n_channels {
            topo.ring_recv[c] = segment[0] as u32;
            topo.ring_send[c] = segment[segment.len() - 1] as u32;
            topo.ring_prev[c] = if pos == 0 {
                RANK_NONE
            } else {
                segment[pos - 1] as u32
            };
            topo.ring_next[c] = if pos == segment.len() - 1 {
                RANK_NONE
            } else {
                segment[pos + 1] as u32
            };
        }
        topo
    }

    #[test]
    fn node_accounting_is_scan_order_deterministic() {
        // ranks 0,2 on one node, ranks 1,3 on another, interleaved
        let seg_a = vec![0, 2];
        let seg_b = vec![1, 3];
        let all_topo = vec![
            topo_for_segment(&seg_a, 0, 1),
            topo_for_segment(&seg_b, 1, 1),
            topo_for_segment(&seg_a, 2, 1),
            topo_for_segment(&seg_b, 3, 1),
        ];
        let patterns = vec![GraphPattern::Tree; 4];
        let accounting = account_nodes(&all_topo, &patterns);
        assert_eq!(accounting.n_nodes, 2);
        assert_eq!(accounting.node_of_rank, vec![0, 1, 0, 1]);
        assert_eq!(accounting.first_ranks, vec![0, 1]);
    }

    #[test]
    fn ring_order_stitches_node_segments() {
        let seg_a = vec![0, 1];
        let seg_b = vec![2, 3];
        let all_topo = vec![
            topo_for_segment(&seg_a, 0, 1),
            topo_for_segment(&seg_a, 1, 1),
            topo_for_segment(&seg_b, 2, 1),
            topo_for_segment(&seg_b, 3, 1),
        ];
        let accounting = account_nodes(&all_topo, &vec![GraphPattern::Tree; 4]);
        let order = build_ring_order(0, &accounting, &all_topo).unwrap();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn compaction_preserves_leading_channels() {
        // duplicated layout for c0 = 3: [a b c a' b' c']
        let mut channels = vec!["a", "b", "c", "a", "b", "c"];
        compact_channels(&mut channels, 3, 2);
        assert_eq!(channels, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn tree_links_chain_within_node_and_bridge_heads() {
        let seg_a = vec![0, 1];
        let seg_b = vec![2, 3];
        let all_topo = vec![
            topo_for_segment(&seg_a, 0, 1),
            topo_for_segment(&seg_a, 1, 1),
            topo_for_segment(&seg_b, 2, 1),
            topo_for_segment(&seg_b, 3, 1),
        ];
        let accounting = account_nodes(&all_topo, &vec![GraphPattern::Tree; 4]);
        let ring = build_ring_order(0, &accounting, &all_topo).unwrap();

        let root = build_tree(0, &ring, &accounting);
        assert_eq!(root.up, None);
        assert!(root.down.contains(&1));
        assert!(root.down.contains(&2));

        let remote_head = build_tree(2, &ring, &accounting);
        assert_eq!(remote_head.up, Some(0));
        assert_eq!(remote_head.down, vec![3]);

        let leaf = build_tree(3, &ring, &accounting);
        assert_eq!(leaf.up, Some(2));
        assert!(leaf.down.is_empty());
    }

    #[test]
    fn balanced_tree_splits_children() {
        let segs: Vec<Vec<usize>> = (0..4).map(|n| vec![n]).collect();
        let all_topo: Vec<TopoRanks> = (0..4).map(|r| topo_for_segment(&segs[r], r, 1)).collect();
        let accounting = account_nodes(&all_topo, &vec![GraphPattern::BalancedTree; 4]);
        assert_eq!(accounting.n_nodes, 4);
        let ring = build_ring_order(0, &accounting, &all_topo).unwrap();
        let root = build_tree(0, &ring, &accounting);
        assert_eq!(root.down, vec![1, 2]);
        let mid = build_tree(1, &ring, &accounting);
        assert_eq!(mid.up, Some(0));
        assert_eq!(mid.down, vec![3]);
    }
}
