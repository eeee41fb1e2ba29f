use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::intra;
use super::{
    AsyncErrorSlot, CommProfile, Communicator, CommunicatorId, PeerInfo, MAX_CHANNELS,
};
use crate::bootstrap::{BootstrapState, UniqueId};
use crate::config::CommConfig;
use crate::device::{DeviceRuntime, HostRuntime};
use crate::error::{CommError, Result};
use crate::graph::{self, FlatTopology, GraphInfo, GraphSpec, TopoRanks, TopologyBuilder};
use crate::pattern::{GraphPattern, RingPattern};
use crate::proxy::ProxyHandle;
use crate::transport::catalog::TransportCatalog;
use crate::transport::channel::{ChannelId, CommChannel, ConnType, PeerConnId};
use crate::transport::collnet::{self, CollNetSetupArgs, CollNetTransport, COLLNET_CATALOG_KEY};
use crate::transport::setup::TransportConnectState;
use crate::transport::compute_buff_sizes;
use crate::utils::affinity::AffinityGuard;

/// Everything injectable about communicator construction. Defaults give a
/// host-only communicator on a flat topology, which is what the tests and
/// single-host smoke deployments use.
#[derive(Clone)]
pub struct CommInitOptions {
    pub config: CommConfig,
    pub device_runtime: Arc<dyn DeviceRuntime>,
    pub topology: Arc<dyn TopologyBuilder>,
    pub catalog: Arc<TransportCatalog>,
}

impl CommInitOptions {
    pub fn new(config: CommConfig) -> Self {
        let channel_count = config.channel_count;
        CommInitOptions {
            config,
            device_runtime: Arc::new(HostRuntime::default()),
            topology: Arc::new(FlatTopology::new(channel_count)),
            catalog: Arc::new(TransportCatalog::new()),
        }
    }
}

impl Default for CommInitOptions {
    fn default() -> Self {
        CommInitOptions::new(CommConfig::default())
    }
}

/// Host identity hash. The communicator hash is mixed in so two concurrent
/// jobs on one machine never treat each other's ranks as local; the override
/// replaces the machine identity, for containers that share one.
fn compute_host_hash(override_id: Option<&str>, comm_hash: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    match override_id {
        Some(id) => id.hash(&mut hasher),
        None => {
            if let Ok(machine_id) = std::fs::read_to_string("/etc/machine-id") {
                machine_id.trim().hash(&mut hasher);
            }
            if let Ok(hostname) = nix::unistd::gethostname() {
                hostname.hash(&mut hasher);
            }
        }
    }
    comm_hash.hash(&mut hasher);
    hasher.finish()
}

/// Process identity hash: the pid plus the pid namespace, so two containers
/// reusing pid 1 still differ.
fn compute_pid_hash() -> u64 {
    let mut hasher = DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    if let Ok(ns) = std::fs::read_link("/proc/self/ns/pid") {
        ns.hash(&mut hasher);
    }
    hasher.finish()
}

/// Two ranks on one device cannot make progress: they would deadlock inside
/// collective kernels. Rejected up front as a usage error.
pub(crate) fn check_duplicate_devices(peers: &[PeerInfo]) -> Result<()> {
    for (i, a) in peers.iter().enumerate() {
        for b in peers.iter().skip(i + 1) {
            if a.host_hash == b.host_hash && a.bus_id == b.bus_id {
                return Err(CommError::InvalidUsage(format!(
                    "duplicate device: ranks {} and {} both use bus id {:#x}",
                    a.rank, b.rank, a.bus_id
                )));
            }
        }
    }
    Ok(())
}

fn count_hosts(peers: &[PeerInfo]) -> usize {
    let mut hosts: Vec<u64> = peers.iter().map(|p| p.host_hash).collect();
    hosts.sort_unstable();
    hosts.dedup();
    hosts.len()
}

/// Inter-node tree shape: a plain chain of nodes is fine for two nodes, a
/// balanced binary tree bounds depth beyond that.
pub(crate) fn select_tree_pattern(n_hosts: usize) -> GraphPattern {
    if n_hosts <= 2 {
        GraphPattern::Tree
    } else {
        GraphPattern::BalancedTree
    }
}

/// Per-rank contribution to the parameter-negotiation gather. Fixed-size by
/// construction, like every record the ring AllGather carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RankParams {
    pub comp_cap: u32,
    pub n_channels: u32,
    pub tree_pattern: GraphPattern,
    pub ring: GraphInfo,
    pub tree: GraphInfo,
    pub collnet: GraphInfo,
    pub collnet_support: bool,
    pub topo: TopoRanks,
}

pub(crate) struct Reconciled {
    pub n_channels: usize,
    pub ring: GraphInfo,
    pub tree: GraphInfo,
    pub collnet: GraphInfo,
    pub min_comp_cap: u32,
    pub max_comp_cap: u32,
    pub collnet_all: bool,
}

/// Folds every rank's parameters down to the common denominator. Pure and
/// order-insensitive: every rank runs this over the identical array and must
/// reach the identical result.
pub(crate) fn reconcile(params: &[RankParams]) -> Reconciled {
    let mut n_channels = params[0].n_channels as usize;
    let mut ring = params[0].ring;
    let mut tree = params[0].tree;
    let mut collnet = params[0].collnet;
    let mut min_comp_cap = params[0].comp_cap;
    let mut max_comp_cap = params[0].comp_cap;
    let mut collnet_all = params[0].collnet_support;
    for p in params.iter().skip(1) {
        n_channels = n_channels.min(p.n_channels as usize);
        ring.merge_min(&p.ring);
        tree.merge_min(&p.tree);
        collnet.merge_min(&p.collnet);
        min_comp_cap = min_comp_cap.min(p.comp_cap);
        max_comp_cap = max_comp_cap.max(p.comp_cap);
        collnet_all &= p.collnet_support;
    }
    Reconciled {
        n_channels,
        ring,
        tree,
        collnet,
        min_comp_cap,
        max_comp_cap,
        collnet_all,
    }
}

fn internal<T: std::fmt::Display>(what: &str, detail: T) -> CommError {
    CommError::InternalError(format!("{}: {}", what, detail))
}

/// The full rendezvous: bootstrap, identity gather, topology negotiation,
/// channel materialization and transport establishment. Returns a ready
/// communicator; any error leaves no background state behind apart from the
/// bootstrap sockets, which close on drop.
pub(crate) async fn init_transports_rank(
    unique_id: &UniqueId,
    rank: usize,
    num_ranks: usize,
    device: i32,
    opts: &CommInitOptions,
) -> Result<Communicator> {
    if num_ranks < 1 {
        return Err(CommError::InvalidArgument(format!(
            "invalid rank count {}",
            num_ranks
        )));
    }
    if rank >= num_ranks {
        return Err(CommError::InvalidArgument(format!(
            "rank {} out of range for {} ranks",
            rank, num_ranks
        )));
    }
    let runtime = &opts.device_runtime;
    if device < 0 || device >= runtime.device_count() {
        return Err(CommError::InvalidArgument(format!(
            "device {} out of range",
            device
        )));
    }
    // probe the device before any distributed state exists
    runtime.touch(device)?;

    let config = &opts.config;
    let id = CommunicatorId(unique_id.comm_hash());
    log::info!(
        "comm {} rank {} of {} device {} starting init",
        id,
        rank,
        num_ranks,
        device
    );

    let listen_addr = SocketAddr::new(config.listen_addr, 0);
    let bootstrap = Arc::new(BootstrapState::init(unique_id, listen_addr, rank, num_ranks).await?);

    let my_info = PeerInfo {
        rank,
        device,
        host_hash: compute_host_hash(config.host_id.as_deref(), id.0),
        pid_hash: compute_pid_hash(),
        bus_id: runtime.bus_id(device),
        shm_dev: runtime.shm_dev(),
        gdr_support: runtime.gdr_support(device),
        comp_cap: runtime.comp_cap(device),
    };

    // identity gather
    let my_info_bytes =
        bincode::serialize(&my_info).map_err(|e| internal("encode peer info", e))?;
    let gathered = bootstrap.all_gather(&my_info_bytes).await?;
    let slice = my_info_bytes.len();
    let mut peers_info = Vec::with_capacity(num_ranks);
    for r in 0..num_ranks {
        let info: PeerInfo = bincode::deserialize(&gathered[r * slice..(r + 1) * slice])
            .map_err(|e| internal("decode peer info", e))?;
        if info.rank != r {
            return Err(internal(
                "peer info out of order",
                format!("slot {} holds rank {}", r, info.rank),
            ));
        }
        peers_info.push(info);
    }
    check_duplicate_devices(&peers_info)?;

    let topology = &opts.topology;
    let mut system = topology.build_system(rank, &peers_info)?;
    topology.compute_paths(&mut system, &peers_info)?;
    topology.trim_unreachable(&mut system)?;
    let cpu_arch = topology.cpu_arch(&system);

    // hold the device-local CPU affinity for the duration of setup so that
    // bounce buffers land on the right NUMA node; restored on return
    let _affinity = AffinityGuard::pin(&topology.device_affinity(&system, device));

    let n_hosts = count_hosts(&peers_info);
    let tree_pattern = select_tree_pattern(n_hosts);
    let max_per_graph = MAX_CHANNELS / 2;
    let mut ring_graph = topology.compute_graph(
        &system,
        &GraphSpec {
            pattern: GraphPattern::Ring,
            collnet: false,
            min_channels: 1,
            max_channels: max_per_graph,
            cross_nic: config.cross_nic,
        },
    )?;
    let mut tree_graph = topology.compute_graph(
        &system,
        &GraphSpec {
            pattern: tree_pattern,
            collnet: false,
            min_channels: 1,
            max_channels: ring_graph.n_channels,
            cross_nic: config.cross_nic,
        },
    )?;
    let mut collnet_graph = topology.compute_graph(
        &system,
        &GraphSpec {
            pattern: GraphPattern::Ring,
            collnet: true,
            min_channels: 1,
            max_channels: ring_graph.n_channels,
            cross_nic: config.cross_nic,
        },
    )?;

    let buff_sizes = compute_buff_sizes(config, cpu_arch);
    let profile = CommProfile {
        buff_sizes,
        listen_addr: config.listen_addr,
        collnet_enable: config.collnet_enable,
        cross_nic: config.cross_nic,
        channel_count: config.channel_count,
        launch_mode: config.launch_mode,
    };

    let (my_topo, mut segments) = graph::preset(rank, &ring_graph)?;

    let collnet_transport = opts
        .catalog
        .get::<Arc<dyn CollNetTransport>>(COLLNET_CATALOG_KEY)
        .ok()
        .map(|t| t.value().clone());
    let collnet_root = collnet::synthetic_root(num_ranks);
    let collnet_support = config.collnet_enable
        && collnet_transport
            .as_ref()
            .map(|t| t.can_connect(&my_info, &collnet_root, &profile))
            .unwrap_or(false);

    // parameter negotiation gather
    let my_params = RankParams {
        comp_cap: my_info.comp_cap,
        n_channels: ring_graph.n_channels as u32,
        tree_pattern,
        ring: GraphInfo::from_graph(&ring_graph),
        tree: GraphInfo::from_graph(&tree_graph),
        collnet: GraphInfo::from_graph(&collnet_graph),
        collnet_support,
        topo: my_topo.clone(),
    };
    let my_params_bytes =
        bincode::serialize(&my_params).map_err(|e| internal("encode rank params", e))?;
    let gathered = bootstrap.all_gather(&my_params_bytes).await?;
    let slice = my_params_bytes.len();
    let mut all_params = Vec::with_capacity(num_ranks);
    for r in 0..num_ranks {
        let params: RankParams = bincode::deserialize(&gathered[r * slice..(r + 1) * slice])
            .map_err(|e| internal("decode rank params", e))?;
        all_params.push(params);
    }

    let c0 = ring_graph.n_channels;
    let reconciled = reconcile(&all_params);
    let c1 = reconciled.n_channels;
    if c1 < c0 {
        log::info!(
            "comm {} rank {}: channel count reduced {} -> {} by slower peer",
            id,
            rank,
            c0,
            c1
        );
        graph::compact_channels(&mut segments, c0, c1);
    }
    let n_channels = (2 * c1).min(MAX_CHANNELS);

    // from here on, every rank works with the agreed worst-case parameters
    reconciled.ring.apply_to(&mut ring_graph);
    reconciled.tree.apply_to(&mut tree_graph);
    reconciled.collnet.apply_to(&mut collnet_graph);
    ring_graph.n_channels = c1;
    tree_graph.n_channels = tree_graph.n_channels.min(c1);
    collnet_graph.n_channels = collnet_graph.n_channels.min(c1);

    let all_topo: Vec<TopoRanks> = all_params.iter().map(|p| p.topo.clone()).collect();
    let all_patterns: Vec<GraphPattern> = all_params.iter().map(|p| p.tree_pattern).collect();
    let accounting = graph::account_nodes(&all_topo, &all_patterns);
    let n_nodes = accounting.n_nodes;
    let node = accounting.node_of_rank[rank];
    let local_ranks: Vec<usize> = (0..num_ranks)
        .filter(|r| accounting.node_of_rank[*r] == node)
        .collect();
    let local_rank = local_ranks
        .iter()
        .position(|r| *r == rank)
        .ok_or_else(|| internal("node accounting", "local rank missing from own node"))?;
    log::debug!(
        "comm {} rank {}: node {}/{}, {} local ranks",
        id,
        rank,
        node,
        n_nodes,
        local_ranks.len()
    );

    // materialize channels from the stitched rings
    let mut ring_orders = Vec::with_capacity(c1);
    for c in 0..c1 {
        ring_orders.push(graph::build_ring_order(c, &accounting, &all_topo)?);
    }
    let mut channels = Vec::with_capacity(n_channels);
    for c in 0..n_channels {
        let order = &ring_orders[c % c1];
        let ring = RingPattern::from_ring_order(rank, order)
            .ok_or_else(|| internal("ring build", format!("rank missing on channel {}", c)))?;
        let tree = graph::build_tree(rank, order, &accounting);
        log::trace!(
            "comm {} rank {} channel {}: ring prev {} next {}, tree up {:?} down {:?}",
            id,
            rank,
            c,
            ring.prev,
            ring.next,
            tree.up,
            tree.down
        );
        let mut channel = CommChannel::new(ChannelId(c as u32), ring, tree);
        channel.collnet.chain = graph::build_collnet_chain(rank, &segments[c]);
        channels.push(channel);
    }

    // establish ring and tree links in one phase; the masks deduplicate
    // overlap between the two patterns
    let mut connect_state = TransportConnectState::new(rank, num_ranks, n_channels);
    for channel in &channels {
        let c = channel.id;
        for (peer, conn_type) in [
            (Some(channel.ring.prev), ConnType::Recv),
            (Some(channel.ring.next), ConnType::Send),
            (channel.tree.up, ConnType::Recv),
            (channel.tree.up, ConnType::Send),
        ] {
            if let Some(peer_rank) = peer {
                connect_state.register_connect(&PeerConnId {
                    peer_rank,
                    channel: c,
                    conn_type,
                });
            }
        }
        for down in &channel.tree.down {
            for conn_type in [ConnType::Recv, ConnType::Send] {
                connect_state.register_connect(&PeerConnId {
                    peer_rank: *down,
                    channel: c,
                    conn_type,
                });
            }
        }
    }
    let connected = connect_state
        .connect_all(&bootstrap, 0, &peers_info, &profile, &opts.catalog)
        .await
        .map_err(CommError::Transport)?;
    for (conn_id, connector) in connected {
        channels[conn_id.channel.0 as usize].install_connector(
            conn_id.peer_rank,
            conn_id.conn_type,
            connector,
        );
    }

    // collective network: worthwhile only across nodes, and only if every
    // rank both asked for it and can reach it
    let mut collnet_enabled = false;
    if reconciled.collnet_all && n_nodes > 1 {
        if let Some(transport) = &collnet_transport {
            // recv master is the head of the local segment; the send master
            // sits next to it unless the collnet graph is tree-shaped
            let send_index = if collnet_graph.pattern == GraphPattern::Tree {
                0
            } else {
                1
            };
            let masters: Vec<(usize, usize)> = segments[..n_channels / 2]
                .iter()
                .map(|seg| (seg[0], seg[send_index.min(seg.len() - 1)]))
                .collect();
            collnet_enabled = collnet::setup_collnet(
                &bootstrap,
                transport,
                CollNetSetupArgs {
                    rank,
                    num_ranks,
                    n_masters: n_nodes,
                    masters,
                },
                &mut channels,
                &peers_info,
                &profile,
            )
            .await
            .map_err(CommError::Transport)?;
        }
    }

    // agree on the launch mode with the ranks sharing this process
    let intra_peers: Vec<usize> = local_ranks
        .iter()
        .copied()
        .filter(|r| peers_info[*r].pid_hash == my_info.pid_hash)
        .collect();
    let intra_rank = intra_peers
        .iter()
        .position(|r| *r == rank)
        .ok_or_else(|| internal("intra grouping", "rank missing from own process group"))?;
    let intra_state = intra::join(
        id,
        &my_info,
        intra_rank,
        intra_peers.len(),
        runtime.cooperative_launch_support(device),
        config.launch_mode,
    );

    let tuning = topology.tune_model(
        &system,
        reconciled.min_comp_cap,
        reconciled.max_comp_cap,
        [&tree_graph, &ring_graph, &collnet_graph],
    );
    let p2p_channel_count = topology.p2p_channel_count(&system, c1);

    let abort_flag = Arc::new(AtomicU32::new(0));
    let proxy = if n_nodes > 1 {
        Some(ProxyHandle::spawn(rank, Arc::clone(&abort_flag)))
    } else {
        None
    };

    // closing barrier: nobody returns until everyone finished connecting
    bootstrap.all_gather(&[0u8]).await?;

    log::info!(
        "comm {} rank {} of {} device {} bus {:#x} - init complete ({} channels, {} nodes, collnet {})",
        id,
        rank,
        num_ranks,
        device,
        my_info.bus_id,
        n_channels,
        n_nodes,
        if collnet_enabled { "on" } else { "off" }
    );

    Ok(Communicator {
        id,
        rank,
        num_ranks,
        device,
        device_runtime: Arc::clone(runtime),
        peers_info,
        channels,
        n_nodes,
        node,
        local_ranks,
        local_rank,
        min_comp_cap: reconciled.min_comp_cap,
        max_comp_cap: reconciled.max_comp_cap,
        buff_sizes,
        p2p_channel_count,
        tuning,
        collnet_enabled,
        collnet_transport,
        launch_mode: intra_state.launch_mode,
        bootstrap,
        proxy,
        abort_flag,
        async_error: Arc::new(AsyncErrorSlot::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LinkType;

    fn peer(rank: usize, host_hash: u64, bus_id: u64) -> PeerInfo {
        PeerInfo {
            rank,
            device: rank as i32,
            host_hash,
            pid_hash: 1,
            bus_id,
            shm_dev: 0,
            gdr_support: false,
            comp_cap: 80,
        }
    }

    #[test]
    fn duplicate_device_is_a_usage_error() {
        let peers = vec![peer(0, 7, 0x10), peer(1, 7, 0x10)];
        let err = check_duplicate_devices(&peers).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidUsage);
    }

    #[test]
    fn same_bus_id_on_other_host_is_fine() {
        let peers = vec![peer(0, 7, 0x10), peer(1, 8, 0x10)];
        assert!(check_duplicate_devices(&peers).is_ok());
    }

    #[test]
    fn host_hash_mixes_override_and_comm() {
        let a = compute_host_hash(Some("host-a"), 1);
        assert_eq!(a, compute_host_hash(Some("host-a"), 1));
        assert_ne!(a, compute_host_hash(Some("host-b"), 1));
        assert_ne!(a, compute_host_hash(Some("host-a"), 2));
        // the machine-identity path is deterministic as well
        assert_eq!(compute_host_hash(None, 7), compute_host_hash(None, 7));
    }

    #[test]
    fn tree_pattern_follows_node_count() {
        assert_eq!(select_tree_pattern(1), GraphPattern::Tree);
        assert_eq!(select_tree_pattern(2), GraphPattern::Tree);
        assert_eq!(select_tree_pattern(3), GraphPattern::BalancedTree);
        assert_eq!(select_tree_pattern(16), GraphPattern::BalancedTree);
    }

    fn rank_params(comp_cap: u32, n_channels: u32, speed: f32, collnet: bool) -> RankParams {
        let info = GraphInfo {
            pattern: GraphPattern::Ring,
            same_channels: true,
            speed_intra: speed,
            speed_inter: speed,
            type_intra: LinkType::Pci,
            type_inter: LinkType::Net,
        };
        RankParams {
            comp_cap,
            n_channels,
            tree_pattern: GraphPattern::Tree,
            ring: info,
            tree: info,
            collnet: info,
            collnet_support: collnet,
            topo: TopoRanks {
                ring_recv: [0; MAX_CHANNELS],
                ring_send: [0; MAX_CHANNELS],
                ring_prev: [0; MAX_CHANNELS],
                ring_next: [0; MAX_CHANNELS],
            },
        }
    }

    #[test]
    fn reconcile_takes_worst_case_everywhere() {
        let params = vec![
            rank_params(90, 4, 24.0, true),
            rank_params(70, 2, 12.0, true),
            rank_params(80, 4, 18.0, false),
        ];
        let r = reconcile(&params);
        assert_eq!(r.n_channels, 2);
        assert_eq!(r.min_comp_cap, 70);
        assert_eq!(r.max_comp_cap, 90);
        assert_eq!(r.ring.speed_intra, 12.0);
        assert!(!r.collnet_all);
    }

    #[test]
    fn reconcile_is_permutation_invariant() {
        let mut params = vec![
            rank_params(90, 4, 24.0, true),
            rank_params(70, 2, 12.0, true),
            rank_params(80, 8, 18.0, true),
        ];
        let a = reconcile(&params);
        params.rotate_left(1);
        let b = reconcile(&params);
        assert_eq!(a.n_channels, b.n_channels);
        assert_eq!(a.min_comp_cap, b.min_comp_cap);
        assert_eq!(a.ring.speed_intra, b.ring.speed_intra);
    }
}
