//! End-to-end rendezvous tests: every rank runs on its own thread against a
//! real bootstrap network on loopback, with the host-only device runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use ccomm::comm::{CommInitOptions, CommProfile, PeerInfo};
use ccomm::config::{CommConfig, LaunchMode};
use ccomm::device::{DeviceRuntime, HostRuntime};
use ccomm::graph::FlatTopology;
use ccomm::transport::catalog::TransportCatalog;
use ccomm::transport::channel::{ChannelId, ConnType};
use ccomm::transport::collnet::{CollNetTransport, COLLNET_CATALOG_KEY};
use ccomm::transport::transporter::{AnyResources, ConnectHandle, TransporterError};
use ccomm::{
    comm_abort, comm_count, comm_destroy, comm_init_rank_with, comm_user_rank, get_unique_id_with,
    with_communicator, Comm, ErrorKind,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn init_clique(configs: Vec<CommConfig>, catalog: Option<Arc<TransportCatalog>>) -> Vec<Comm> {
    let num_ranks = configs.len();
    let unique_id = get_unique_id_with(&configs[0]).unwrap();
    let threads: Vec<_> = configs
        .into_iter()
        .enumerate()
        .map(|(rank, config)| {
            let unique_id = unique_id;
            let catalog = catalog.clone();
            std::thread::spawn(move || {
                let channel_count = config.channel_count;
                let mut opts = CommInitOptions::new(config);
                opts.device_runtime = Arc::new(HostRuntime::new(num_ranks as i32));
                opts.topology = Arc::new(FlatTopology::new(channel_count));
                if let Some(catalog) = catalog {
                    opts.catalog = catalog;
                }
                comm_init_rank_with(&unique_id, num_ranks, rank, rank as i32, opts)
            })
        })
        .collect();
    threads
        .into_iter()
        .map(|t| t.join().unwrap().unwrap())
        .collect()
}

#[test]
fn four_ranks_one_host() {
    init_logger();
    let comms = init_clique(vec![CommConfig::default(); 4], None);

    for (rank, comm) in comms.iter().enumerate() {
        assert_eq!(comm_count(*comm).unwrap(), 4);
        assert_eq!(comm_user_rank(*comm).unwrap(), rank);
    }

    let channel_counts: Vec<usize> = comms
        .iter()
        .map(|c| with_communicator(*c, |comm| comm.channels.len()).unwrap())
        .collect();
    assert!(channel_counts.iter().all(|n| *n == channel_counts[0]));
    // default 2 ring channels, duplicated after negotiation
    assert_eq!(channel_counts[0], 4);

    with_communicator(comms[2], |comm| {
        assert_eq!(comm.n_nodes, 1);
        assert!(!comm.collnet_enabled);
        let ring = &comm.channels[0].ring;
        assert_eq!(ring.user_ranks, vec![2, 3, 0, 1]);
        assert_eq!(ring.prev, 1);
        assert_eq!(ring.next, 3);
        // one process, one node: everything connects in-process
        assert!(comm.proxy.is_none());
        assert_eq!(comm.launch_mode, LaunchMode::Group);
    })
    .unwrap();

    let victim = comms[0];
    for comm in comms {
        comm_destroy(comm).unwrap();
    }
    let err = comm_destroy(victim).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn heterogeneous_channel_counts_shrink_uniformly() {
    init_logger();
    let configs = [4u32, 2, 4, 2]
        .iter()
        .map(|n| CommConfig {
            channel_count: *n,
            ..Default::default()
        })
        .collect();
    let comms = init_clique(configs, None);

    for comm in &comms {
        with_communicator(*comm, |comm| {
            // min of the requested counts, duplicated
            assert_eq!(comm.channels.len(), 4);
            for channel in &comm.channels {
                assert_eq!(channel.ring.user_ranks.len(), 4);
            }
        })
        .unwrap();
    }
    for comm in comms {
        comm_destroy(comm).unwrap();
    }
}

fn two_host_configs(collnet: bool) -> Vec<CommConfig> {
    (0..4)
        .map(|rank| CommConfig {
            host_id: Some(if rank < 2 { "host-a" } else { "host-b" }.to_string()),
            collnet_enable: collnet,
            ..Default::default()
        })
        .collect()
}

#[test]
fn two_hosts_build_consistent_trees() {
    init_logger();
    let comms = init_clique(two_host_configs(false), None);

    let nodes: Vec<usize> = comms
        .iter()
        .map(|c| with_communicator(*c, |comm| comm.node).unwrap())
        .collect();
    assert_eq!(nodes, vec![0, 0, 1, 1]);

    for comm in &comms {
        with_communicator(*comm, |comm| {
            assert_eq!(comm.n_nodes, 2);
            assert_eq!(comm.channels[0].ring.user_ranks.len(), 4);
            // crossing node boundaries spawns the proxy
            assert!(comm.proxy.is_some());
        })
        .unwrap();
    }

    // rank 0 roots the two-node tree; the remote head hangs off it
    with_communicator(comms[0], |comm| {
        let tree = &comm.channels[0].tree;
        assert_eq!(tree.up, None);
        assert!(tree.down.contains(&1));
        assert!(tree.down.contains(&2));
    })
    .unwrap();
    with_communicator(comms[2], |comm| {
        let tree = &comm.channels[0].tree;
        assert_eq!(tree.up, Some(0));
        assert_eq!(tree.down, vec![3]);
    })
    .unwrap();
    with_communicator(comms[3], |comm| {
        let tree = &comm.channels[0].tree;
        assert_eq!(tree.up, Some(2));
        assert!(tree.down.is_empty());
    })
    .unwrap();

    for comm in comms {
        comm_destroy(comm).unwrap();
    }
}

/// Device runtime that counts stream drains, to observe teardown ordering.
struct SyncSpy {
    inner: HostRuntime,
    syncs: Arc<AtomicUsize>,
}

impl DeviceRuntime for SyncSpy {
    fn device_count(&self) -> i32 {
        self.inner.device_count()
    }

    fn touch(&self, device: i32) -> ccomm::Result<()> {
        self.inner.touch(device)
    }

    fn comp_cap(&self, device: i32) -> u32 {
        self.inner.comp_cap(device)
    }

    fn bus_id(&self, device: i32) -> u64 {
        self.inner.bus_id(device)
    }

    fn shm_dev(&self) -> u64 {
        self.inner.shm_dev()
    }

    fn gdr_support(&self, device: i32) -> bool {
        self.inner.gdr_support(device)
    }

    fn cooperative_launch_support(&self, device: i32) -> bool {
        self.inner.cooperative_launch_support(device)
    }

    fn stream_synchronize(&self, device: i32) -> ccomm::Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        self.inner.stream_synchronize(device)
    }
}

#[test]
fn abort_only_flips_the_flag() {
    init_logger();
    let config = CommConfig::default();
    let unique_id = get_unique_id_with(&config).unwrap();
    let syncs = Arc::new(AtomicUsize::new(0));
    let mut opts = CommInitOptions::new(config);
    opts.device_runtime = Arc::new(SyncSpy {
        inner: HostRuntime::new(1),
        syncs: Arc::clone(&syncs),
    });
    let comm = comm_init_rank_with(&unique_id, 1, 0, 0, opts).unwrap();

    comm_abort(comm).unwrap();
    // device kernels may still be running: no drain, no release, the
    // handle stays live
    assert_eq!(syncs.load(Ordering::SeqCst), 0);
    with_communicator(comm, |comm| {
        assert_ne!(comm.abort_flag.load(Ordering::SeqCst), 0);
    })
    .unwrap();

    // the orderly teardown still belongs to destroy
    comm_destroy(comm).unwrap();
    assert_eq!(syncs.load(Ordering::SeqCst), 1);
    // stale handles are ignored; abort stays best-effort
    comm_abort(comm).unwrap();
}

struct ConnectRecord {
    rank: usize,
    channel: u32,
    conn_type: ConnType,
    masters: Vec<usize>,
    collnet_rank: usize,
}

#[derive(Default)]
struct CollNetLog {
    connects: Mutex<Vec<ConnectRecord>>,
}

/// Collective-network stand-in: handles carry the setting rank, connects are
/// recorded for inspection, and local setup fails on one designated rank to
/// exercise the all-or-nothing agreement.
struct FlakyCollNet {
    fail_rank: Option<usize>,
    log: Arc<CollNetLog>,
}

impl CollNetTransport for FlakyCollNet {
    fn name(&self) -> &'static str {
        "flaky-collnet"
    }

    fn can_connect(
        &self,
        _my_info: &PeerInfo,
        root_info: &PeerInfo,
        _profile: &CommProfile,
    ) -> bool {
        // the root is the synthetic peer past the real ranks
        root_info.device == -1
    }

    fn setup(
        &self,
        _channel: ChannelId,
        _conn_type: ConnType,
        my_info: &PeerInfo,
        _root_info: &PeerInfo,
        _profile: &CommProfile,
    ) -> Result<(ConnectHandle, AnyResources), TransporterError> {
        if Some(my_info.rank) == self.fail_rank {
            return Err(anyhow!("injected endpoint failure"));
        }
        let handle = ConnectHandle::serialize_from(my_info.rank)?;
        Ok((handle, Box::new(my_info.rank)))
    }

    fn connect(
        &self,
        channel: ChannelId,
        conn_type: ConnType,
        masters: &[ConnectHandle],
        collnet_rank: usize,
        resources: &mut AnyResources,
    ) -> Result<(), TransporterError> {
        let rank = *resources
            .downcast_ref::<usize>()
            .ok_or_else(|| anyhow!("unexpected endpoint resources"))?;
        let decoded = masters
            .iter()
            .map(|h| h.deserialize_to::<usize>())
            .collect::<Result<Vec<_>, _>>()?;
        self.log.connects.lock().unwrap().push(ConnectRecord {
            rank,
            channel: channel.0,
            conn_type,
            masters: decoded,
            collnet_rank,
        });
        Ok(())
    }
}

fn collnet_catalog(fail_rank: Option<usize>) -> (Arc<TransportCatalog>, Arc<CollNetLog>) {
    let log = Arc::new(CollNetLog::default());
    let catalog = Arc::new(TransportCatalog::new());
    let transport: Arc<dyn CollNetTransport> = Arc::new(FlakyCollNet {
        fail_rank,
        log: Arc::clone(&log),
    });
    catalog.register(COLLNET_CATALOG_KEY, transport);
    (catalog, log)
}

/// Collnet endpoints live only on the masters: recv endpoints on the upper
/// channel half, send endpoints on the lower.
fn assert_master_layout(comms: &[Comm], recv_masters: &[usize], send_masters: &[usize]) {
    for comm in comms {
        with_communicator(*comm, |comm| {
            let logic = comm.channels.len() / 2;
            for (c, channel) in comm.channels.iter().enumerate() {
                let recv_expected = c >= logic && recv_masters.contains(&comm.rank);
                let send_expected = c < logic && send_masters.contains(&comm.rank);
                assert_eq!(
                    channel.collnet.recv.is_some(),
                    recv_expected,
                    "recv endpoint, rank {} channel {}",
                    comm.rank,
                    c
                );
                assert_eq!(
                    channel.collnet.send.is_some(),
                    send_expected,
                    "send endpoint, rank {} channel {}",
                    comm.rank,
                    c
                );
            }
        })
        .unwrap();
    }
}

#[test]
fn collnet_connects_masters_with_the_master_table() {
    init_logger();
    let (catalog, log) = collnet_catalog(None);
    let comms = init_clique(two_host_configs(true), Some(catalog));

    for comm in &comms {
        with_communicator(*comm, |comm| assert!(comm.collnet_enabled)).unwrap();
    }
    // segment heads receive, their intra-node neighbors send
    assert_master_layout(&comms, &[0, 2], &[1, 3]);

    let connects = log.connects.lock().unwrap();
    let recvs: Vec<_> = connects
        .iter()
        .filter(|r| r.conn_type == ConnType::Recv)
        .collect();
    // two recv masters, two logical channels
    assert_eq!(recvs.len(), 4);
    for record in &recvs {
        assert!(record.channel >= 2, "recv endpoints sit on the upper half");
        // the consolidated table spans the per-node masters, not one
        // node's local ranks
        assert_eq!(record.masters, vec![0, 2]);
        assert_eq!(record.collnet_rank, if record.rank == 0 { 0 } else { 1 });
    }
    let sends: Vec<_> = connects
        .iter()
        .filter(|r| r.conn_type == ConnType::Send)
        .collect();
    assert_eq!(sends.len(), 4);
    for record in &sends {
        assert!(record.channel < 2, "send endpoints sit on the lower half");
        // the send master reuses its node's collnet rank; the forwarded
        // descriptor is the paired recv master's
        let collnet_rank = if record.rank == 1 { 0 } else { 1 };
        assert_eq!(record.collnet_rank, collnet_rank);
        let recv_master = if record.rank == 1 { 0 } else { 2 };
        assert_eq!(record.masters[collnet_rank], recv_master);
    }
    drop(connects);

    for comm in comms {
        comm_destroy(comm).unwrap();
    }
}

#[test]
fn collnet_single_rank_nodes_master_both_sides() {
    init_logger();
    let (catalog, log) = collnet_catalog(None);
    let configs = ["host-a", "host-b"]
        .iter()
        .map(|h| CommConfig {
            host_id: Some(h.to_string()),
            collnet_enable: true,
            ..Default::default()
        })
        .collect();
    let comms = init_clique(configs, Some(catalog));

    // one rank per node plays both master roles, so the recv-to-send
    // forward stays inside the rank
    for comm in &comms {
        with_communicator(*comm, |comm| {
            assert!(comm.collnet_enabled);
            let logic = comm.channels.len() / 2;
            for (c, channel) in comm.channels.iter().enumerate() {
                assert_eq!(channel.collnet.recv.is_some(), c >= logic);
                assert_eq!(channel.collnet.send.is_some(), c < logic);
            }
        })
        .unwrap();
    }
    let connects = log.connects.lock().unwrap();
    for record in connects.iter().filter(|r| r.conn_type == ConnType::Recv) {
        assert_eq!(record.masters, vec![0, 1]);
    }
    drop(connects);

    for comm in comms {
        comm_destroy(comm).unwrap();
    }
}

#[test]
fn collnet_masters_follow_compacted_channels() {
    init_logger();
    let (catalog, _log) = collnet_catalog(None);
    let configs = [4u32, 2, 4, 2]
        .iter()
        .enumerate()
        .map(|(rank, n)| CommConfig {
            host_id: Some(if rank < 2 { "host-a" } else { "host-b" }.to_string()),
            collnet_enable: true,
            channel_count: *n,
            ..Default::default()
        })
        .collect();
    let comms = init_clique(configs, Some(catalog));

    for comm in &comms {
        with_communicator(*comm, |comm| {
            assert!(comm.collnet_enabled);
            // negotiated down to 2 logical channels, then duplicated
            assert_eq!(comm.channels.len(), 4);
        })
        .unwrap();
    }
    // master selection reads the compacted segments, so the shrink must
    // not shift it
    assert_master_layout(&comms, &[0, 2], &[1, 3]);

    for comm in comms {
        comm_destroy(comm).unwrap();
    }
}

#[test]
fn collnet_failure_on_one_rank_disables_all() {
    init_logger();
    let (catalog, _log) = collnet_catalog(Some(3));
    let comms = init_clique(two_host_configs(true), Some(catalog));

    for comm in &comms {
        with_communicator(*comm, |comm| {
            assert!(!comm.collnet_enabled);
            // degrade frees every endpoint, on healthy ranks too
            for channel in &comm.channels {
                assert!(channel.collnet.send.is_none());
                assert!(channel.collnet.recv.is_none());
            }
        })
        .unwrap();
    }
    for comm in comms {
        comm_destroy(comm).unwrap();
    }
}
