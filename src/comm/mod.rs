use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bootstrap::BootstrapState;
use crate::config::LaunchMode;
use crate::device::DeviceRuntime;
use crate::error::{CommError, Result};
use crate::graph::TuningModel;
use crate::proxy::ProxyHandle;
use crate::transport::channel::CommChannel;
use crate::transport::collnet::CollNetTransport;
use crate::transport::NUM_PROTOCOLS;

pub mod init;
pub mod intra;

pub use init::CommInitOptions;

pub const MAX_CHANNELS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommunicatorId(pub u64);

impl fmt::Display for CommunicatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity record published by every rank in the first gather. All fields
/// are fixed-size scalars so each rank contributes an equal wire slice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeerInfo {
    pub rank: usize,
    pub device: i32,
    /// Hash of the host identity; equal for ranks on the same machine.
    pub host_hash: u64,
    /// Hash of the process identity; equal for ranks in the same process.
    pub pid_hash: u64,
    pub bus_id: u64,
    /// Device number of the shared-memory mount, for container detection.
    pub shm_dev: u64,
    pub gdr_support: bool,
    /// Compute capability, major * 10 + minor.
    pub comp_cap: u32,
}

/// Settings shared by transport selection and setup, frozen at init.
#[derive(Debug, Clone)]
pub struct CommProfile {
    pub buff_sizes: [usize; NUM_PROTOCOLS],
    /// Address network transport listeners bind to.
    pub listen_addr: IpAddr,
    pub collnet_enable: bool,
    pub cross_nic: u8,
    pub channel_count: u32,
    pub launch_mode: Option<LaunchMode>,
}

/// Rendezvous-time errors observed outside a blocking call, kept for
/// later async queries. The first fatal error sticks.
pub struct AsyncErrorSlot {
    kind: AtomicU32,
}

const ASYNC_OK: u32 = 0;

impl AsyncErrorSlot {
    pub fn new() -> Self {
        AsyncErrorSlot {
            kind: AtomicU32::new(ASYNC_OK),
        }
    }

    pub fn record(&self, err: &CommError) {
        let code = err.kind() as u32 + 1;
        let _ = self
            .kind
            .compare_exchange(ASYNC_OK, code, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn get(&self) -> Option<crate::error::ErrorKind> {
        match self.kind.load(Ordering::Acquire) {
            ASYNC_OK => None,
            code => crate::error::ErrorKind::from_code(code - 1),
        }
    }
}

impl Default for AsyncErrorSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully established communicator: bootstrap network, channel patterns and
/// per-peer transport connections, ready for the data plane.
pub struct Communicator {
    pub id: CommunicatorId,
    pub rank: usize,
    pub num_ranks: usize,
    pub device: i32,
    pub device_runtime: Arc<dyn DeviceRuntime>,

    pub peers_info: Vec<PeerInfo>,
    pub channels: Vec<CommChannel>,

    pub n_nodes: usize,
    pub node: usize,
    /// Ranks on this rank's node, ascending.
    pub local_ranks: Vec<usize>,
    /// This rank's position within `local_ranks`.
    pub local_rank: usize,

    pub min_comp_cap: u32,
    pub max_comp_cap: u32,
    pub buff_sizes: [usize; NUM_PROTOCOLS],
    pub p2p_channel_count: usize,
    pub tuning: TuningModel,
    pub collnet_enabled: bool,
    pub collnet_transport: Option<Arc<dyn CollNetTransport>>,
    pub launch_mode: LaunchMode,

    pub bootstrap: Arc<BootstrapState>,
    pub proxy: Option<ProxyHandle>,
    pub abort_flag: Arc<AtomicU32>,
    pub async_error: Arc<AsyncErrorSlot>,
}

impl Communicator {
    pub fn user_rank(&self) -> usize {
        self.rank
    }

    pub fn count(&self) -> usize {
        self.num_ranks
    }

    pub fn device_index(&self) -> i32 {
        self.device
    }

    /// Flags in-flight setup and proxy work to bail out at the next
    /// cancellation point. Resources are reclaimed by the destroy path.
    pub fn abort(&self) {
        self.abort_flag.store(1, Ordering::Release);
    }

    /// Tears the communicator down in dependency order: drain outstanding
    /// device work, stop the proxy, release transport resources, then drop
    /// the intra-node membership so the last local rank can free shared
    /// state.
    pub fn destroy(mut self) -> Result<()> {
        self.device_runtime.stream_synchronize(self.device)?;
        if let Some(proxy) = self.proxy.take() {
            proxy.shutdown();
        }
        if let Some(transport) = &self.collnet_transport {
            crate::transport::collnet::release_collnet(transport.as_ref(), &mut self.channels)
                .map_err(CommError::Transport)?;
        }
        for channel in self.channels.drain(..) {
            channel
                .release()
                .map_err(|e| CommError::InternalError(e.to_string()))?;
        }
        intra::leave(self.id, &self.peers_info[self.rank]);
        log::info!(
            "comm {} rank {} of {} destroyed",
            self.id,
            self.rank,
            self.num_ranks
        );
        Ok(())
    }
}
