pub mod task;

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use smol::lock::Mutex;
use smol::net::{TcpListener, TcpStream};
use thiserror::Error;

pub use task::{create_root, run_root};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("Bootstrap root received inconsistent rank count of {0} vs {1}")]
    NumRanksMismatch(usize, usize),
    #[error("Bootstrap root received duplicate check-in from rank {0}")]
    DuplicatedCheckIn(usize),
    #[error("Bootstrap root received incorrect rank number {0}")]
    RankOverflow(usize),
    #[error("Received {0} bytes instead of {1} bytes")]
    RecvSizeMismatch(u32, u32),
    #[error("Could not acquire bootstrap ring, only a single outstanding exchange is allowed")]
    RingBusy,
}

/// The shared rendezvous identifier. Rank 0 (or an external launcher) obtains
/// one from [`create_root`] and distributes it out of band; every rank then
/// keys its bootstrap connection on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UniqueId {
    pub addr: SocketAddr,
    pub magic: u64,
}

impl UniqueId {
    /// 64-bit hash of the identifier, mixed into host/process identity hashes
    /// so that concurrent communicators never alias each other's peers.
    pub fn comm_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.addr.hash(&mut hasher);
        self.magic.hash(&mut hasher);
        hasher.finish()
    }
}

pub(crate) struct UnexpectedConn {
    pub stream: TcpStream,
    pub peer: usize,
    pub tag: u32,
}

pub(crate) struct BootstrapRing {
    pub ring_recv: TcpStream,
    pub ring_send: TcpStream,
}

/// Per-rank bootstrap endpoint: a listener for tagged point-to-point
/// exchanges plus the two ring neighbors used by AllGather rounds.
pub struct BootstrapState {
    pub(crate) listener: TcpListener,
    pub(crate) ring: Mutex<BootstrapRing>,
    pub(crate) peer_addrs: Vec<SocketAddr>,
    // The init thread issues at most one outstanding recv, so contention on
    // this queue means a protocol bug, not a scheduling race.
    pub(crate) unexpected_connections: Mutex<Vec<UnexpectedConn>>,
    pub rank: usize,
    pub num_ranks: usize,
    pub magic: u64,
}
