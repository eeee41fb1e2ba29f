use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use once_cell::sync::Lazy;

use super::{CommunicatorId, PeerInfo};
use crate::config::LaunchMode;

/// Process-wide registry coordinating ranks of one communicator that share a
/// process. The first local rank to arrive publishes the group entry, later
/// ranks adopt it; every rank votes on cooperative launch, and the mode is
/// resolved once the last rank arrived. The last rank to leave frees the
/// entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct IntraKey {
    id: CommunicatorId,
    host_hash: u64,
    pid_hash: u64,
}

struct IntraEntry {
    expected: usize,
    arrived: usize,
    departed: usize,
    all_cooperative: bool,
    comp_cap: u32,
    resolved_mode: Option<LaunchMode>,
}

static REGISTRY: Lazy<Mutex<HashMap<IntraKey, IntraEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static ARRIVALS: Lazy<Condvar> = Lazy::new(Condvar::new);

/// The local rank's view of its intra-process group after everyone arrived.
#[derive(Debug, Clone, Copy)]
pub struct IntraNodeState {
    pub intra_rank: usize,
    pub intra_ranks: usize,
    pub launch_mode: LaunchMode,
}

fn key_for(id: CommunicatorId, peer: &PeerInfo) -> IntraKey {
    IntraKey {
        id,
        host_hash: peer.host_hash,
        pid_hash: peer.pid_hash,
    }
}

/// Blocks until every rank of the local group checked in, then returns the
/// agreed state. Cooperative launch is used only when every local rank's
/// device supports it, all their compute capabilities match, and no rank
/// asked for parallel launches.
pub fn join(
    id: CommunicatorId,
    peer: &PeerInfo,
    intra_rank: usize,
    intra_ranks: usize,
    cooperative_support: bool,
    preferred_mode: Option<LaunchMode>,
) -> IntraNodeState {
    let key = key_for(id, peer);
    let mut registry = REGISTRY.lock().unwrap();
    {
        let entry = registry.entry(key).or_insert_with(|| IntraEntry {
            expected: intra_ranks,
            arrived: 0,
            departed: 0,
            all_cooperative: true,
            comp_cap: peer.comp_cap,
            resolved_mode: None,
        });
        entry.arrived += 1;
        entry.all_cooperative &= cooperative_support;
        if peer.comp_cap != entry.comp_cap {
            // mixed device generations cannot share one cooperative launch
            entry.all_cooperative = false;
        }
        if preferred_mode == Some(LaunchMode::Parallel) {
            entry.all_cooperative = false;
        }
        if entry.arrived == entry.expected {
            entry.resolved_mode = Some(if entry.all_cooperative {
                LaunchMode::Group
            } else {
                LaunchMode::Parallel
            });
            ARRIVALS.notify_all();
        }
    }
    loop {
        if let Some(mode) = registry.get(&key).and_then(|e| e.resolved_mode) {
            return IntraNodeState {
                intra_rank,
                intra_ranks,
                launch_mode: mode,
            };
        }
        registry = ARRIVALS.wait(registry).unwrap();
    }
}

/// Departure counterpart of `join`; the last local rank out removes the
/// shared entry.
pub fn leave(id: CommunicatorId, peer: &PeerInfo) {
    let key = key_for(id, peer);
    let mut registry = REGISTRY.lock().unwrap();
    let remove = match registry.get_mut(&key) {
        Some(entry) => {
            entry.departed += 1;
            entry.departed == entry.expected
        }
        None => false,
    };
    if remove {
        registry.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(rank: usize, pid_hash: u64) -> PeerInfo {
        peer_with_cap(rank, pid_hash, 80)
    }

    fn peer_with_cap(rank: usize, pid_hash: u64, comp_cap: u32) -> PeerInfo {
        PeerInfo {
            rank,
            device: rank as i32,
            host_hash: 0x42,
            pid_hash,
            bus_id: rank as u64,
            shm_dev: 0,
            gdr_support: false,
            comp_cap,
        }
    }

    #[test]
    fn group_mode_requires_unanimous_support() {
        let id = CommunicatorId(0xA1);
        let handles: Vec<_> = (0..2)
            .map(|r| {
                std::thread::spawn(move || {
                    // rank 1's device lacks cooperative launch
                    join(id, &peer(r, 7), r, 2, r == 0, None)
                })
            })
            .collect();
        for handle in handles {
            let state = handle.join().unwrap();
            assert_eq!(state.launch_mode, LaunchMode::Parallel);
        }
        leave(id, &peer(0, 7));
        leave(id, &peer(1, 7));
    }

    #[test]
    fn mixed_compute_capabilities_force_parallel() {
        let id = CommunicatorId(0xA3);
        let handles: Vec<_> = (0..2)
            .map(|r| {
                std::thread::spawn(move || {
                    // both devices support cooperative launch, but they are
                    // of different generations
                    let cap = if r == 0 { 80 } else { 70 };
                    join(id, &peer_with_cap(r, 11, cap), r, 2, true, None)
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().launch_mode, LaunchMode::Parallel);
        }
        for r in 0..2 {
            leave(id, &peer(r, 11));
        }
    }

    #[test]
    fn unanimous_support_resolves_to_group() {
        let id = CommunicatorId(0xA2);
        let handles: Vec<_> = (0..3)
            .map(|r| std::thread::spawn(move || join(id, &peer(r, 9), r, 3, true, None)))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().launch_mode, LaunchMode::Group);
        }
        for r in 0..3 {
            leave(id, &peer(r, 9));
        }
    }
}
