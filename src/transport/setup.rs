use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::catalog::TransportCatalog;
use super::channel::{ChannelId, ConnType, PeerConnId, PeerConnector};
use super::transporter::{
    AnyResources, ConnectHandle, Transporter, TransporterError, CONNECT_HANDLE_SIZE,
};
use super::ALL_TRANSPORTERS;
use crate::bootstrap::{BootstrapError, BootstrapState};
use crate::comm::{CommProfile, PeerInfo};

#[derive(Debug, Error)]
pub enum TransportConnectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transporter error: {0}")]
    Transporter(#[from] TransporterError),
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("No transport found for rank {0} -> rank {1}")]
    NoTransportFound(usize, usize),
    #[error("Connection {0:?} not found")]
    ConnectionNotFound(PeerConnId),
}

struct PeerConnConstructor {
    transporter: &'static dyn Transporter,
    resources: Option<AnyResources>,
}

/// Accumulates requested peer connections as per-peer channel bitmasks, then
/// establishes them in three phases: local setup, a round-ordered handle
/// exchange over bootstrap, and local connect. Both ends of a link finish
/// setup before either end connects, because the handles cross during the
/// exchange.
pub struct TransportConnectState {
    num_channels: usize,
    rank: usize,
    num_ranks: usize,

    // per-peer bitmask of channels to connect
    send_connect_mask: Vec<u64>,
    recv_connect_mask: Vec<u64>,

    transporter_map: HashMap<PeerConnId, &'static dyn Transporter>,
    peer_setup: HashMap<PeerConnId, PeerConnConstructor>,
    // round index -> handles produced by setup, awaiting exchange
    handle_to_exchange: Vec<HashMap<PeerConnId, ConnectHandle>>,
}

fn select_transport(
    send_peer: &PeerInfo,
    recv_peer: &PeerInfo,
    profile: &CommProfile,
    catalog: &TransportCatalog,
) -> Result<&'static dyn Transporter, TransportConnectError> {
    for transporter in ALL_TRANSPORTERS.iter() {
        if transporter.can_connect(send_peer, recv_peer, profile, catalog) {
            return Ok(*transporter);
        }
    }
    Err(TransportConnectError::NoTransportFound(
        send_peer.rank,
        recv_peer.rank,
    ))
}

impl TransportConnectState {
    pub fn new(rank: usize, num_ranks: usize, num_channels: usize) -> Self {
        TransportConnectState {
            num_channels,
            rank,
            num_ranks,
            send_connect_mask: vec![0; num_ranks],
            recv_connect_mask: vec![0; num_ranks],
            transporter_map: HashMap::new(),
            peer_setup: HashMap::new(),
            handle_to_exchange: Vec::new(),
        }
    }

    pub fn register_connect(&mut self, conn_id: &PeerConnId) {
        if conn_id.peer_rank == self.rank {
            return;
        }
        match conn_id.conn_type {
            ConnType::Send => {
                self.send_connect_mask[conn_id.peer_rank] |= 1u64 << conn_id.channel.0;
            }
            ConnType::Recv => {
                self.recv_connect_mask[conn_id.peer_rank] |= 1u64 << conn_id.channel.0;
            }
        }
    }

    fn round_conns(&self, round: usize) -> Vec<PeerConnId> {
        let recv_peer = (self.rank + self.num_ranks - round) % self.num_ranks;
        let send_peer = (self.rank + round) % self.num_ranks;
        let recv_mask = self.recv_connect_mask[recv_peer];
        let send_mask = self.send_connect_mask[send_peer];
        let mut conns = Vec::new();
        for c in 0..self.num_channels as u32 {
            if recv_mask & (1u64 << c) > 0 {
                conns.push(PeerConnId {
                    peer_rank: recv_peer,
                    channel: ChannelId(c),
                    conn_type: ConnType::Recv,
                });
            }
            if send_mask & (1u64 << c) > 0 {
                conns.push(PeerConnId {
                    peer_rank: send_peer,
                    channel: ChannelId(c),
                    conn_type: ConnType::Send,
                });
            }
        }
        conns
    }

    fn setup_conn(
        &mut self,
        conn_id: PeerConnId,
        round: usize,
        peers_info: &[PeerInfo],
        profile: &CommProfile,
        catalog: &TransportCatalog,
    ) -> Result<(), TransportConnectError> {
        let my_info = &peers_info[self.rank];
        let peer_info = &peers_info[conn_id.peer_rank];
        let (transporter, setup) = match conn_id.conn_type {
            ConnType::Send => {
                let transporter = select_transport(my_info, peer_info, profile, catalog)?;
                let setup =
                    transporter.send_setup(&conn_id, my_info, peer_info, profile, catalog)?;
                (transporter, setup)
            }
            ConnType::Recv => {
                let transporter = select_transport(peer_info, my_info, profile, catalog)?;
                let setup =
                    transporter.recv_setup(&conn_id, my_info, peer_info, profile, catalog)?;
                (transporter, setup)
            }
        };
        self.handle_to_exchange[round - 1].insert(conn_id, setup.peer_connect_handle);
        self.transporter_map.insert(conn_id, transporter);
        self.peer_setup.insert(
            conn_id,
            PeerConnConstructor {
                transporter,
                resources: setup.setup_resources,
            },
        );
        Ok(())
    }

    /// Exchanges this round's handles with the round's send and recv peers.
    /// Tags encode the round and the caller's graph so concurrent connect
    /// phases on the same bootstrap network cannot cross-talk.
    async fn exchange_round(
        &mut self,
        bootstrap: &Arc<BootstrapState>,
        graph_tag: u8,
        round: usize,
    ) -> Result<Vec<(PeerConnId, ConnectHandle)>, TransportConnectError> {
        let bootstrap_tag = ((round as u32) << 8) + graph_tag as u32;
        let mut round_handles = std::mem::take(&mut self.handle_to_exchange[round - 1]);
        let conns = self.round_conns(round);

        // group outbound handles by destination peer, in conn order
        let mut by_peer: HashMap<usize, Vec<u8>> = HashMap::new();
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for conn_id in &conns {
            let handle = round_handles
                .remove(conn_id)
                .ok_or(TransportConnectError::ConnectionNotFound(*conn_id))?;
            by_peer
                .entry(conn_id.peer_rank)
                .or_default()
                .extend_from_slice(&handle.0);
            *counts.entry(conn_id.peer_rank).or_default() += 1;
        }

        let mut peers: Vec<usize> = by_peer.keys().copied().collect();
        peers.sort_unstable();
        for peer in &peers {
            bootstrap
                .send(*peer, bootstrap_tag, by_peer[peer].as_slice())
                .await?;
        }
        let mut received: HashMap<usize, Vec<u8>> = HashMap::new();
        for peer in &peers {
            let mut buf = vec![0u8; counts[peer] * CONNECT_HANDLE_SIZE];
            bootstrap.recv(*peer, bootstrap_tag, buf.as_mut_slice()).await?;
            received.insert(*peer, buf);
        }

        // handles cross: a Send consumes the peer's Recv handle and vice
        // versa, and the peer wrote its stream Recv-first per channel, so we
        // must read Send-first to line the offsets up
        let mut offsets: HashMap<usize, usize> = HashMap::new();
        let mut out = Vec::new();
        let recv_peer = (self.rank + self.num_ranks - round) % self.num_ranks;
        let send_peer = (self.rank + round) % self.num_ranks;
        for c in 0..self.num_channels as u32 {
            let mut take = |conn_id: PeerConnId| -> Result<(), TransportConnectError> {
                let offset = offsets.entry(conn_id.peer_rank).or_default();
                let data = &received[&conn_id.peer_rank]
                    [*offset * CONNECT_HANDLE_SIZE..(*offset + 1) * CONNECT_HANDLE_SIZE];
                *offset += 1;
                let handle = ConnectHandle(
                    data.try_into()
                        .map_err(|_| TransportConnectError::ConnectionNotFound(conn_id))?,
                );
                out.push((conn_id, handle));
                Ok(())
            };
            if self.send_connect_mask[send_peer] & (1u64 << c) > 0 {
                take(PeerConnId {
                    peer_rank: send_peer,
                    channel: ChannelId(c),
                    conn_type: ConnType::Send,
                })?;
            }
            if self.recv_connect_mask[recv_peer] & (1u64 << c) > 0 {
                take(PeerConnId {
                    peer_rank: recv_peer,
                    channel: ChannelId(c),
                    conn_type: ConnType::Recv,
                })?;
            }
        }
        Ok(out)
    }

    /// Runs the full three-phase establishment for every registered
    /// connection and returns the connected endpoints.
    pub async fn connect_all(
        &mut self,
        bootstrap: &Arc<BootstrapState>,
        graph_tag: u8,
        peers_info: &[PeerInfo],
        profile: &CommProfile,
        catalog: &TransportCatalog,
    ) -> Result<HashMap<PeerConnId, PeerConnector>, TransportConnectError> {
        self.handle_to_exchange.clear();
        self.handle_to_exchange
            .resize_with(self.num_ranks.saturating_sub(1), HashMap::new);

        for round in 1..self.num_ranks {
            for conn_id in self.round_conns(round) {
                self.setup_conn(conn_id, round, peers_info, profile, catalog)?;
            }
        }

        let mut connected = HashMap::new();
        for round in 1..self.num_ranks {
            let peer_handles = self.exchange_round(bootstrap, graph_tag, round).await?;
            for (conn_id, peer_handle) in peer_handles {
                let constructor = self
                    .peer_setup
                    .remove(&conn_id)
                    .ok_or(TransportConnectError::ConnectionNotFound(conn_id))?;
                let connect = match conn_id.conn_type {
                    ConnType::Send => constructor.transporter.send_connect(
                        &conn_id,
                        peer_handle,
                        constructor.resources,
                    )?,
                    ConnType::Recv => constructor.transporter.recv_connect(
                        &conn_id,
                        peer_handle,
                        constructor.resources,
                    )?,
                };
                log::trace!(
                    "rank {} connected {:?} via {}",
                    self.rank,
                    conn_id,
                    constructor.transporter.name()
                );
                connected.insert(
                    conn_id,
                    PeerConnector {
                        conn_info: connect.conn_info,
                        transporter: constructor.transporter,
                        transport_resources: connect.transport_resources,
                    },
                );
            }
        }

        self.send_connect_mask.clear();
        self.recv_connect_mask.clear();
        self.send_connect_mask.resize(self.num_ranks, 0);
        self.recv_connect_mask.resize(self.num_ranks, 0);
        Ok(connected)
    }
}
