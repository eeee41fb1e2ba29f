use std::collections::HashMap;
use std::fmt::Display;

use super::transporter::{PeerConnInfo, Transporter, TransporterError};
use crate::pattern::{CollNetChain, RingPattern, TreePattern};
use crate::transport::transporter::AnyResources;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnType {
    Send,
    Recv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerConnId {
    pub peer_rank: usize,
    pub channel: ChannelId,
    pub conn_type: ConnType,
}

/// An established peer connection and the transport state backing it.
pub struct PeerConnector {
    pub conn_info: PeerConnInfo,
    pub transporter: &'static dyn Transporter,
    pub transport_resources: AnyResources,
}

pub struct ChannelPeerConn {
    pub send: Option<PeerConnector>,
    pub recv: Option<PeerConnector>,
}

/// Per-channel collective-network endpoints, populated only on nodes where
/// collnet setup succeeded on every rank.
#[derive(Default)]
pub struct CollNetChannelConn {
    pub chain: CollNetChain,
    pub send: Option<AnyResources>,
    pub recv: Option<AnyResources>,
}

/// One logical channel: its ring and tree membership plus the transport
/// connections established along them.
pub struct CommChannel {
    pub id: ChannelId,
    pub ring: RingPattern,
    pub tree: TreePattern,
    pub collnet: CollNetChannelConn,
    // peer rank -> connections on this channel
    pub peers: HashMap<usize, ChannelPeerConn>,
}

impl CommChannel {
    pub fn new(id: ChannelId, ring: RingPattern, tree: TreePattern) -> Self {
        CommChannel {
            id,
            ring,
            tree,
            collnet: CollNetChannelConn::default(),
            peers: HashMap::new(),
        }
    }

    pub fn install_connector(
        &mut self,
        peer_rank: usize,
        conn_type: ConnType,
        connector: PeerConnector,
    ) {
        let entry = self.peers.entry(peer_rank).or_insert_with(|| ChannelPeerConn {
            send: None,
            recv: None,
        });
        match conn_type {
            ConnType::Send => entry.send = Some(connector),
            ConnType::Recv => entry.recv = Some(connector),
        }
    }

    /// Frees every transport connection on this channel. Peer connectors are
    /// handed back to the transporter that created them.
    pub fn release(self) -> Result<(), TransporterError> {
        let id = self.id;
        for (peer_rank, conns) in self.peers.into_iter() {
            if let Some(connector) = conns.send {
                let conn_id = PeerConnId {
                    peer_rank,
                    channel: id,
                    conn_type: ConnType::Send,
                };
                connector
                    .transporter
                    .free_resources(&conn_id, connector.transport_resources)?;
            }
            if let Some(connector) = conns.recv {
                let conn_id = PeerConnId {
                    peer_rank,
                    channel: id,
                    conn_type: ConnType::Recv,
                };
                connector
                    .transporter
                    .free_resources(&conn_id, connector.transport_resources)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.to_string().as_str())
    }
}
