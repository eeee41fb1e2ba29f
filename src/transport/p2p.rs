use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use super::catalog::TransportCatalog;
use super::channel::PeerConnId;
use super::transporter::{
    AnyResources, ConnectHandle, PeerConnInfo, TransportConnect, TransportSetup, Transporter,
    TransporterError,
};
use super::NUM_PROTOCOLS;
use crate::comm::{CommProfile, PeerInfo};

/// Direct transport for peers sharing an address space: both ranks map the
/// same staging buffers, so setup only has to agree on identities and sizes.
pub struct P2pTransporter;

#[derive(Debug, Serialize, Deserialize)]
struct P2pHandle {
    rank: usize,
    device: i32,
}

struct P2pResources {
    buf_sizes: [usize; NUM_PROTOCOLS],
}

impl P2pTransporter {
    fn setup(
        &self,
        my_info: &PeerInfo,
        profile: &CommProfile,
    ) -> Result<TransportSetup, TransporterError> {
        let handle = P2pHandle {
            rank: my_info.rank,
            device: my_info.device,
        };
        let resources = P2pResources {
            buf_sizes: profile.buff_sizes,
        };
        Ok(TransportSetup {
            peer_connect_handle: ConnectHandle::serialize_from(&handle)?,
            setup_resources: Some(Box::new(resources)),
        })
    }

    fn connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let peer = connect_handle.deserialize_to::<P2pHandle>()?;
        if peer.rank != conn_id.peer_rank {
            return Err(anyhow!(
                "peer handle names rank {}, expected {}",
                peer.rank,
                conn_id.peer_rank
            ));
        }
        let resources = setup_resources
            .ok_or_else(|| anyhow!("missing setup resources for {:?}", conn_id))?;
        let resources = resources
            .downcast::<P2pResources>()
            .map_err(|_| anyhow!("unexpected setup resources for {:?}", conn_id))?;
        Ok(TransportConnect {
            conn_info: PeerConnInfo::Direct {
                buf_sizes: resources.buf_sizes,
            },
            transport_resources: resources,
        })
    }
}

impl Transporter for P2pTransporter {
    fn name(&self) -> &'static str {
        "p2p"
    }

    fn can_connect(
        &self,
        send_peer: &PeerInfo,
        recv_peer: &PeerInfo,
        _profile: &CommProfile,
        _catalog: &TransportCatalog,
    ) -> bool {
        send_peer.host_hash == recv_peer.host_hash && send_peer.pid_hash == recv_peer.pid_hash
    }

    fn send_setup(
        &self,
        _conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        profile: &CommProfile,
        _catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError> {
        self.setup(my_info, profile)
    }

    fn recv_setup(
        &self,
        _conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        profile: &CommProfile,
        _catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError> {
        self.setup(my_info, profile)
    }

    fn send_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        self.connect(conn_id, connect_handle, setup_resources)
    }

    fn recv_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        self.connect(conn_id, connect_handle, setup_resources)
    }
}
