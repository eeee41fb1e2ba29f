use std::net::{SocketAddr, TcpListener};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use super::catalog::TransportCatalog;
use super::channel::PeerConnId;
use super::transporter::{
    AnyResources, ConnectHandle, PeerConnInfo, TransportConnect, TransportSetup, Transporter,
    TransporterError,
};
use super::NUM_PROTOCOLS;
use crate::comm::{CommProfile, PeerInfo};

/// Stream transport of last resort: always able to connect. The receiver
/// opens a listener during setup and publishes its address in the handle;
/// actual streams are established lazily by the proxy once the data plane
/// issues work, so the blocking connect phase never waits on a peer.
pub struct NetSocketTransporter;

#[derive(Debug, Serialize, Deserialize)]
struct NetListenHandle {
    rank: usize,
    listen_addr: SocketAddr,
}

struct NetSendResources {
    buf_sizes: [usize; NUM_PROTOCOLS],
}

struct NetRecvResources {
    // kept open for the proxy until teardown
    #[allow(dead_code)]
    listener: TcpListener,
    listen_addr: SocketAddr,
    buf_sizes: [usize; NUM_PROTOCOLS],
}

impl Transporter for NetSocketTransporter {
    fn name(&self) -> &'static str {
        "net-socket"
    }

    fn can_connect(
        &self,
        _send_peer: &PeerInfo,
        _recv_peer: &PeerInfo,
        _profile: &CommProfile,
        _catalog: &TransportCatalog,
    ) -> bool {
        true
    }

    fn send_setup(
        &self,
        _conn_id: &PeerConnId,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        profile: &CommProfile,
        _catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError> {
        // sender has nothing to publish; the peer only needs a placeholder
        let resources = NetSendResources {
            buf_sizes: profile.buff_sizes,
        };
        Ok(TransportSetup {
            peer_connect_handle: ConnectHandle::serialize_from(())?,
            setup_resources: Some(Box::new(resources)),
        })
    }

    fn recv_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        profile: &CommProfile,
        _catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError> {
        let listener = TcpListener::bind((profile.listen_addr, 0))
            .with_context(|| format!("bind listener for {:?}", conn_id))?;
        let listen_addr = listener.local_addr()?;
        let handle = NetListenHandle {
            rank: my_info.rank,
            listen_addr,
        };
        let resources = NetRecvResources {
            listener,
            listen_addr,
            buf_sizes: profile.buff_sizes,
        };
        Ok(TransportSetup {
            peer_connect_handle: ConnectHandle::serialize_from(&handle)?,
            setup_resources: Some(Box::new(resources)),
        })
    }

    fn send_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let peer = connect_handle.deserialize_to::<NetListenHandle>()?;
        if peer.rank != conn_id.peer_rank {
            return Err(anyhow!(
                "peer handle names rank {}, expected {}",
                peer.rank,
                conn_id.peer_rank
            ));
        }
        let resources = setup_resources
            .ok_or_else(|| anyhow!("missing setup resources for {:?}", conn_id))?
            .downcast::<NetSendResources>()
            .map_err(|_| anyhow!("unexpected setup resources for {:?}", conn_id))?;
        Ok(TransportConnect {
            conn_info: PeerConnInfo::Socket {
                listen_addr: peer.listen_addr,
                buf_sizes: resources.buf_sizes,
            },
            transport_resources: resources,
        })
    }

    fn recv_connect(
        &self,
        conn_id: &PeerConnId,
        _connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let resources = setup_resources
            .ok_or_else(|| anyhow!("missing setup resources for {:?}", conn_id))?
            .downcast::<NetRecvResources>()
            .map_err(|_| anyhow!("unexpected setup resources for {:?}", conn_id))?;
        Ok(TransportConnect {
            conn_info: PeerConnInfo::Socket {
                listen_addr: resources.listen_addr,
                buf_sizes: resources.buf_sizes,
            },
            transport_resources: resources,
        })
    }
}
