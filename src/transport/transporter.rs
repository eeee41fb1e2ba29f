use std::any::Any;
use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::catalog::TransportCatalog;
use super::channel::PeerConnId;
use super::NUM_PROTOCOLS;
use crate::comm::{CommProfile, PeerInfo};

pub type AnyResources = Box<dyn Any + Send>;
pub type TransporterError = anyhow::Error;

pub const CONNECT_HANDLE_SIZE: usize = 128;

/// Opaque, fixed-size connection token exchanged between peers over the
/// bootstrap network. Fixed size keeps the exchange wire format uniform
/// across transports.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct ConnectHandle(pub [u8; CONNECT_HANDLE_SIZE]);

#[derive(Debug, Error)]
pub enum ConnectHandleError {
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Required size {0} exceeds maximum of {}", CONNECT_HANDLE_SIZE)]
    ExceedMaxSize(usize),
}

impl ConnectHandle {
    pub fn serialize_from<T: Serialize>(handle: T) -> Result<Self, ConnectHandleError> {
        let mut serialized = [0u8; CONNECT_HANDLE_SIZE];
        let required_size = bincode::serialized_size(&handle)?;
        if required_size as usize > CONNECT_HANDLE_SIZE {
            return Err(ConnectHandleError::ExceedMaxSize(required_size as usize));
        }
        bincode::serialize_into(serialized.as_mut_slice(), &handle)?;
        Ok(ConnectHandle(serialized))
    }

    pub fn deserialize_to<T: DeserializeOwned>(&self) -> Result<T, ConnectHandleError> {
        let handle = bincode::deserialize::<T>(self.0.as_slice())?;
        Ok(handle)
    }
}

/// What a connected endpoint hands the data plane: where the peer's staging
/// buffers live and how to reach them.
#[derive(Debug, Clone)]
pub enum PeerConnInfo {
    /// Peer shares this rank's address space; buffers are mapped directly.
    Direct {
        buf_sizes: [usize; NUM_PROTOCOLS],
    },
    /// Peer is reached over a stream the proxy establishes lazily from the
    /// receiver's listen descriptor.
    Socket {
        listen_addr: SocketAddr,
        buf_sizes: [usize; NUM_PROTOCOLS],
    },
}

/// Setup-phase output: the token for the remote peer plus any local state
/// that must survive until the connect phase.
pub struct TransportSetup {
    pub peer_connect_handle: ConnectHandle,
    pub setup_resources: Option<AnyResources>,
}

/// Connect-phase output: the established endpoint description and the
/// resources backing it until teardown.
pub struct TransportConnect {
    pub conn_info: PeerConnInfo,
    pub transport_resources: AnyResources,
}

/// One point-to-point transport mechanism. Establishment is split into a
/// setup phase that produces a handle for the remote side and a connect
/// phase that consumes the remote side's handle; setup of both ends must
/// complete before either end connects.
pub trait Transporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this transport can carry `send_peer` -> `recv_peer` traffic.
    /// Transports are probed in preference order; the first match wins.
    fn can_connect(
        &self,
        send_peer: &PeerInfo,
        recv_peer: &PeerInfo,
        profile: &CommProfile,
        catalog: &TransportCatalog,
    ) -> bool;

    fn send_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        profile: &CommProfile,
        catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError>;

    fn recv_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        profile: &CommProfile,
        catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError>;

    fn send_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError>;

    fn recv_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError>;

    /// Releases connect-phase resources during communicator teardown.
    fn free_resources(
        &self,
        _conn_id: &PeerConnId,
        _resources: AnyResources,
    ) -> Result<(), TransporterError> {
        Ok(())
    }
}
