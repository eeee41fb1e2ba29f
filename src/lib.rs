//! Rendezvous and transport establishment for multi-process, multi-device
//! collective communication.
//!
//! One communicator spans a clique of ranks, each bound to one device. A
//! root rendezvous address ([`bootstrap::UniqueId`]) is distributed out of
//! band; every rank checks in, the ranks wire a bootstrap TCP ring, gather
//! each other's identities, negotiate ring/tree channel layouts down to the
//! common denominator, and establish point-to-point transports along them.
//! The data plane that moves tensors over the resulting channels lives
//! elsewhere; this crate ends where [`comm::Communicator`] is handed over.

pub mod api;
pub mod bootstrap;
pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod pattern;
pub mod proxy;
pub mod transport;
pub mod utils;

pub use api::{
    comm_abort, comm_count, comm_destroy, comm_device, comm_get_async_error, comm_init_all,
    comm_init_all_with, comm_init_rank, comm_init_rank_with, comm_user_rank, get_unique_id,
    get_unique_id_with, with_communicator, Comm,
};
pub use bootstrap::UniqueId;
pub use comm::{CommInitOptions, Communicator};
pub use config::{CommConfig, LaunchMode};
pub use error::{CommError, ErrorKind, Result};
