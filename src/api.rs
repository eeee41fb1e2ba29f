use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Once};

use once_cell::sync::Lazy;

use crate::bootstrap::{create_root, run_root, UniqueId};
use crate::comm::init::{init_transports_rank, CommInitOptions};
use crate::comm::Communicator;
use crate::config::CommConfig;
use crate::error::{CommError, ErrorKind, Result};

static INIT_BANNER: Once = Once::new();

fn init_once() {
    INIT_BANNER.call_once(|| {
        log::info!(
            "{} {} initialized",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
    });
}

/// Opaque communicator handle handed to callers. The backing state lives in
/// a process-wide table; a destroyed handle goes stale rather than dangling,
/// so a second destroy is reported instead of corrupting anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Comm(u64);

static COMMS: Lazy<Mutex<HashMap<u64, Communicator>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn register(comm: Communicator) -> Comm {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    COMMS.lock().unwrap().insert(handle, comm);
    Comm(handle)
}

fn with_comm<T>(comm: Comm, f: impl FnOnce(&Communicator) -> T) -> Result<T> {
    let comms = COMMS.lock().unwrap();
    match comms.get(&comm.0) {
        Some(communicator) => Ok(f(communicator)),
        None => Err(CommError::InvalidArgument(format!(
            "communicator handle {:?} is invalid or already destroyed",
            comm
        ))),
    }
}

/// Mints the rendezvous identifier for one communicator and starts the root
/// service that ranks check in with. The root serves exactly one
/// communicator and exits on its own.
pub fn get_unique_id() -> Result<UniqueId> {
    get_unique_id_with(&CommConfig::default())
}

pub fn get_unique_id_with(config: &CommConfig) -> Result<UniqueId> {
    init_once();
    let listen_addr = SocketAddr::new(config.listen_addr, 0);
    let (socket, unique_id) = create_root(&listen_addr)?;
    let magic = unique_id.magic;
    std::thread::Builder::new()
        .name("comm-bootstrap-root".to_string())
        .spawn(move || {
            if let Err(err) = smol::block_on(run_root(socket, magic)) {
                log::error!("bootstrap root failed: {}", err);
            }
        })
        .map_err(CommError::SystemError)?;
    log::debug!("bootstrap root listening on {}", unique_id.addr);
    Ok(unique_id)
}

/// Creates one rank of a communicator. Blocks until every rank of the clique
/// reached the end of initialization.
pub fn comm_init_rank(
    unique_id: &UniqueId,
    num_ranks: usize,
    rank: usize,
    device: i32,
) -> Result<Comm> {
    comm_init_rank_with(unique_id, num_ranks, rank, device, CommInitOptions::default())
}

pub fn comm_init_rank_with(
    unique_id: &UniqueId,
    num_ranks: usize,
    rank: usize,
    device: i32,
    opts: CommInitOptions,
) -> Result<Comm> {
    init_once();
    let communicator = smol::block_on(init_transports_rank(
        unique_id, rank, num_ranks, device, &opts,
    ))?;
    Ok(register(communicator))
}

/// Single-process convenience: one communicator rank per listed device, each
/// initialized on its own thread since every rank blocks on the others.
pub fn comm_init_all(devices: &[i32]) -> Result<Vec<Comm>> {
    comm_init_all_with(devices, CommInitOptions::default())
}

pub fn comm_init_all_with(devices: &[i32], opts: CommInitOptions) -> Result<Vec<Comm>> {
    init_once();
    if devices.is_empty() {
        return Err(CommError::InvalidArgument(
            "device list must not be empty".to_string(),
        ));
    }
    let mut sorted = devices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != devices.len() {
        return Err(CommError::InvalidUsage(
            "device list contains duplicates".to_string(),
        ));
    }
    let unique_id = get_unique_id_with(&opts.config)?;
    let num_ranks = devices.len();
    let mut threads = Vec::with_capacity(num_ranks);
    for (rank, device) in devices.iter().copied().enumerate() {
        let unique_id = unique_id.clone();
        let opts = opts.clone();
        threads.push(std::thread::spawn(move || {
            comm_init_rank_with(&unique_id, num_ranks, rank, device, opts)
        }));
    }
    let mut comms = Vec::with_capacity(num_ranks);
    for thread in threads {
        let comm = thread
            .join()
            .map_err(|_| CommError::InternalError("init thread panicked".to_string()))??;
        comms.push(comm);
    }
    Ok(comms)
}

/// Tears the communicator down. A handle can be destroyed once; later calls
/// report `InvalidArgument`.
pub fn comm_destroy(comm: Comm) -> Result<()> {
    let communicator = COMMS.lock().unwrap().remove(&comm.0).ok_or_else(|| {
        CommError::InvalidArgument(format!(
            "communicator handle {:?} is invalid or already destroyed",
            comm
        ))
    })?;
    communicator.destroy()
}

/// Flips the shared abort flag so in-flight device work can bail out
/// cooperatively, and returns immediately. Releases nothing: kernels may
/// still be running, so the orderly teardown stays with `comm_destroy`.
/// Best-effort on a stale handle.
pub fn comm_abort(comm: Comm) -> Result<()> {
    let comms = COMMS.lock().unwrap();
    if let Some(communicator) = comms.get(&comm.0) {
        communicator.abort();
    }
    Ok(())
}

/// First fatal error observed outside a blocking call, if any. The error is
/// sticky: once fatal, a communicator stays fatal.
pub fn comm_get_async_error(comm: Comm) -> Result<Option<ErrorKind>> {
    with_comm(comm, |c| c.async_error.get())
}

pub fn comm_count(comm: Comm) -> Result<usize> {
    with_comm(comm, |c| c.count())
}

pub fn comm_device(comm: Comm) -> Result<i32> {
    with_comm(comm, |c| c.device_index())
}

pub fn comm_user_rank(comm: Comm) -> Result<usize> {
    with_comm(comm, |c| c.user_rank())
}

/// Read access to the full communicator state, for the data plane layered
/// on top of this crate.
pub fn with_communicator<T>(comm: Comm, f: impl FnOnce(&Communicator) -> T) -> Result<T> {
    with_comm(comm, f)
}
