use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use super::channel::{ChannelId, CommChannel, ConnType};
use super::transporter::{
    AnyResources, ConnectHandle, TransporterError, CONNECT_HANDLE_SIZE,
};
use crate::bootstrap::BootstrapState;
use crate::comm::{CommProfile, PeerInfo};
use crate::transport::setup::TransportConnectError;

/// Catalog key under which the API layer injects the collective-network
/// transport, when one is available.
pub const COLLNET_CATALOG_KEY: &str = "collnet";

/// External collective-network device transport. Only the per-node master
/// ranks hold endpoints; setup targets a synthetic root peer and connect
/// registers the master with the network given the master-to-master
/// descriptor table.
pub trait CollNetTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this rank's device can reach the network root at all.
    fn can_connect(
        &self,
        my_info: &PeerInfo,
        root_info: &PeerInfo,
        profile: &CommProfile,
    ) -> bool;

    /// Master-only endpoint setup against the synthetic root. The returned
    /// handle enters the master-to-master descriptor table.
    fn setup(
        &self,
        channel: ChannelId,
        conn_type: ConnType,
        my_info: &PeerInfo,
        root_info: &PeerInfo,
        profile: &CommProfile,
    ) -> Result<(ConnectHandle, AnyResources), TransporterError>;

    /// Master-only: registers this endpoint with the network, given the
    /// per-node master descriptors and this master's position among them.
    fn connect(
        &self,
        channel: ChannelId,
        conn_type: ConnType,
        masters: &[ConnectHandle],
        collnet_rank: usize,
        resources: &mut AnyResources,
    ) -> Result<(), TransporterError>;

    fn free(&self, _resources: AnyResources) -> Result<(), TransporterError> {
        Ok(())
    }
}

/// Stand-in peer record for the network root. It occupies the rank slot one
/// past the last real rank, so transports can treat it like any other peer.
pub fn synthetic_root(num_ranks: usize) -> PeerInfo {
    PeerInfo {
        rank: num_ranks,
        device: -1,
        host_hash: 0,
        pid_hash: 0,
        bus_id: 0,
        shm_dev: 0,
        gdr_support: true,
        comp_cap: 0,
    }
}

pub struct CollNetSetupArgs {
    pub rank: usize,
    pub num_ranks: usize,
    /// Number of per-node masters, i.e. the communicator's node count.
    pub n_masters: usize,
    /// Per logical channel, the local node's (recv, send) master ranks.
    pub masters: Vec<(usize, usize)>,
}

// recv-side gather record: is_master flag, setup-ok flag, handle
const GATHER_RECORD: usize = 2 + CONNECT_HANDLE_SIZE;
// recv master -> send master forward: collnet rank, ok flag, handle
const EXCHANGE_RECORD: usize = 5 + CONNECT_HANDLE_SIZE;

fn exchange_tag(logic_channel: usize) -> u32 {
    0xC000_0000 | logic_channel as u32
}

/// What the recv-side master forwards to its paired send-side master once
/// the table is consolidated.
struct MasterExchange {
    collnet_rank: usize,
    ok: bool,
    handle: ConnectHandle,
}

impl MasterExchange {
    fn encode(&self) -> [u8; EXCHANGE_RECORD] {
        let mut buf = [0u8; EXCHANGE_RECORD];
        LittleEndian::write_u32(&mut buf[0..4], self.collnet_rank as u32);
        buf[4] = self.ok as u8;
        buf[5..].copy_from_slice(&self.handle.0);
        buf
    }

    fn decode(buf: &[u8; EXCHANGE_RECORD]) -> MasterExchange {
        let mut handle = [0u8; CONNECT_HANDLE_SIZE];
        handle.copy_from_slice(&buf[5..]);
        MasterExchange {
            collnet_rank: LittleEndian::read_u32(&buf[0..4]) as usize,
            ok: buf[4] == 1,
            handle: ConnectHandle(handle),
        }
    }
}

/// Recv side of one logical channel. Every rank participates in the gather;
/// only the master probes, sets up against the root, consolidates the
/// master table and connects. Returns the master's endpoint resources, the
/// forward record for the paired send master, and whether this rank failed.
async fn setup_recv_side(
    bootstrap: &Arc<BootstrapState>,
    transport: &dyn CollNetTransport,
    rank: usize,
    is_master: bool,
    channel: ChannelId,
    my_info: &PeerInfo,
    root_info: &PeerInfo,
    profile: &CommProfile,
) -> Result<(Option<AnyResources>, Option<MasterExchange>, bool), TransportConnectError> {
    let mut failed = false;
    let mut own = None;
    let mut record = [0u8; GATHER_RECORD];
    record[0] = is_master as u8;
    if is_master {
        if transport.can_connect(my_info, root_info, profile) {
            match transport.setup(channel, ConnType::Recv, my_info, root_info, profile) {
                Ok((handle, resources)) => {
                    record[1] = 1;
                    record[2..].copy_from_slice(&handle.0);
                    own = Some(resources);
                }
                Err(err) => {
                    log::warn!(
                        "rank {} collnet recv setup failed on channel {}: {}",
                        rank,
                        channel,
                        err
                    );
                    failed = true;
                }
            }
        } else {
            failed = true;
        }
    }

    // all ranks gather so every rank knows the master table size and the
    // masters learn their collnet rank
    let gathered = bootstrap.all_gather(&record).await?;
    let mut table = Vec::new();
    let mut collnet_rank = None;
    for (r, entry) in gathered.chunks_exact(GATHER_RECORD).enumerate() {
        if entry[0] != 1 {
            continue;
        }
        let mut handle = [0u8; CONNECT_HANDLE_SIZE];
        handle.copy_from_slice(&entry[2..]);
        if r == rank {
            collnet_rank = Some(table.len());
        }
        table.push(ConnectHandle(handle));
    }

    if !is_master {
        return Ok((None, None, false));
    }
    let collnet_rank = collnet_rank.ok_or_else(|| {
        TransportConnectError::Transporter(anyhow::anyhow!(
            "collnet master missing from its own gather"
        ))
    })?;

    let resources = match own {
        Some(mut resources) if !failed => {
            match transport.connect(channel, ConnType::Recv, &table, collnet_rank, &mut resources)
            {
                Ok(()) => Some(resources),
                Err(err) => {
                    log::warn!(
                        "rank {} collnet recv connect failed on channel {}: {}",
                        rank,
                        channel,
                        err
                    );
                    transport
                        .free(resources)
                        .map_err(TransportConnectError::Transporter)?;
                    failed = true;
                    None
                }
            }
        }
        other => {
            if let Some(resources) = other {
                transport
                    .free(resources)
                    .map_err(TransportConnectError::Transporter)?;
            }
            None
        }
    };

    let exchange = MasterExchange {
        collnet_rank,
        ok: resources.is_some(),
        handle: table[collnet_rank].clone(),
    };
    Ok((resources, Some(exchange), failed))
}

/// Send side of one logical channel, master only. Consumes the recv
/// master's forward record: the send master reuses its collnet rank and
/// places the received descriptor into an otherwise empty table.
async fn setup_send_side(
    transport: &dyn CollNetTransport,
    rank: usize,
    n_masters: usize,
    channel: ChannelId,
    exchange: MasterExchange,
    my_info: &PeerInfo,
    root_info: &PeerInfo,
    profile: &CommProfile,
) -> Result<(Option<AnyResources>, bool), TransportConnectError> {
    if !exchange.ok {
        // the paired recv master already degraded; do not build a one-sided
        // endpoint
        return Ok((None, true));
    }
    if !transport.can_connect(my_info, root_info, profile) {
        return Ok((None, true));
    }
    let (_, mut resources) =
        match transport.setup(channel, ConnType::Send, my_info, root_info, profile) {
            Ok(setup) => setup,
            Err(err) => {
                log::warn!(
                    "rank {} collnet send setup failed on channel {}: {}",
                    rank,
                    channel,
                    err
                );
                return Ok((None, true));
            }
        };
    let mut table = vec![ConnectHandle([0u8; CONNECT_HANDLE_SIZE]); n_masters];
    table[exchange.collnet_rank] = exchange.handle;
    match transport.connect(
        channel,
        ConnType::Send,
        &table,
        exchange.collnet_rank,
        &mut resources,
    ) {
        Ok(()) => Ok((Some(resources), false)),
        Err(err) => {
            log::warn!(
                "rank {} collnet send connect failed on channel {}: {}",
                rank,
                channel,
                err
            );
            transport
                .free(resources)
                .map_err(TransportConnectError::Transporter)?;
            Ok((None, true))
        }
    }
}

/// Establishes collective-network endpoints on the per-node masters of every
/// logical channel pair (recv endpoints on the upper channel half, send
/// endpoints on the lower), then runs the all-or-nothing agreement: each rank
/// publishes a failure flag, and if any rank failed anywhere, every rank
/// frees whatever it set up and the feature is disabled for the whole
/// communicator.
pub async fn setup_collnet(
    bootstrap: &Arc<BootstrapState>,
    transport: &Arc<dyn CollNetTransport>,
    args: CollNetSetupArgs,
    channels: &mut [CommChannel],
    peers_info: &[PeerInfo],
    profile: &CommProfile,
) -> Result<bool, TransportConnectError> {
    let my_info = &peers_info[args.rank];
    let root_info = synthetic_root(args.num_ranks);
    let logic_channels = channels.len() / 2;
    let mut failed = false;
    for c in 0..logic_channels {
        let (recv_master, send_master) = args.masters[c];
        let channel_recv = ChannelId((logic_channels + c) as u32);
        let channel_send = ChannelId(c as u32);

        // the recv master must consolidate the table before its paired send
        // master can learn its collnet rank
        let (recv_res, exchange, recv_failed) = setup_recv_side(
            bootstrap,
            transport.as_ref(),
            args.rank,
            args.rank == recv_master,
            channel_recv,
            my_info,
            &root_info,
            profile,
        )
        .await?;
        failed |= recv_failed;
        channels[logic_channels + c].collnet.recv = recv_res;

        // direct rank-to-rank forward, recv master -> send master; local
        // pass-through when one rank plays both roles
        let mut forwarded = None;
        if let Some(exchange) = exchange {
            if send_master == args.rank {
                forwarded = Some(exchange);
            } else {
                bootstrap
                    .send(send_master, exchange_tag(c), &exchange.encode())
                    .await?;
            }
        }
        if args.rank == send_master {
            let exchange = match forwarded {
                Some(exchange) => exchange,
                None => {
                    let mut buf = [0u8; EXCHANGE_RECORD];
                    bootstrap.recv(recv_master, exchange_tag(c), &mut buf).await?;
                    MasterExchange::decode(&buf)
                }
            };
            log::trace!(
                "rank {} collnet send master on channel {}: collnet rank {} of {}",
                args.rank,
                channel_send,
                exchange.collnet_rank,
                args.n_masters
            );
            let (send_res, send_failed) = setup_send_side(
                transport.as_ref(),
                args.rank,
                args.n_masters,
                channel_send,
                exchange,
                my_info,
                &root_info,
                profile,
            )
            .await?;
            failed |= send_failed;
            channels[c].collnet.send = send_res;
        }
    }

    let flag = [failed as u8];
    let flags = bootstrap.all_gather(&flag).await?;
    if flags.iter().any(|f| *f != 0) {
        release_collnet(transport.as_ref(), channels)?;
        log::info!("collective network disabled: setup failed on some rank");
        return Ok(false);
    }
    Ok(true)
}

/// Frees every collnet endpoint and leaves the channels without collective-
/// network state. Called both on degrade and at communicator teardown.
pub fn release_collnet(
    transport: &dyn CollNetTransport,
    channels: &mut [CommChannel],
) -> Result<(), TransportConnectError> {
    for channel in channels.iter_mut() {
        if let Some(resources) = channel.collnet.recv.take() {
            transport
                .free(resources)
                .map_err(TransportConnectError::Transporter)?;
        }
        if let Some(resources) = channel.collnet.send.take() {
            transport
                .free(resources)
                .map_err(TransportConnectError::Transporter)?;
        }
    }
    Ok(())
}
