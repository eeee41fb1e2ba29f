use std::net::SocketAddr;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::lock::Mutex;
use smol::net::TcpStream;
use socket2::Socket;

use super::{BootstrapError, BootstrapRing, BootstrapState, UnexpectedConn, UniqueId};
use crate::utils::tcp;

#[derive(Serialize, Deserialize)]
struct CheckIn {
    rank: usize,
    num_ranks: usize,
    // where the root should deliver this rank's ring successor
    reply_addr: SocketAddr,
    // where ring/point-to-point peers should connect
    listen_addr: SocketAddr,
}

pub(crate) async fn net_send(stream: &mut TcpStream, data: &[u8]) -> Result<(), BootstrapError> {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, data.len() as u32);
    stream.write_all(&buf).await?;
    stream.write_all(data).await?;
    Ok(())
}

pub(crate) async fn net_recv(
    stream: &mut TcpStream,
    data: &mut [u8],
) -> Result<(), BootstrapError> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let recv_size = LittleEndian::read_u32(&buf);
    if recv_size != data.len() as u32 {
        Err(BootstrapError::RecvSizeMismatch(
            recv_size,
            data.len() as u32,
        ))?;
    }
    stream.read_exact(data).await?;
    Ok(())
}

async fn net_recv_dyn(stream: &mut TcpStream) -> Result<Vec<u8>, BootstrapError> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let recv_size = LittleEndian::read_u32(&buf) as usize;
    let mut data = vec![0u8; recv_size];
    stream.read_exact(data.as_mut_slice()).await?;
    Ok(data)
}

/// Binds the root rendezvous socket and mints the [`UniqueId`] that all ranks
/// must share. The caller is expected to hand the socket to [`run_root`] on a
/// dedicated task.
pub fn create_root(listen_addr: &SocketAddr) -> Result<(Socket, UniqueId), BootstrapError> {
    let socket = if listen_addr.is_ipv4() {
        Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?
    } else {
        Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?
    };
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&listen_addr.to_owned().into())?;
    socket.set_nonblocking(true)?;

    let addr = socket.local_addr()?.as_socket().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "not an inet socket")
    })?;
    let magic = rand::random();
    Ok((socket, UniqueId { addr, magic }))
}

/// Root service: collects one check-in per rank, then tells every rank the
/// listen address of its ring successor. Runs once per communicator and exits.
pub async fn run_root(listen_sock: Socket, magic: u64) -> Result<(), BootstrapError> {
    listen_sock.listen(16384)?;
    let listener: std::net::TcpListener = listen_sock.into();
    let listener = smol::net::TcpListener::try_from(listener)?;

    let mut stream = tcp::async_accept(&listener, magic).await?;
    let first: CheckIn = bincode::deserialize(&net_recv_dyn(&mut stream).await?)?;
    let num_ranks = first.num_ranks;

    let mut listen_addrs: Vec<Option<SocketAddr>> = vec![None; num_ranks];
    let mut reply_addrs: Vec<Option<SocketAddr>> = vec![None; num_ranks];
    listen_addrs[first.rank] = Some(first.listen_addr);
    reply_addrs[first.rank] = Some(first.reply_addr);
    let mut received = 1;
    log::trace!("Bootstrap root received check-in from rank {}", first.rank);

    while received < num_ranks {
        let mut stream = tcp::async_accept(&listener, magic).await?;
        let info: CheckIn = bincode::deserialize(&net_recv_dyn(&mut stream).await?)?;
        if info.num_ranks != num_ranks {
            Err(BootstrapError::NumRanksMismatch(info.num_ranks, num_ranks))?;
        }
        if info.rank >= num_ranks {
            Err(BootstrapError::RankOverflow(info.rank))?;
        }
        if listen_addrs[info.rank].is_some() {
            Err(BootstrapError::DuplicatedCheckIn(info.rank))?;
        }
        listen_addrs[info.rank] = Some(info.listen_addr);
        reply_addrs[info.rank] = Some(info.reply_addr);
        received += 1;
        log::trace!("Bootstrap root received check-in from rank {}", info.rank);
    }

    for r in 0..num_ranks {
        let next = (r + 1) % num_ranks;
        let connect_addr = reply_addrs[r].as_ref().unwrap();
        let mut stream = tcp::async_connect(connect_addr, magic).await?;
        let data = bincode::serialize(listen_addrs[next].as_ref().unwrap())?;
        net_send(&mut stream, &data).await?;
    }
    log::trace!("Bootstrap root has sent out all ring successor addresses");
    Ok(())
}

impl BootstrapState {
    /// Checks in with the root, wires the bootstrap ring, then AllGathers the
    /// per-rank listen addresses so tagged point-to-point exchanges can reach
    /// any peer directly.
    pub async fn init(
        id: &UniqueId,
        listen_addr: SocketAddr,
        rank: usize,
        num_ranks: usize,
    ) -> Result<BootstrapState, BootstrapError> {
        let mut listen_addr = listen_addr.to_owned();
        listen_addr.set_port(0);

        let peer_listener = tcp::async_listen(&listen_addr)?;
        let peer_listen_addr = peer_listener.local_addr()?;
        let root_listener = tcp::async_listen(&listen_addr)?;
        let root_listen_addr = root_listener.local_addr()?;
        log::trace!(
            "Rank {} of {} bootstrap listening on {:?}",
            rank,
            num_ranks,
            peer_listen_addr
        );

        // Stagger root connections in large jobs so the root accept queue
        // does not overflow.
        if num_ranks > 128 {
            smol::Timer::after(std::time::Duration::from_millis(rank as u64)).await;
        }

        let mut stream = tcp::async_connect(&id.addr, id.magic).await?;
        let check_in = CheckIn {
            rank,
            num_ranks,
            reply_addr: root_listen_addr,
            listen_addr: peer_listen_addr,
        };
        net_send(&mut stream, &bincode::serialize(&check_in)?).await?;

        // The root replies on our reply listener with the ring successor.
        let mut stream = tcp::async_accept(&root_listener, id.magic).await?;
        let next_addr: SocketAddr = bincode::deserialize(&net_recv_dyn(&mut stream).await?)?;

        let mut ring_send = tcp::async_connect(&next_addr, id.magic).await?;
        let mut ring_recv = tcp::async_accept(&peer_listener, id.magic).await?;

        let mut addr_bytes = Vec::with_capacity(pad_addr_len());
        tcp::encode_socket_addr(&peer_listen_addr, &mut addr_bytes);
        let mut all_addrs = vec![0u8; pad_addr_len() * num_ranks];
        all_addrs[rank * pad_addr_len()..rank * pad_addr_len() + addr_bytes.len()]
            .copy_from_slice(&addr_bytes);
        ring_all_gather(
            &mut ring_send,
            &mut ring_recv,
            rank,
            num_ranks,
            all_addrs.as_mut_slice(),
        )
        .await?;
        let mut peer_addrs = Vec::with_capacity(num_ranks);
        for i in 0..num_ranks {
            let mut slice = &all_addrs[i * pad_addr_len()..(i + 1) * pad_addr_len()];
            peer_addrs.push(tcp::decode_socket_addr(&mut slice));
        }

        Ok(BootstrapState {
            rank,
            num_ranks,
            peer_addrs,
            listener: peer_listener,
            magic: id.magic,
            ring: Mutex::new(BootstrapRing {
                ring_send,
                ring_recv,
            }),
            unexpected_connections: Mutex::new(Vec::new()),
        })
    }
}

// Socket addresses serialize to different lengths for v4 and v6; the ring
// AllGather requires equal slices, so pad to the larger encoding.
fn pad_addr_len() -> usize {
    32
}

async fn ring_all_gather(
    ring_send: &mut TcpStream,
    ring_recv: &mut TcpStream,
    rank: usize,
    num_ranks: usize,
    data: &mut [u8],
) -> Result<(), BootstrapError> {
    assert_eq!(data.len() % num_ranks, 0);
    let size = data.len() / num_ranks;
    for i in 0..(num_ranks - 1) {
        let recv_slice_idx = (rank + num_ranks - i - 1) % num_ranks;
        let send_slice_idx = (rank + num_ranks - i) % num_ranks;

        // forward our newest slice to the right, take one in from the left
        let send_data = &data[send_slice_idx * size..(send_slice_idx + 1) * size];
        net_send(ring_send, send_data).await?;
        let recv_data = &mut data[recv_slice_idx * size..(recv_slice_idx + 1) * size];
        net_recv(ring_recv, recv_data).await?;
    }
    Ok(())
}

impl BootstrapState {
    async fn unexpected_enqueue(&self, peer: usize, tag: u32, stream: TcpStream) {
        let mut connections = self.unexpected_connections.lock().await;
        connections.push(UnexpectedConn { peer, tag, stream });
    }

    async fn unexpected_dequeue(&self, peer: usize, tag: u32) -> Option<TcpStream> {
        let mut connections = self.unexpected_connections.lock().await;
        let idx = connections
            .iter()
            .position(|c| c.peer == peer && c.tag == tag);
        idx.map(|idx| connections.swap_remove(idx).stream)
    }

    /// Blocking point-to-point send. Tags disambiguate concurrent exchanges
    /// between the same pair of ranks.
    pub async fn send(&self, peer: usize, tag: u32, data: &[u8]) -> Result<(), BootstrapError> {
        log::trace!(
            "Bootstrap rank {} send to peer {} ({:?}) tag {}",
            self.rank,
            peer,
            self.peer_addrs[peer],
            tag
        );
        let mut stream = tcp::async_connect(&self.peer_addrs[peer], self.magic).await?;
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, self.rank as u64);
        stream.write_all(&buf).await?;
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, tag);
        stream.write_all(&buf).await?;
        net_send(&mut stream, data).await?;
        Ok(())
    }

    /// Blocking point-to-point receive matching `(peer, tag)`. Streams from
    /// other exchanges arriving early are parked, not dropped.
    pub async fn recv(
        &self,
        peer: usize,
        tag: u32,
        recv_buf: &mut [u8],
    ) -> Result<(), BootstrapError> {
        if let Some(mut stream) = self.unexpected_dequeue(peer, tag).await {
            net_recv(&mut stream, recv_buf).await?;
            return Ok(());
        }
        loop {
            let mut stream = tcp::async_accept(&self.listener, self.magic).await?;
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf).await?;
            let recv_peer = LittleEndian::read_u64(&buf) as usize;
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            let recv_tag = LittleEndian::read_u32(&buf);

            if recv_peer == peer && recv_tag == tag {
                net_recv(&mut stream, recv_buf).await?;
                return Ok(());
            }
            self.unexpected_enqueue(recv_peer, recv_tag, stream).await;
        }
    }

    /// Ring AllGather: every rank contributes `slice`, all ranks receive the
    /// rank-ordered concatenation. Every rank must contribute the same number
    /// of bytes.
    pub async fn all_gather(&self, slice: &[u8]) -> Result<Vec<u8>, BootstrapError> {
        let slice_size = slice.len();
        let rank = self.rank;
        let num_ranks = self.num_ranks;
        let mut data = vec![0u8; slice_size * num_ranks];
        data[rank * slice_size..(rank + 1) * slice_size].copy_from_slice(slice);

        if num_ranks == 1 {
            return Ok(data);
        }
        let mut ring = self.ring.try_lock().ok_or(BootstrapError::RingBusy)?;
        let BootstrapRing {
            ring_recv,
            ring_send,
        } = &mut *ring;
        ring_all_gather(ring_send, ring_recv, rank, num_ranks, data.as_mut_slice()).await?;
        log::trace!(
            "Bootstrap AllGather done: rank {} of {}, slice size {}",
            rank,
            num_ranks,
            slice_size
        );
        Ok(data)
    }
}
