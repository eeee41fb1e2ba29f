use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

/// Commands accepted by the proxy service thread. The data plane enqueues
/// stream establishment for socket-transport peers; init only ever needs the
/// shutdown handshake.
pub enum ProxyCommand {
    /// Establish the stream for a lazily-connected socket peer.
    Connect { peer_rank: usize, addr: std::net::SocketAddr },
    Shutdown,
}

/// Handle to the per-communicator proxy thread. The thread owns network
/// progress for transports that defer their streams past init; it polls the
/// communicator's abort flag so an abort unblocks it without a command.
pub struct ProxyHandle {
    tx: Sender<ProxyCommand>,
    thread: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn spawn(rank: usize, abort_flag: Arc<AtomicU32>) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded();
        let thread = std::thread::Builder::new()
            .name(format!("comm-proxy-{}", rank))
            .spawn(move || proxy_loop(rank, rx, abort_flag))
            .ok();
        ProxyHandle { tx, thread }
    }

    pub fn sender(&self) -> Sender<ProxyCommand> {
        self.tx.clone()
    }

    /// Stops the thread and waits for it to drain. Safe to call after an
    /// abort; the loop exits on either signal.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(ProxyCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn proxy_loop(rank: usize, rx: Receiver<ProxyCommand>, abort_flag: Arc<AtomicU32>) {
    log::debug!("proxy thread for rank {} started", rank);
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(ProxyCommand::Connect { peer_rank, addr }) => {
                match std::net::TcpStream::connect(addr) {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        log::debug!(
                            "proxy rank {} connected stream to rank {} at {}",
                            rank,
                            peer_rank,
                            addr
                        );
                        // the data plane takes the stream over from here
                        drop(stream);
                    }
                    Err(err) => {
                        log::warn!(
                            "proxy rank {} failed to reach rank {} at {}: {}",
                            rank,
                            peer_rank,
                            addr,
                            err
                        );
                    }
                }
            }
            Ok(ProxyCommand::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {
                if abort_flag.load(Ordering::Acquire) != 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("proxy thread for rank {} stopped", rank);
}
