use self::net::NetSocketTransporter;
use self::p2p::P2pTransporter;
use self::transporter::Transporter;
use crate::config::CommConfig;
use crate::graph::CpuArch;

pub mod catalog;
pub mod channel;
pub mod collnet;
pub mod net;
pub mod p2p;
pub mod setup;
pub mod transporter;

pub static P2P_TRANSPORTER: P2pTransporter = P2pTransporter;
pub static NET_TRANSPORTER: NetSocketTransporter = NetSocketTransporter;

/// Probe order for peer connections: prefer direct paths, fall back to the
/// socket transport which can always connect.
pub static ALL_TRANSPORTERS: [&'static dyn Transporter; 2] =
    [&P2P_TRANSPORTER, &NET_TRANSPORTER];

pub const NUM_BUFFER_SLOTS: usize = 8;

pub const NUM_PROTOCOLS: usize = 3;
pub const PROTOCOL_LL: usize = 0;
pub const PROTOCOL_LL128: usize = 1;
pub const PROTOCOL_SIMPLE: usize = 2;

pub const NUM_ALGORITHMS: usize = 3;
pub const ALGORITHM_TREE: usize = 0;
pub const ALGORITHM_RING: usize = 1;
pub const ALGORITHM_COLLNET: usize = 2;

const LL_LINES_PER_THREAD: usize = 8;
const LL_MAX_NTHREADS: usize = 512;
const LL_LINE_SIZE: usize = 16;
const LL128_ELEMS_PER_THREAD: usize = 120;
const LL128_MAX_NTHREADS: usize = 640;

pub const DEFAULT_LL_BUFFER_SIZE: usize =
    LL_LINES_PER_THREAD * LL_MAX_NTHREADS * NUM_BUFFER_SLOTS * LL_LINE_SIZE;
pub const DEFAULT_LL128_BUFFER_SIZE: usize =
    LL128_ELEMS_PER_THREAD * LL128_MAX_NTHREADS * NUM_BUFFER_SLOTS * std::mem::size_of::<u64>();
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 22;
/// ARM hosts get a smaller staging buffer; large pinned buffers hurt there.
pub const DEFAULT_BUFFER_SIZE_ARM: usize = 1 << 20;

/// Per-protocol staging-buffer sizes: explicit overrides win, otherwise the
/// architecture-sensitive defaults apply.
pub fn compute_buff_sizes(config: &CommConfig, cpu_arch: CpuArch) -> [usize; NUM_PROTOCOLS] {
    let simple_default = if cpu_arch == CpuArch::Arm {
        DEFAULT_BUFFER_SIZE_ARM
    } else {
        DEFAULT_BUFFER_SIZE
    };
    let mut sizes = [0; NUM_PROTOCOLS];
    sizes[PROTOCOL_LL] = config.ll_buff_size.unwrap_or(DEFAULT_LL_BUFFER_SIZE);
    sizes[PROTOCOL_LL128] = config.ll128_buff_size.unwrap_or(DEFAULT_LL128_BUFFER_SIZE);
    sizes[PROTOCOL_SIMPLE] = config.buff_size.unwrap_or(simple_default);
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_gets_smaller_simple_buffer() {
        let config = CommConfig::default();
        let x86 = compute_buff_sizes(&config, CpuArch::X86);
        let arm = compute_buff_sizes(&config, CpuArch::Arm);
        assert_eq!(x86[PROTOCOL_SIMPLE], 1 << 22);
        assert_eq!(arm[PROTOCOL_SIMPLE], 1 << 20);
        assert_eq!(x86[PROTOCOL_LL], arm[PROTOCOL_LL]);
    }

    #[test]
    fn explicit_overrides_beat_defaults() {
        let config = CommConfig {
            ll_buff_size: Some(1 << 16),
            buff_size: Some(1 << 21),
            ..Default::default()
        };
        let sizes = compute_buff_sizes(&config, CpuArch::Arm);
        assert_eq!(sizes[PROTOCOL_LL], 1 << 16);
        assert_eq!(sizes[PROTOCOL_LL128], DEFAULT_LL128_BUFFER_SIZE);
        assert_eq!(sizes[PROTOCOL_SIMPLE], 1 << 21);
    }
}
