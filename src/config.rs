use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Kernel launch coordination mode for ranks sharing a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchMode {
    /// Cooperative multi-device launch across intra-node ranks.
    Group,
    /// One launch per rank; the fallback when cooperative launch is not
    /// uniformly supported.
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommConfig {
    /// Address the bootstrap listeners bind to. Must be reachable from every
    /// peer; the loopback default only covers single-host jobs.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    /// Overrides the host-identity hash source, like in containers where two
    /// jobs may observe the same machine id.
    #[serde(default)]
    pub host_id: Option<String>,
    /// Per-protocol buffer size overrides (LL, LL128, Simple). `None` selects
    /// the architecture-sensitive default.
    #[serde(default)]
    pub ll_buff_size: Option<usize>,
    #[serde(default)]
    pub ll128_buff_size: Option<usize>,
    #[serde(default)]
    pub buff_size: Option<usize>,
    /// Upper bound on ring channels requested from the topology builder.
    #[serde(default = "default_channel_count")]
    pub channel_count: u32,
    #[serde(default)]
    pub collnet_enable: bool,
    /// Cross-NIC policy forwarded to graph computation: 0 never, 1 always,
    /// 2 builder's choice.
    #[serde(default = "default_cross_nic")]
    pub cross_nic: u8,
    #[serde(default)]
    pub launch_mode: Option<LaunchMode>,
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

fn default_channel_count() -> u32 {
    2
}

fn default_cross_nic() -> u8 {
    2
}

impl Default for CommConfig {
    fn default() -> Self {
        CommConfig {
            listen_addr: default_listen_addr(),
            host_id: None,
            ll_buff_size: None,
            ll128_buff_size: None,
            buff_size: None,
            channel_count: default_channel_count(),
            collnet_enable: false,
            cross_nic: default_cross_nic(),
            launch_mode: None,
        }
    }
}

impl CommConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = CommConfig::default();
        assert!(!config.collnet_enable);
        assert_eq!(config.cross_nic, 2);
        assert!(config.host_id.is_none());
    }

    #[test]
    fn parses_partial_toml() {
        let config: CommConfig =
            toml::from_str("collnet_enable = true\nchannel_count = 4\n").unwrap();
        assert!(config.collnet_enable);
        assert_eq!(config.channel_count, 4);
        assert_eq!(config.listen_addr, default_listen_addr());
    }
}
