use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;

use super::ip_net::IpNet;
use super::network::Network;

/// Declarative specification of the configuration consumed by the peer
/// server.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Max number of inbound and outbound peers.
    #[clap(long, default_value = "125")]
    pub max_peers: usize,

    /// How long to ban misbehaving peers.
    ///
    /// E.g. --ban-duration 24h, --ban-duration 90m
    #[clap(long, default_value = "24h", value_parser = humantime::parse_duration)]
    pub ban_duration: Duration,

    /// Maximum allowed ban score before disconnecting and banning misbehaving
    /// peers. A warning is logged when half of it is crossed.
    #[clap(long, default_value = "100")]
    pub ban_threshold: u32,

    /// Disable banning of misbehaving peers.
    #[clap(long)]
    pub disable_banning: bool,

    /// Disable bloom filtering support.
    #[clap(long)]
    pub no_peer_bloom_filters: bool,

    /// Disable committed filtering (CF) support.
    #[clap(long)]
    pub no_cfilters: bool,

    /// Specify network, `main`, `testnet`, `regtest` or `simnet`.
    #[clap(long, default_value = "main")]
    pub network: Network,

    /// Disable DNS seeding for peers.
    #[clap(long)]
    pub disable_dns_seed: bool,

    /// Do not accept transactions from remote peers.
    #[clap(long)]
    pub blocks_only: bool,

    /// Add an IP network or IP that will not be banned. E.g.:
    /// --whitelist 192.168.1.0/24 --whitelist ::1
    #[clap(long)]
    pub whitelist: Vec<IpNet>,

    /// Disable listening for incoming connections. The local address is
    /// then never advertised to peers.
    #[clap(long)]
    pub disable_listen: bool,

    /// Use UPnP to map the listening port outside of NAT.
    #[clap(long)]
    pub upnp: bool,

    /// Interval at which queued inventory announcements are flushed to a
    /// peer.
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub trickle_interval: Duration,

    /// Port to map when UPnP is enabled. Defaults to the network's default
    /// port.
    #[clap(long)]
    pub default_port: Option<u16>,
}

impl Args {
    /// Whether a remote IP is covered by any of the whitelisted networks.
    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.iter().any(|net| net.contains(ip))
    }

    pub fn listen_port(&self) -> u16 {
        self.default_port
            .unwrap_or_else(|| self.network.default_port())
    }

    /// Half the ban threshold. Scores above it are logged as warnings.
    pub fn ban_warn_threshold(&self) -> u32 {
        self.ban_threshold >> 1
    }
}

impl Default for Args {
    fn default() -> Self {
        let empty: Vec<String> = vec![];
        Self::parse_from(empty)
    }
}
