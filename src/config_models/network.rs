use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;

#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default, EnumIter, strum::EnumIs,
)]
#[non_exhaustive]
pub enum Network {
    /// Main net.
    #[default]
    Main,

    /// Public test network.
    Testnet,

    /// Local regression test network. Used by integration tests involving
    /// multiple nodes on one machine.
    RegTest,

    /// Simulation network. Peers on simnet never learn or advertise addresses;
    /// connections are set up manually.
    SimNet,
}

impl Network {
    /// The port peers listen on by default.
    pub fn default_port(&self) -> u16 {
        match self {
            Network::Main => 11047,
            Network::Testnet => 21047,
            Network::RegTest => 31047,
            Network::SimNet => 41047,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            Network::Main => "main",
            Network::Testnet => "testnet",
            Network::RegTest => "regtest",
            Network::SimNet => "simnet",
        };
        write!(f, "{}", string)
    }
}

impl FromStr for Network {
    type Err = String;
    fn from_str(input: &str) -> Result<Network, Self::Err> {
        match input {
            "main" | "mainnet" => Ok(Network::Main),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::RegTest),
            "simnet" => Ok(Network::SimNet),
            _ => Err(format!("Failed to parse {} as network", input)),
        }
    }
}
