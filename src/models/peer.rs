pub mod ban_score;
pub mod bloom;
pub mod session;

use std::fmt;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

use crate::models::blockchain::Block;
use crate::models::blockchain::BlockHeader;
use crate::models::blockchain::Hash;
use crate::models::blockchain::Transaction;
use crate::models::peer::bloom::BloomUpdateType;
use crate::models::peer::bloom::MerkleBlock;

/// Identifies a peer session for the lifetime of the process.
pub type PeerId = u64;

/// Identifies the connection request a dialed peer originated from.
pub type ConnReqId = u64;

/// Latest protocol version this node speaks.
pub const PROTOCOL_VERSION: u32 = 70013;

/// Peers announcing an older protocol version are disconnected.
pub const MIN_ACCEPTABLE_PROTOCOL_VERSION: u32 = 209;

/// First version that added a timestamp field to network addresses.
pub const NET_ADDRESS_TIME_VERSION: u32 = 31402;

/// First version with bloom filtering (BIP0037).
pub const BIP0037_VERSION: u32 = 70001;

/// First version which requires the bloom service flag to use filters
/// (BIP0111).
pub const BIP0111_VERSION: u32 = 70011;

/// First version that supports the `sendheaders` message.
pub const SEND_HEADERS_VERSION: u32 = 70012;

/// First version that supports the `feefilter` message.
pub const FEE_FILTER_VERSION: u32 = 70013;

pub const MAX_INV_PER_MSG: usize = 50_000;
pub const MAX_BLOCKS_PER_MSG: usize = 500;
pub const MAX_BLOCK_HEADERS_PER_MSG: usize = 2000;
pub const MAX_ADDR_PER_MSG: usize = 1000;
pub const MAX_CF_HEADERS_PER_MSG: usize = 2000;
pub const MAX_GET_CFILTERS_REQ_RANGE: usize = 1000;

/// Block spacing between committed filter header checkpoints.
pub const CF_CHECKPOINT_INTERVAL: u32 = 1000;

/// Satoshi per coin.
pub const SATOSHI_PER_COIN: i64 = 100_000_000;

/// Upper bound of any amount, used to sanity check fee filters.
pub const MAX_SATOSHI: i64 = 21_000_000 * SATOSHI_PER_COIN;

/// Services a node advertises in its version message.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    pub const NONE: ServiceFlags = ServiceFlags(0);
    pub const NODE_NETWORK: ServiceFlags = ServiceFlags(1);
    pub const NODE_GETUTXO: ServiceFlags = ServiceFlags(1 << 1);
    pub const NODE_BLOOM: ServiceFlags = ServiceFlags(1 << 2);
    pub const NODE_WITNESS: ServiceFlags = ServiceFlags(1 << 3);
    pub const NODE_XTHIN: ServiceFlags = ServiceFlags(1 << 4);
    pub const NODE_CF: ServiceFlags = ServiceFlags(1 << 6);

    pub fn contains(self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 & !other.0)
    }
}

impl BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceFlags({:#x})", self.0)
    }
}

impl fmt::LowerHex for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    WitnessBlock,
    WitnessTx,
    FilteredWitnessBlock,
}

impl fmt::Display for InvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            InvType::Error => "ERROR",
            InvType::Tx => "MSG_TX",
            InvType::Block => "MSG_BLOCK",
            InvType::FilteredBlock => "MSG_FILTERED_BLOCK",
            InvType::WitnessBlock => "MSG_WITNESS_BLOCK",
            InvType::WitnessTx => "MSG_WITNESS_TX",
            InvType::FilteredWitnessBlock => "MSG_FILTERED_WITNESS_BLOCK",
        };
        write!(f, "{}", string)
    }
}

/// Inventory vector: a (kind, hash) pair identifying a block or transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvVect {
    pub fn new(inv_type: InvType, hash: Hash) -> Self {
        Self { inv_type, hash }
    }

    pub fn tx(hash: Hash) -> Self {
        Self::new(InvType::Tx, hash)
    }

    pub fn block(hash: Hash) -> Self {
        Self::new(InvType::Block, hash)
    }
}

impl fmt::Display for InvVect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.inv_type, self.hash)
    }
}

/// A peer address as exchanged in `addr` messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    pub addr: SocketAddr,
    pub services: ServiceFlags,
    pub timestamp: SystemTime,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self {
            addr,
            services,
            timestamp: SystemTime::now(),
        }
    }

    /// Whether the address is reachable from the public internet.
    pub fn is_routable(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                !(ip.is_unspecified()
                    || ip.is_loopback()
                    || ip.is_private()
                    || ip.is_link_local()
                    || ip.is_broadcast()
                    || ip.is_documentation())
            }
            IpAddr::V6(ip) => {
                let first_segment = ip.segments()[0];
                !(ip.is_unspecified()
                    || ip.is_loopback()
                    || (first_segment & 0xfe00) == 0xfc00
                    || (first_segment & 0xffc0) == 0xfe80)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMessage {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    pub timestamp: SystemTime,
    pub user_agent: String,
    pub last_block: i32,
    pub disable_relay_tx: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    NonStandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectMessage {
    pub command: String,
    pub code: RejectCode,
    pub reason: String,
    pub hash: Option<Hash>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocatorRequest {
    pub protocol_version: u32,
    pub locator: Vec<Hash>,
    pub hash_stop: Hash,
}

/// Committed filter type. Only the regular filter is served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterType(pub u8);

impl FilterType {
    pub const REGULAR: FilterType = FilterType(0);
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request body shared by `getcfilters` and `getcfheaders`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CFRangeRequest {
    pub filter_type: FilterType,
    pub start_height: u32,
    pub stop_hash: Hash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CFCheckptRequest {
    pub filter_type: FilterType,
    pub stop_hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CFilterMessage {
    pub filter_type: FilterType,
    pub block_hash: Hash,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CFHeadersMessage {
    pub filter_type: FilterType,
    pub stop_hash: Hash,
    pub prev_filter_header: Hash,
    pub filter_hashes: Vec<Hash>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CFCheckptMessage {
    pub filter_type: FilterType,
    pub stop_hash: Hash,
    pub filter_headers: Vec<Hash>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterLoadMessage {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: BloomUpdateType,
}

/// Messages exchanged with a peer after framing.
///
/// [`MessageKind`] is the payload-free discriminant, used to key the
/// per-session listener table.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, strum::EnumDiscriminants)]
#[strum_discriminants(name(MessageKind), derive(Hash, strum::EnumIter))]
pub enum PeerMessage {
    Version(Box<VersionMessage>),
    VerAck,
    Addr(Vec<NetAddress>),
    GetAddr,
    Inv(Vec<InvVect>),
    GetData(Vec<InvVect>),
    NotFound(Vec<InvVect>),
    GetBlocks(BlockLocatorRequest),
    GetHeaders(BlockLocatorRequest),
    Headers(Vec<BlockHeader>),
    SendHeaders,
    Tx(Box<Transaction>),
    Block(Box<Block>),
    MerkleBlock(Box<MerkleBlock>),
    MemPool,
    FeeFilter(i64),
    FilterAdd(Vec<u8>),
    FilterClear,
    FilterLoad(FilterLoadMessage),
    GetCFilters(CFRangeRequest),
    GetCFHeaders(CFRangeRequest),
    GetCFCheckpt(CFCheckptRequest),
    CFilter(CFilterMessage),
    CFHeaders(CFHeadersMessage),
    CFCheckpt(CFCheckptMessage),
    Reject(RejectMessage),
}

impl PeerMessage {
    /// The command string of the message, as used in logs and reject
    /// messages.
    pub fn get_type(&self) -> &'static str {
        MessageKind::from(self).command()
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from(self)
    }
}

impl MessageKind {
    pub fn command(self) -> &'static str {
        match self {
            MessageKind::Version => "version",
            MessageKind::VerAck => "verack",
            MessageKind::Addr => "addr",
            MessageKind::GetAddr => "getaddr",
            MessageKind::Inv => "inv",
            MessageKind::GetData => "getdata",
            MessageKind::NotFound => "notfound",
            MessageKind::GetBlocks => "getblocks",
            MessageKind::GetHeaders => "getheaders",
            MessageKind::Headers => "headers",
            MessageKind::SendHeaders => "sendheaders",
            MessageKind::Tx => "tx",
            MessageKind::Block => "block",
            MessageKind::MerkleBlock => "merkleblock",
            MessageKind::MemPool => "mempool",
            MessageKind::FeeFilter => "feefilter",
            MessageKind::FilterAdd => "filteradd",
            MessageKind::FilterClear => "filterclear",
            MessageKind::FilterLoad => "filterload",
            MessageKind::GetCFilters => "getcfilters",
            MessageKind::GetCFHeaders => "getcfheaders",
            MessageKind::GetCFCheckpt => "getcfcheckpt",
            MessageKind::CFilter => "cfilter",
            MessageKind::CFHeaders => "cfheaders",
            MessageKind::CFCheckpt => "cfcheckpt",
            MessageKind::Reject => "reject",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command())
    }
}
