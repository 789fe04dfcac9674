use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::blockchain::BlockHeader;
use super::blockchain::Hash;
use super::blockchain::TxDesc;
use super::peer::session::PeerSession;
use super::peer::InvVect;
use super::peer::PeerId;
use super::peer::PeerMessage;
use crate::router::RouterError;

/// Payload attached to a relayed inventory vector. Peers that prefer headers
/// need the header of a block; fee and bloom filtering need the transaction.
#[derive(Clone, Debug)]
pub enum RelayData {
    None,
    BlockHeader(Box<BlockHeader>),
    TxDesc(Box<TxDesc>),
}

/// Announce `inv` to every peer that wants it.
#[derive(Clone, Debug)]
pub struct RelayMsg {
    pub inv: InvVect,
    pub data: RelayData,
}

/// Send `message` verbatim to all peers except the excluded ones.
#[derive(Clone, Debug)]
pub struct BroadcastMsg {
    pub message: PeerMessage,
    pub exclude: Vec<PeerId>,
}

/// Selects the sessions a remove/disconnect query applies to.
pub type PeerMatcher = Box<dyn Fn(&PeerSession) -> bool + Send>;

pub type Reply<T> = oneshot::Sender<T>;

/// Synchronous requests answered by the router. Every variant is answered,
/// error or not.
pub enum RouterQuery {
    ConnectionCount(Reply<usize>),

    /// All connected peers, inbound, outbound and persistent.
    Peers(Reply<Vec<Arc<PeerSession>>>),

    /// Ask the connection supervisor to dial `addr`. Fails if it is already a
    /// persistent peer.
    ConnectNode {
        addr: SocketAddr,
        permanent: bool,
        reply: Reply<Result<(), RouterError>>,
    },

    /// Remove matching persistent peers.
    RemoveNode {
        matcher: PeerMatcher,
        reply: Reply<Result<(), RouterError>>,
    },

    OutboundGroupCount {
        key: String,
        reply: Reply<usize>,
    },

    /// Persistent peers.
    AddedNodes(Reply<Vec<Arc<PeerSession>>>),

    /// Disconnect matching peers. Non-persistent outbound peers are searched
    /// until none match, as one endpoint may be connected more than once.
    DisconnectNode {
        matcher: PeerMatcher,
        reply: Reply<Result<(), RouterError>>,
    },
}

impl RouterQuery {
    pub fn get_type(&self) -> &'static str {
        match self {
            RouterQuery::ConnectionCount(_) => "connection count",
            RouterQuery::Peers(_) => "peers",
            RouterQuery::ConnectNode { .. } => "connect node",
            RouterQuery::RemoveNode { .. } => "remove node",
            RouterQuery::OutboundGroupCount { .. } => "outbound group count",
            RouterQuery::AddedNodes(_) => "added nodes",
            RouterQuery::DisconnectNode { .. } => "disconnect node",
        }
    }
}

impl fmt::Debug for RouterQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterQuery::ConnectNode {
                addr, permanent, ..
            } => f
                .debug_struct("ConnectNode")
                .field("addr", addr)
                .field("permanent", permanent)
                .finish(),
            RouterQuery::OutboundGroupCount { key, .. } => f
                .debug_struct("OutboundGroupCount")
                .field("key", key)
                .finish(),
            other => write!(f, "RouterQuery({})", other.get_type()),
        }
    }
}

/// Everything the router reacts to, on a single channel so that a peer's
/// join is always handled before its leave.
#[derive(Debug)]
pub enum RouterEvent {
    PeerJoined(Arc<PeerSession>),
    PeerLeft(Arc<PeerSession>),
    Ban(Arc<PeerSession>),
    Relay(RelayMsg),
    Broadcast(BroadcastMsg),
    UpdatePeerHeights {
        latest_block: Hash,
        height: i32,
        origin: Option<PeerId>,
    },
    Query(RouterQuery),
}

impl RouterEvent {
    pub fn get_type(&self) -> &'static str {
        match self {
            RouterEvent::PeerJoined(_) => "peer joined",
            RouterEvent::PeerLeft(_) => "peer left",
            RouterEvent::Ban(_) => "ban",
            RouterEvent::Relay(_) => "relay",
            RouterEvent::Broadcast(_) => "broadcast",
            RouterEvent::UpdatePeerHeights { .. } => "update peer heights",
            RouterEvent::Query(query) => query.get_type(),
        }
    }
}

/// Changes to the set of locally submitted inventory awaiting confirmation.
#[derive(Clone, Debug)]
pub enum RebroadcastCmd {
    Add { inv: InvVect, data: RelayData },
    Remove(InvVect),
}
