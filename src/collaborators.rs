//! Interfaces of the subsystems the peer server consumes but does not own:
//! chain storage, mempool, filter index, address manager, connection manager,
//! sync manager, median time source and NAT traversal.

use std::fmt;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::blockchain::BestState;
use crate::models::blockchain::Block;
use crate::models::blockchain::BlockHeader;
use crate::models::blockchain::Hash;
use crate::models::blockchain::Transaction;
use crate::models::blockchain::TxDesc;
use crate::models::peer::session::PeerSession;
use crate::models::peer::session::ProcessedSignal;
use crate::models::peer::ConnReqId;
use crate::models::peer::FilterType;
use crate::models::peer::InvVect;
use crate::models::peer::NetAddress;
use crate::models::peer::PeerId;
use crate::models::peer::ServiceFlags;

/// Read access to the best chain. Safe for concurrent use.
#[async_trait]
pub trait ChainQuery: Send + Sync {
    fn best_snapshot(&self) -> BestState;

    /// Hashes of the blocks after the first locator hash found on the main
    /// chain, up to `hash_stop` or `max_hashes`.
    fn locate_blocks(&self, locator: &[Hash], hash_stop: &Hash, max_hashes: usize) -> Vec<Hash>;

    fn locate_headers(&self, locator: &[Hash], hash_stop: &Hash) -> Vec<BlockHeader>;

    /// Hashes of main chain blocks from `start_height` to the block
    /// `end_hash`. Fails if `end_hash` is unknown or the range exceeds
    /// `max_results`.
    fn height_to_hash_range(
        &self,
        start_height: u32,
        end_hash: &Hash,
        max_results: usize,
    ) -> Result<Vec<Hash>>;

    /// Hashes of every `interval`-th block up to `end_hash`, genesis excluded.
    fn interval_block_hashes(&self, end_hash: &Hash, interval: u32) -> Result<Vec<Hash>>;

    fn is_segwit_active(&self) -> Result<bool>;

    async fn fetch_block(&self, hash: &Hash) -> Result<Block>;
}

pub trait MempoolQuery: Send + Sync {
    fn fetch_transaction(&self, txid: &Hash) -> Result<Transaction>;

    fn tx_descs(&self) -> Vec<TxDesc>;

    /// Evict orphans received from `tag`. Returns how many were evicted.
    fn remove_orphans_by_tag(&self, tag: PeerId) -> usize;
}

/// Committed filter storage. Each result vector is aligned with the
/// requested hashes; `None` marks a missing entry.
#[async_trait]
pub trait FilterIndex: Send + Sync {
    async fn filters_by_block_hashes(
        &self,
        block_hashes: &[Hash],
        filter_type: FilterType,
    ) -> Result<Vec<Option<Vec<u8>>>>;

    async fn filter_headers_by_block_hashes(
        &self,
        block_hashes: &[Hash],
        filter_type: FilterType,
    ) -> Result<Vec<Option<Hash>>>;

    async fn filter_hashes_by_block_hashes(
        &self,
        block_hashes: &[Hash],
        filter_type: FilterType,
    ) -> Result<Vec<Option<Hash>>>;
}

pub trait AddressBook: Send + Sync {
    fn add_addresses(&self, addresses: Vec<NetAddress>, source: &NetAddress);

    fn connected(&self, address: &NetAddress);

    fn attempt(&self, address: &NetAddress);

    fn good(&self, address: &NetAddress);

    fn set_services(&self, address: &NetAddress, services: ServiceFlags);

    /// Network group used to limit how many outbound peers share an address
    /// block.
    fn group_key(&self, address: &NetAddress) -> String;

    /// Random selection of known addresses to hand out in `addr` replies.
    fn address_cache(&self) -> Vec<NetAddress>;

    fn need_more_addresses(&self) -> bool;

    fn best_local_address(&self, remote: &NetAddress) -> NetAddress;

    fn add_local_address(&self, address: NetAddress) -> Result<()>;

    fn seed_from_dns(&self);

    fn start(&self);

    fn stop(&self);
}

pub trait ConnectionSupervisor: Send + Sync {
    fn connect(&self, addr: SocketAddr, permanent: bool);

    /// Tear down the connection belonging to `conn_req`. Permanent requests
    /// are retried.
    fn disconnect(&self, conn_req: ConnReqId);

    /// Forget `conn_req` entirely.
    fn remove(&self, conn_req: ConnReqId);

    fn start(&self);

    fn stop(&self);
}

/// Block download and validation. Handed blocks and transactions fire the
/// supplied signal once validated.
pub trait SyncManager: Send + Sync {
    fn new_peer(&self, session: &Arc<PeerSession>);

    fn done_peer(&self, session: &Arc<PeerSession>);

    fn queue_tx(&self, tx: Transaction, session: &Arc<PeerSession>, done: ProcessedSignal);

    fn queue_block(&self, block: Block, session: &Arc<PeerSession>, done: ProcessedSignal);

    fn queue_inv(&self, inventory: Vec<InvVect>, session: &Arc<PeerSession>);

    fn queue_headers(&self, headers: Vec<BlockHeader>, session: &Arc<PeerSession>);

    fn is_current(&self) -> bool;

    fn start(&self);

    fn stop(&self);
}

pub trait TimeSource: Send + Sync {
    fn add_time_sample(&self, source: &str, time: SystemTime);
}

#[async_trait]
pub trait Nat: Send + Sync {
    /// Map `external_port` to `internal_port`. Returns the mapped port.
    async fn add_port_mapping(
        &self,
        protocol: &str,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<u16>;

    async fn delete_port_mapping(
        &self,
        protocol: &str,
        external_port: u16,
        internal_port: u16,
    ) -> Result<()>;

    async fn external_address(&self) -> Result<IpAddr>;
}

/// Handles to everything the server talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainQuery>,
    pub mempool: Arc<dyn MempoolQuery>,
    pub filter_index: Option<Arc<dyn FilterIndex>>,
    pub address_book: Arc<dyn AddressBook>,
    pub connections: Arc<dyn ConnectionSupervisor>,
    pub sync: Arc<dyn SyncManager>,
    pub time_source: Arc<dyn TimeSource>,
    pub nat: Option<Arc<dyn Nat>>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("filter_index", &self.filter_index.is_some())
            .field("nat", &self.nat.is_some())
            .finish_non_exhaustive()
    }
}
