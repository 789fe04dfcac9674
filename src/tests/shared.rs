use std::collections::HashMap;
use std::fmt::Debug;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Waker;
use std::time::Duration;
use std::time::SystemTime;

use anyhow::bail;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use bytes::BytesMut;
use futures::sink;
use futures::stream;
use futures::task::Context;
use futures::task::Poll;
use tokio_serde::formats::SymmetricalBincode;
use tokio_serde::Serializer;
use tokio_util::codec::Encoder;
use tokio_util::codec::LengthDelimitedCodec;

use crate::collaborators::AddressBook;
use crate::collaborators::ChainQuery;
use crate::collaborators::Collaborators;
use crate::collaborators::ConnectionSupervisor;
use crate::collaborators::FilterIndex;
use crate::collaborators::MempoolQuery;
use crate::collaborators::Nat;
use crate::collaborators::SyncManager;
use crate::collaborators::TimeSource;
use crate::models::blockchain::BestState;
use crate::models::blockchain::Block;
use crate::models::blockchain::BlockHeader;
use crate::models::blockchain::Hash;
use crate::models::blockchain::OutPoint;
use crate::models::blockchain::ScriptClass;
use crate::models::blockchain::Transaction;
use crate::models::blockchain::TxDesc;
use crate::models::blockchain::TxIn;
use crate::models::blockchain::TxOut;
use crate::models::peer::session::ConnectionOrigin;
use crate::models::peer::session::Outbound;
use crate::models::peer::session::PeerSession;
use crate::models::peer::session::ProcessedSignal;
use crate::models::peer::ConnReqId;
use crate::models::peer::FilterType;
use crate::models::peer::InvVect;
use crate::models::peer::NetAddress;
use crate::models::peer::PeerId;
use crate::models::peer::PeerMessage;
use crate::models::peer::ServiceFlags;
use crate::models::peer::MAX_BLOCK_HEADERS_PER_MSG;

pub(crate) fn to_bytes(message: &PeerMessage) -> Result<Bytes> {
    let mut transport = LengthDelimitedCodec::new();
    let mut formatting = SymmetricalBincode::<PeerMessage>::default();
    let mut buf = BytesMut::new();
    transport.encode(Pin::new(&mut formatting).serialize(message)?, &mut buf)?;
    Ok(buf.freeze())
}

// Box<Vec<T>> is unnecessary because Vec<T> is already heap-allocated.
// However, Box<...> is used here because Pin<T> does not allow a &mut T,
// So a Box<T> (which also implements DerefMut) allows a pinned, mutable
// pointer.
type ActionList<Item> = Box<Vec<Action<Item>>>;

/// Scripted peer connection. Reads wait while a write is due, so a reader
/// and a writer can drive the same script concurrently. Once the script is
/// exhausted the peer closes the connection.
#[derive(Debug)]
pub struct Mock<Item> {
    actions: ActionList<Item>,
    waiting_reader: Option<Waker>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MockError {
    WrongSend,
    UnexpectedSend,
    ReadError,
}

impl std::fmt::Display for MockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockError::WrongSend => write!(f, "WrongSend"),
            MockError::UnexpectedSend => write!(f, "UnexpectedSend"),
            MockError::ReadError => write!(f, "ReadError"),
        }
    }
}

impl std::error::Error for MockError {}

#[derive(Debug, Clone)]
pub enum Action<Item> {
    Read(Item),
    Write(Item),

    /// Simulates an error when reading the peer's message.
    ReadError,
}

impl<Item> Mock<Item> {
    pub fn new(actions: Vec<Action<Item>>) -> Mock<Item> {
        Mock {
            actions: Box::new(actions.into_iter().rev().collect()),
            waiting_reader: None,
        }
    }
}

impl<Item: PartialEq + Debug> sink::Sink<Item> for Mock<Item> {
    type Error = MockError;

    fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Item) -> Result<(), Self::Error> {
        let result = match (self.actions.pop(), item) {
            (Some(Action::Write(a)), item) if item == a => Ok(()),
            (Some(Action::Write(a)), item) => {
                eprintln!("expected write of {a:?}, got {item:?}");
                Err(MockError::WrongSend)
            }
            (_, item) => {
                eprintln!("unexpected write of {item:?}");
                Err(MockError::UnexpectedSend)
            }
        };
        if let Some(reader) = self.waiting_reader.take() {
            reader.wake();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl<Item> stream::Stream for Mock<Item> {
    type Item = Result<Item, MockError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if matches!(self.actions.last(), Some(Action::Write(_))) {
            self.waiting_reader = Some(cx.waker().clone());
            return Poll::Pending;
        }

        match self.actions.pop() {
            Some(Action::Read(a)) => Poll::Ready(Some(Ok(a))),
            Some(Action::ReadError) => Poll::Ready(Some(Err(MockError::ReadError))),
            Some(Action::Write(_)) | None => Poll::Ready(None),
        }
    }
}

pub(crate) fn hash_n(n: u8) -> Hash {
    Hash([n; 32])
}

fn marked_hash(marker: u8, n: u8) -> Hash {
    let mut bytes = [n; 32];
    bytes[0] = marker;
    Hash(bytes)
}

fn height_hash(height: usize) -> Hash {
    let mut bytes = [0xbc; 32];
    bytes[..8].copy_from_slice(&(height as u64).to_le_bytes());
    Hash(bytes)
}

pub(crate) fn transaction(n: u8) -> Transaction {
    Transaction {
        txid: marked_hash(0x7e, n),
        inputs: vec![TxIn {
            previous_outpoint: OutPoint {
                txid: marked_hash(0x7f, n),
                index: 0,
            },
            script_pushes: vec![vec![n; 33]],
        }],
        outputs: vec![TxOut {
            value: 50_000,
            class: ScriptClass::PubKeyHash,
            script_pushes: vec![vec![n; 20]],
        }],
        has_witness: false,
    }
}

pub(crate) fn tx_desc(n: u8, fee_per_kb: i64) -> TxDesc {
    TxDesc {
        tx: transaction(n),
        added: SystemTime::now(),
        height: 1,
        fee: fee_per_kb / 4,
        fee_per_kb,
    }
}

pub(crate) fn block_with_txs(n: u8, tx_count: usize) -> Block {
    let transactions = (0..tx_count)
        .map(|i| transaction(n.wrapping_mul(16).wrapping_add(i as u8)))
        .collect();
    Block {
        hash: marked_hash(0xb1, n),
        header: BlockHeader {
            version: 2,
            merkle_root: hash_n(n),
            timestamp: 1_700_000_000,
            ..Default::default()
        },
        transactions,
    }
}

pub(crate) fn session_at(
    id: PeerId,
    ip: IpAddr,
    origin: ConnectionOrigin,
) -> (Arc<PeerSession>, tokio::sync::mpsc::UnboundedReceiver<Outbound>) {
    PeerSession::new(id, SocketAddr::new(ip, 11047), origin, false)
}

/// Outbound session whose connection request id equals its peer id.
pub(crate) fn outbound_session(id: PeerId, ip: IpAddr, permanent: bool) -> Arc<PeerSession> {
    let origin = ConnectionOrigin::Outbound {
        conn_req: Some(id),
        permanent,
    };
    session_at(id, ip, origin).0
}

type Lifecycle = Arc<Mutex<Vec<&'static str>>>;

fn record(lifecycle: &Lifecycle, step: &'static str) {
    lifecycle.lock().unwrap().push(step);
}

#[derive(Debug, Default)]
struct ChainState {
    main_chain: Vec<Hash>,
    blocks: HashMap<Hash, Block>,
    segwit_active: bool,
}

#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    /// Append `count` blocks to the main chain, the first one at height
    /// zero. Returns their hashes.
    pub fn extend_main_chain(&self, count: usize) -> Vec<Hash> {
        let mut state = self.state.lock().unwrap();
        let mut added = vec![];
        for _ in 0..count {
            let height = state.main_chain.len();
            let hash = height_hash(height);
            let block = Block {
                hash,
                header: BlockHeader {
                    prev_block: state.main_chain.last().copied().unwrap_or_default(),
                    timestamp: 1_700_000_000 + height as u32,
                    ..Default::default()
                },
                transactions: vec![],
            };
            state.blocks.insert(hash, block);
            state.main_chain.push(hash);
            added.push(hash);
        }
        added
    }

    pub fn insert_block(&self, block: Block) {
        self.state.lock().unwrap().blocks.insert(block.hash, block);
    }

    pub fn set_segwit_active(&self, active: bool) {
        self.state.lock().unwrap().segwit_active = active;
    }

    fn height_of(state: &ChainState, hash: &Hash) -> Option<usize> {
        state.main_chain.iter().position(|h| h == hash)
    }

    fn locate(&self, locator: &[Hash], hash_stop: &Hash, max_hashes: usize) -> Vec<Hash> {
        let state = self.state.lock().unwrap();
        let start = locator
            .iter()
            .find_map(|hash| Self::height_of(&state, hash))
            .map_or(1, |height| height + 1);

        let mut located = vec![];
        for hash in state.main_chain.iter().skip(start) {
            located.push(*hash);
            if hash == hash_stop || located.len() == max_hashes {
                break;
            }
        }
        located
    }
}

#[async_trait]
impl ChainQuery for MockChain {
    fn best_snapshot(&self) -> BestState {
        let state = self.state.lock().unwrap();
        match state.main_chain.last() {
            Some(hash) => BestState {
                hash: *hash,
                height: state.main_chain.len() as i32 - 1,
            },
            None => BestState::default(),
        }
    }

    fn locate_blocks(&self, locator: &[Hash], hash_stop: &Hash, max_hashes: usize) -> Vec<Hash> {
        self.locate(locator, hash_stop, max_hashes)
    }

    fn locate_headers(&self, locator: &[Hash], hash_stop: &Hash) -> Vec<BlockHeader> {
        let hashes = self.locate(locator, hash_stop, MAX_BLOCK_HEADERS_PER_MSG);
        let state = self.state.lock().unwrap();
        hashes.iter().map(|hash| state.blocks[hash].header).collect()
    }

    fn height_to_hash_range(
        &self,
        start_height: u32,
        end_hash: &Hash,
        max_results: usize,
    ) -> Result<Vec<Hash>> {
        let state = self.state.lock().unwrap();
        let Some(end_height) = Self::height_of(&state, end_hash) else {
            bail!("unknown end hash {end_hash}");
        };
        let start_height = start_height as usize;
        if start_height > end_height {
            bail!("start height ({start_height}) exceeds end height ({end_height})");
        }
        if end_height - start_height + 1 > max_results {
            bail!("range exceeds {max_results} results");
        }
        Ok(state.main_chain[start_height..=end_height].to_vec())
    }

    fn interval_block_hashes(&self, end_hash: &Hash, interval: u32) -> Result<Vec<Hash>> {
        let state = self.state.lock().unwrap();
        let Some(end_height) = Self::height_of(&state, end_hash) else {
            bail!("unknown end hash {end_hash}");
        };
        let interval = interval as usize;
        Ok((interval..=end_height)
            .step_by(interval)
            .map(|height| state.main_chain[height])
            .collect())
    }

    fn is_segwit_active(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().segwit_active)
    }

    async fn fetch_block(&self, hash: &Hash) -> Result<Block> {
        match self.state.lock().unwrap().blocks.get(hash) {
            Some(block) => Ok(block.clone()),
            None => bail!("block {hash} not found"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MockMempool {
    pool: Mutex<Vec<TxDesc>>,
    orphans_by_tag: AtomicUsize,
}

impl MockMempool {
    pub fn insert(&self, desc: TxDesc) {
        self.pool.lock().unwrap().push(desc);
    }

    pub fn set_orphans_by_tag(&self, count: usize) {
        self.orphans_by_tag.store(count, Ordering::SeqCst);
    }
}

impl MempoolQuery for MockMempool {
    fn fetch_transaction(&self, txid: &Hash) -> Result<Transaction> {
        match self
            .pool
            .lock()
            .unwrap()
            .iter()
            .find(|desc| desc.tx.txid == *txid)
        {
            Some(desc) => Ok(desc.tx.clone()),
            None => bail!("transaction {txid} is not in the pool"),
        }
    }

    fn tx_descs(&self) -> Vec<TxDesc> {
        self.pool.lock().unwrap().clone()
    }

    fn remove_orphans_by_tag(&self, _tag: PeerId) -> usize {
        self.orphans_by_tag.swap(0, Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct MockFilterIndex {
    filters: Mutex<HashMap<Hash, Vec<u8>>>,
    headers: Mutex<HashMap<Hash, Hash>>,
    filter_hashes: Mutex<HashMap<Hash, Hash>>,
    headers_fetched: AtomicUsize,
    short_answers: AtomicBool,
}

impl MockFilterIndex {
    pub fn insert_filter(&self, block_hash: Hash, filter: Vec<u8>) {
        self.filters.lock().unwrap().insert(block_hash, filter);
    }

    pub fn insert_header(&self, block_hash: Hash, header: Hash) {
        self.headers.lock().unwrap().insert(block_hash, header);
    }

    pub fn insert_filter_hash(&self, block_hash: Hash, filter_hash: Hash) {
        self.filter_hashes
            .lock()
            .unwrap()
            .insert(block_hash, filter_hash);
    }

    /// Make every lookup answer one entry less than was asked for.
    pub fn set_short_answers(&self, short: bool) {
        self.short_answers.store(short, Ordering::SeqCst);
    }

    fn answer<T>(&self, mut answer: Vec<T>) -> Vec<T> {
        if self.short_answers.load(Ordering::SeqCst) {
            answer.pop();
        }
        answer
    }

    /// Number of block hashes filter headers were requested for.
    pub fn headers_fetched(&self) -> usize {
        self.headers_fetched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FilterIndex for MockFilterIndex {
    async fn filters_by_block_hashes(
        &self,
        block_hashes: &[Hash],
        _filter_type: FilterType,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let filters = self.filters.lock().unwrap();
        Ok(self.answer(
            block_hashes
                .iter()
                .map(|hash| filters.get(hash).cloned())
                .collect(),
        ))
    }

    async fn filter_headers_by_block_hashes(
        &self,
        block_hashes: &[Hash],
        _filter_type: FilterType,
    ) -> Result<Vec<Option<Hash>>> {
        self.headers_fetched
            .fetch_add(block_hashes.len(), Ordering::SeqCst);
        let headers = self.headers.lock().unwrap();
        Ok(block_hashes
            .iter()
            .map(|hash| headers.get(hash).copied())
            .collect())
    }

    async fn filter_hashes_by_block_hashes(
        &self,
        block_hashes: &[Hash],
        _filter_type: FilterType,
    ) -> Result<Vec<Option<Hash>>> {
        let filter_hashes = self.filter_hashes.lock().unwrap();
        Ok(self.answer(
            block_hashes
                .iter()
                .map(|hash| filter_hashes.get(hash).copied())
                .collect(),
        ))
    }
}

#[derive(Debug, Default)]
pub struct MockAddressBook {
    lifecycle: Lifecycle,
    added: Mutex<Vec<NetAddress>>,
    attempts: Mutex<Vec<NetAddress>>,
    connected: AtomicUsize,
    good: AtomicUsize,
    cache: Mutex<Vec<NetAddress>>,
    need_more_addresses: AtomicBool,
    local_addresses: Mutex<Vec<NetAddress>>,
}

impl MockAddressBook {
    /// Group of an IPv4 address: its first two octets.
    pub fn group_key_of(&self, ip: IpAddr) -> String {
        match ip {
            IpAddr::V4(ip) => {
                let [a, b, _, _] = ip.octets();
                format!("{a}.{b}")
            }
            IpAddr::V6(ip) => ip.segments()[..3]
                .iter()
                .map(|segment| format!("{segment:x}"))
                .collect::<Vec<_>>()
                .join(":"),
        }
    }

    pub fn added(&self) -> Vec<NetAddress> {
        self.added.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> Vec<NetAddress> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn good_count(&self) -> usize {
        self.good.load(Ordering::SeqCst)
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_address_cache(&self, addresses: Vec<NetAddress>) {
        *self.cache.lock().unwrap() = addresses;
    }

    pub fn set_need_more_addresses(&self, need: bool) {
        self.need_more_addresses.store(need, Ordering::SeqCst);
    }

    pub fn local_addresses(&self) -> Vec<NetAddress> {
        self.local_addresses.lock().unwrap().clone()
    }
}

impl AddressBook for MockAddressBook {
    fn add_addresses(&self, addresses: Vec<NetAddress>, _source: &NetAddress) {
        self.added.lock().unwrap().extend(addresses);
    }

    fn connected(&self, _address: &NetAddress) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn attempt(&self, address: &NetAddress) {
        self.attempts.lock().unwrap().push(*address);
    }

    fn good(&self, _address: &NetAddress) {
        self.good.fetch_add(1, Ordering::SeqCst);
    }

    fn set_services(&self, _address: &NetAddress, _services: ServiceFlags) {}

    fn group_key(&self, address: &NetAddress) -> String {
        self.group_key_of(address.addr.ip())
    }

    fn address_cache(&self) -> Vec<NetAddress> {
        self.cache.lock().unwrap().clone()
    }

    fn need_more_addresses(&self) -> bool {
        self.need_more_addresses.load(Ordering::SeqCst)
    }

    fn best_local_address(&self, _remote: &NetAddress) -> NetAddress {
        NetAddress::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 11047),
            ServiceFlags::NONE,
        )
    }

    fn add_local_address(&self, address: NetAddress) -> Result<()> {
        self.local_addresses.lock().unwrap().push(address);
        Ok(())
    }

    fn seed_from_dns(&self) {
        record(&self.lifecycle, "address_book.seed_from_dns");
    }

    fn start(&self) {
        record(&self.lifecycle, "address_book.start");
    }

    fn stop(&self) {
        record(&self.lifecycle, "address_book.stop");
    }
}

#[derive(Debug, Default)]
pub struct MockConnections {
    lifecycle: Lifecycle,
    connects: Mutex<Vec<(SocketAddr, bool)>>,
    disconnects: Mutex<Vec<ConnReqId>>,
    removed: Mutex<Vec<ConnReqId>>,
}

impl MockConnections {
    pub fn connects(&self) -> Vec<(SocketAddr, bool)> {
        self.connects.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<ConnReqId> {
        self.disconnects.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<ConnReqId> {
        self.removed.lock().unwrap().clone()
    }
}

impl ConnectionSupervisor for MockConnections {
    fn connect(&self, addr: SocketAddr, permanent: bool) {
        self.connects.lock().unwrap().push((addr, permanent));
    }

    fn disconnect(&self, conn_req: ConnReqId) {
        self.disconnects.lock().unwrap().push(conn_req);
    }

    fn remove(&self, conn_req: ConnReqId) {
        self.removed.lock().unwrap().push(conn_req);
    }

    fn start(&self) {
        record(&self.lifecycle, "connections.start");
    }

    fn stop(&self) {
        record(&self.lifecycle, "connections.stop");
    }
}

/// Sync manager that validates everything at once, unless told to hold the
/// completion signals back.
#[derive(Debug)]
pub struct MockSync {
    lifecycle: Lifecycle,
    new_peers: Mutex<Vec<PeerId>>,
    done_peers: Mutex<Vec<PeerId>>,
    queued_inv: Mutex<Vec<InvVect>>,
    queued_txs: Mutex<Vec<Hash>>,
    queued_blocks: Mutex<Vec<Hash>>,
    queued_headers: AtomicUsize,
    current: AtomicBool,
    hold_signals: AtomicBool,
    held: Mutex<Vec<ProcessedSignal>>,
}

impl Default for MockSync {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::default(),
            new_peers: Mutex::default(),
            done_peers: Mutex::default(),
            queued_inv: Mutex::default(),
            queued_txs: Mutex::default(),
            queued_blocks: Mutex::default(),
            queued_headers: AtomicUsize::new(0),
            current: AtomicBool::new(true),
            hold_signals: AtomicBool::new(false),
            held: Mutex::default(),
        }
    }
}

impl MockSync {
    pub fn new_peers(&self) -> Vec<PeerId> {
        self.new_peers.lock().unwrap().clone()
    }

    pub fn done_peers(&self) -> Vec<PeerId> {
        self.done_peers.lock().unwrap().clone()
    }

    pub fn queued_inv(&self) -> Vec<InvVect> {
        self.queued_inv.lock().unwrap().clone()
    }

    pub fn queued_txs(&self) -> Vec<Hash> {
        self.queued_txs.lock().unwrap().clone()
    }

    pub fn queued_blocks(&self) -> Vec<Hash> {
        self.queued_blocks.lock().unwrap().clone()
    }

    pub fn queued_headers(&self) -> usize {
        self.queued_headers.load(Ordering::SeqCst)
    }

    pub fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::SeqCst);
    }

    pub fn hold_signals(&self, hold: bool) {
        self.hold_signals.store(hold, Ordering::SeqCst);
    }

    pub fn release_signals(&self) {
        for signal in self.held.lock().unwrap().drain(..) {
            signal.done();
        }
    }

    fn processed(&self, done: ProcessedSignal) {
        if self.hold_signals.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push(done);
        } else {
            done.done();
        }
    }
}

impl SyncManager for MockSync {
    fn new_peer(&self, session: &Arc<PeerSession>) {
        self.new_peers.lock().unwrap().push(session.id());
    }

    fn done_peer(&self, session: &Arc<PeerSession>) {
        self.done_peers.lock().unwrap().push(session.id());
    }

    fn queue_tx(&self, tx: Transaction, _session: &Arc<PeerSession>, done: ProcessedSignal) {
        self.queued_txs.lock().unwrap().push(tx.txid);
        self.processed(done);
    }

    fn queue_block(&self, block: Block, _session: &Arc<PeerSession>, done: ProcessedSignal) {
        self.queued_blocks.lock().unwrap().push(block.hash);
        self.processed(done);
    }

    fn queue_inv(&self, inventory: Vec<InvVect>, _session: &Arc<PeerSession>) {
        self.queued_inv.lock().unwrap().extend(inventory);
    }

    fn queue_headers(&self, _headers: Vec<BlockHeader>, _session: &Arc<PeerSession>) {
        self.queued_headers.fetch_add(1, Ordering::SeqCst);
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    fn start(&self) {
        record(&self.lifecycle, "sync.start");
    }

    fn stop(&self) {
        record(&self.lifecycle, "sync.stop");
    }
}

#[derive(Debug, Default)]
pub struct MockTimeSource {
    samples: AtomicUsize,
}

impl MockTimeSource {
    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

impl TimeSource for MockTimeSource {
    fn add_time_sample(&self, _source: &str, _time: SystemTime) {
        self.samples.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: String,
    pub external_port: u16,
    pub internal_port: u16,
    pub description: String,
    pub lease: Duration,
}

/// NAT device that maps every requested port one to one.
#[derive(Debug, Default)]
pub struct MockNat {
    mappings: Mutex<Vec<PortMapping>>,
    deletions: Mutex<Vec<(String, u16, u16)>>,
    unreachable: AtomicBool,
}

impl MockNat {
    pub fn mappings(&self) -> Vec<PortMapping> {
        self.mappings.lock().unwrap().clone()
    }

    pub fn deletions(&self) -> Vec<(String, u16, u16)> {
        self.deletions.lock().unwrap().clone()
    }

    /// Make every request fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("NAT device unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl Nat for MockNat {
    async fn add_port_mapping(
        &self,
        protocol: &str,
        external_port: u16,
        internal_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<u16> {
        self.check_reachable()?;
        self.mappings.lock().unwrap().push(PortMapping {
            protocol: protocol.to_string(),
            external_port,
            internal_port,
            description: description.to_string(),
            lease,
        });
        Ok(external_port)
    }

    async fn delete_port_mapping(
        &self,
        protocol: &str,
        external_port: u16,
        internal_port: u16,
    ) -> Result<()> {
        self.check_reachable()?;
        self.deletions
            .lock()
            .unwrap()
            .push((protocol.to_string(), external_port, internal_port));
        Ok(())
    }

    async fn external_address(&self) -> Result<IpAddr> {
        self.check_reachable()?;
        Ok(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))
    }
}

/// Mocks of every collaborator, with a shared log of start and stop calls.
#[derive(Debug, Clone)]
pub struct TestCollaborators {
    pub chain: Arc<MockChain>,
    pub mempool: Arc<MockMempool>,
    pub filter_index: Arc<MockFilterIndex>,
    pub address_book: Arc<MockAddressBook>,
    pub connections: Arc<MockConnections>,
    pub sync: Arc<MockSync>,
    pub time_source: Arc<MockTimeSource>,
    pub nat: Arc<MockNat>,
    lifecycle: Lifecycle,
}

impl Default for TestCollaborators {
    fn default() -> Self {
        let lifecycle = Lifecycle::default();
        Self {
            chain: Arc::default(),
            mempool: Arc::default(),
            filter_index: Arc::default(),
            address_book: Arc::new(MockAddressBook {
                lifecycle: lifecycle.clone(),
                ..Default::default()
            }),
            connections: Arc::new(MockConnections {
                lifecycle: lifecycle.clone(),
                ..Default::default()
            }),
            sync: Arc::new(MockSync {
                lifecycle: lifecycle.clone(),
                ..Default::default()
            }),
            time_source: Arc::default(),
            nat: Arc::default(),
            lifecycle,
        }
    }
}

impl TestCollaborators {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            chain: self.chain.clone(),
            mempool: self.mempool.clone(),
            filter_index: Some(self.filter_index.clone()),
            address_book: self.address_book.clone(),
            connections: self.connections.clone(),
            sync: self.sync.clone(),
            time_source: self.time_source.clone(),
            nat: Some(self.nat.clone()),
        }
    }

    /// Start and stop calls in the order they were made.
    pub fn lifecycle(&self) -> Vec<&'static str> {
        self.lifecycle.lock().unwrap().clone()
    }
}
