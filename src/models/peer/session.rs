use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFuture;

use super::ban_score::DynamicBanScore;
use super::bloom::BloomFilter;
use super::ConnReqId;
use super::InvVect;
use super::NetAddress;
use super::PeerId;
use super::PeerMessage;
use super::ServiceFlags;
use super::VersionMessage;
use super::PROTOCOL_VERSION;
use crate::models::blockchain::Hash;

/// Fires once the message it travels with has been written to the peer, or
/// when dropped without being sent.
pub type DoneSender = oneshot::Sender<()>;
pub type DoneReceiver = oneshot::Receiver<()>;

/// Entries of a session's send queue, drained by the peer's writer.
#[derive(Debug)]
pub enum Outbound {
    Message {
        message: PeerMessage,
        done: Option<DoneSender>,
    },

    /// Inventory is batched and trickled out rather than sent one by one.
    Inventory(InvVect),
}

/// How the connection behind a session came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    Inbound,
    Outbound {
        conn_req: Option<ConnReqId>,
        permanent: bool,
    },
}

/// What the peer told us in its version message, with the protocol version
/// already negotiated down to what both sides speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerVersion {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub last_block: i32,
}

/// Single-slot completion gate. Caps the number of blocks or transactions a
/// peer can have waiting for validation at one.
#[derive(Debug)]
pub struct ProcessedGate {
    signal: mpsc::Sender<()>,
    wait: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

/// Handed to the validator together with the payload; fires the gate.
#[derive(Debug, Clone)]
pub struct ProcessedSignal(mpsc::Sender<()>);

impl ProcessedSignal {
    pub fn done(&self) {
        let _ = self.0.try_send(());
    }
}

impl ProcessedGate {
    pub fn new() -> Self {
        let (signal, wait) = mpsc::channel(1);
        Self {
            signal,
            wait: tokio::sync::Mutex::new(wait),
        }
    }

    pub fn signaller(&self) -> ProcessedSignal {
        ProcessedSignal(self.signal.clone())
    }

    /// Wait until the validator signalled completion.
    pub async fn wait(&self) {
        self.wait.lock().await.recv().await;
    }
}

impl Default for ProcessedGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection state shared between the peer's reader and writer, the
/// router and relay.
///
/// Fields read from other peers' contexts (fee filter, relay flag, filter,
/// ban score) are individually synchronized and never shared across peers.
#[derive(Debug)]
pub struct PeerSession {
    id: PeerId,
    addr: SocketAddr,
    origin: ConnectionOrigin,
    whitelisted: bool,

    version: Mutex<Option<PeerVersion>>,
    verack_received: AtomicBool,
    wants_headers: AtomicBool,
    relay_tx_disabled: AtomicBool,
    fee_filter: AtomicI64,
    filter: Mutex<Option<BloomFilter>>,
    known_inventory: Mutex<HashSet<InvVect>>,
    known_addresses: Mutex<HashSet<SocketAddr>>,
    ban_score: DynamicBanScore,
    disconnect: CancellationToken,

    tx_processed: ProcessedGate,
    block_processed: ProcessedGate,

    /// Hash of the last block announced in a full `getblocks` answer. When the
    /// peer requests that block, it is nudged with an inv of our tip so it
    /// asks for the next batch.
    continue_hash: Mutex<Option<Hash>>,
    sent_addrs: AtomicBool,
    last_announced_block: Mutex<Option<Hash>>,
    last_block_height: AtomicI32,

    send_queue: mpsc::UnboundedSender<Outbound>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PeerSession {
    /// Create a session and the receiving end of its send queue, which
    /// belongs to the peer's writer.
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        origin: ConnectionOrigin,
        whitelisted: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (send_queue, outbound_rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            addr,
            origin,
            whitelisted,
            version: Mutex::new(None),
            verack_received: AtomicBool::new(false),
            wants_headers: AtomicBool::new(false),
            relay_tx_disabled: AtomicBool::new(false),
            fee_filter: AtomicI64::new(0),
            filter: Mutex::new(None),
            known_inventory: Mutex::new(HashSet::new()),
            known_addresses: Mutex::new(HashSet::new()),
            ban_score: DynamicBanScore::new(),
            disconnect: CancellationToken::new(),
            tx_processed: ProcessedGate::new(),
            block_processed: ProcessedGate::new(),
            continue_hash: Mutex::new(None),
            sent_addrs: AtomicBool::new(false),
            last_announced_block: Mutex::new(None),
            last_block_height: AtomicI32::new(0),
            send_queue,
        };
        (Arc::new(session), outbound_rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn is_inbound(&self) -> bool {
        self.origin == ConnectionOrigin::Inbound
    }

    pub fn is_persistent(&self) -> bool {
        matches!(
            self.origin,
            ConnectionOrigin::Outbound {
                permanent: true,
                ..
            }
        )
    }

    pub fn conn_req(&self) -> Option<ConnReqId> {
        match self.origin {
            ConnectionOrigin::Outbound { conn_req, .. } => conn_req,
            ConnectionOrigin::Inbound => None,
        }
    }

    pub fn is_whitelisted(&self) -> bool {
        self.whitelisted
    }

    /// Record the peer's version message. Returns the negotiated version.
    pub fn set_version(&self, message: &VersionMessage) -> PeerVersion {
        let version = PeerVersion {
            protocol_version: message.protocol_version.min(PROTOCOL_VERSION),
            services: message.services,
            user_agent: message.user_agent.clone(),
            last_block: message.last_block,
        };
        self.last_block_height
            .store(message.last_block, Ordering::Relaxed);
        *lock(&self.version) = Some(version.clone());
        version
    }

    pub fn version(&self) -> Option<PeerVersion> {
        lock(&self.version).clone()
    }

    pub fn version_known(&self) -> bool {
        lock(&self.version).is_some()
    }

    /// Negotiated protocol version, or our own before negotiation.
    pub fn protocol_version(&self) -> u32 {
        lock(&self.version)
            .as_ref()
            .map(|v| v.protocol_version)
            .unwrap_or(PROTOCOL_VERSION)
    }

    pub fn services(&self) -> ServiceFlags {
        lock(&self.version)
            .as_ref()
            .map(|v| v.services)
            .unwrap_or_default()
    }

    /// The peer's address as recorded in the address book.
    pub fn na(&self) -> NetAddress {
        NetAddress::new(self.addr, self.services())
    }

    pub fn set_verack_received(&self) {
        self.verack_received.store(true, Ordering::Relaxed);
    }

    pub fn verack_received(&self) -> bool {
        self.verack_received.load(Ordering::Relaxed)
    }

    pub fn set_wants_headers(&self) {
        self.wants_headers.store(true, Ordering::Relaxed);
    }

    pub fn wants_headers(&self) -> bool {
        self.wants_headers.load(Ordering::Relaxed)
    }

    pub fn set_relay_tx_disabled(&self, disabled: bool) {
        self.relay_tx_disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn relay_tx_disabled(&self) -> bool {
        self.relay_tx_disabled.load(Ordering::Relaxed)
    }

    pub fn set_fee_filter(&self, min_fee_per_kb: i64) {
        self.fee_filter.store(min_fee_per_kb, Ordering::Relaxed);
    }

    pub fn fee_filter(&self) -> i64 {
        self.fee_filter.load(Ordering::Relaxed)
    }

    pub fn filter_is_loaded(&self) -> bool {
        lock(&self.filter).is_some()
    }

    pub fn load_filter(&self, filter: BloomFilter) {
        *lock(&self.filter) = Some(filter);
    }

    pub fn unload_filter(&self) {
        *lock(&self.filter) = None;
    }

    /// Run `f` against the loaded filter. `None` if no filter is loaded.
    pub fn with_filter<R>(&self, f: impl FnOnce(&mut BloomFilter) -> R) -> Option<R> {
        lock(&self.filter).as_mut().map(f)
    }

    pub fn add_known_inventory(&self, inv: InvVect) {
        lock(&self.known_inventory).insert(inv);
    }

    pub fn knows_inventory(&self, inv: &InvVect) -> bool {
        lock(&self.known_inventory).contains(inv)
    }

    pub fn add_known_addresses(&self, addresses: &[NetAddress]) {
        lock(&self.known_addresses).extend(addresses.iter().map(|na| na.addr));
    }

    pub fn address_known(&self, address: &NetAddress) -> bool {
        lock(&self.known_addresses).contains(&address.addr)
    }

    pub fn ban_score(&self) -> &DynamicBanScore {
        &self.ban_score
    }

    pub fn disconnect(&self) {
        self.disconnect.cancel();
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnect.is_cancelled()
    }

    /// Resolves once the session has been told to disconnect.
    pub fn disconnected(&self) -> WaitForCancellationFuture<'_> {
        self.disconnect.cancelled()
    }

    pub fn tx_processed(&self) -> &ProcessedGate {
        &self.tx_processed
    }

    pub fn block_processed(&self) -> &ProcessedGate {
        &self.block_processed
    }

    pub fn continue_hash(&self) -> Option<Hash> {
        *lock(&self.continue_hash)
    }

    pub fn set_continue_hash(&self, hash: Option<Hash>) {
        *lock(&self.continue_hash) = hash;
    }

    /// Mark that the address cache was sent. Returns whether it already had
    /// been.
    pub fn mark_sent_addrs(&self) -> bool {
        self.sent_addrs.swap(true, Ordering::Relaxed)
    }

    pub fn last_announced_block(&self) -> Option<Hash> {
        *lock(&self.last_announced_block)
    }

    pub fn update_last_announced_block(&self, hash: Option<Hash>) {
        *lock(&self.last_announced_block) = hash;
    }

    pub fn last_block_height(&self) -> i32 {
        self.last_block_height.load(Ordering::Relaxed)
    }

    pub fn update_last_block_height(&self, height: i32) {
        self.last_block_height.store(height, Ordering::Relaxed);
    }

    /// Queue a message to the peer. `done` fires once it was written, or
    /// right away if the peer is gone.
    pub fn queue_message(&self, message: PeerMessage, done: Option<DoneSender>) {
        if !self.is_connected() {
            return;
        }
        let _ = self.send_queue.send(Outbound::Message { message, done });
    }

    /// Queue an inventory announcement unless the peer already knows it.
    pub fn queue_inventory(&self, inv: InvVect) {
        if !self.is_connected() {
            return;
        }
        {
            let mut known = lock(&self.known_inventory);
            if !known.insert(inv) {
                return;
            }
        }
        let _ = self.send_queue.send(Outbound::Inventory(inv));
    }
}

impl fmt::Display for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.is_inbound() {
            "inbound"
        } else {
            "outbound"
        };
        write!(f, "{} ({})", self.addr, direction)
    }
}
