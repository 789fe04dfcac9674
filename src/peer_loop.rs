mod cfilters;
mod get_data;

use std::collections::HashMap;
use std::fmt;
use std::marker::Unpin;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use anyhow::bail;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::sink::Sink;
use futures::sink::SinkExt;
use futures::stream::Stream;
use futures::stream::StreamExt;
use itertools::Itertools;
use rand::seq::SliceRandom;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::cf_checkpoint_cache::CfCheckpointCache;
use crate::collaborators::Collaborators;
use crate::config_models::cli_args;
use crate::macros::fn_name;
use crate::macros::log_slow_scope;
use crate::misbehavior::MisbehaviorScorer;
use crate::models::blockchain::BlockHeader;
use crate::models::blockchain::Hash;
use crate::models::blockchain::Block;
use crate::models::blockchain::Transaction;
use crate::models::peer::bloom::BloomFilter;
use crate::models::peer::bloom::MAX_FILTER_ADD_DATA_SIZE;
use crate::models::peer::bloom::MAX_FILTER_LOAD_FILTER_SIZE;
use crate::models::peer::bloom::MAX_FILTER_LOAD_HASH_FUNCS;
use crate::models::peer::session::Outbound;
use crate::models::peer::session::PeerSession;
use crate::models::peer::BlockLocatorRequest;
use crate::models::peer::FilterLoadMessage;
use crate::models::peer::InvType;
use crate::models::peer::InvVect;
use crate::models::peer::MessageKind;
use crate::models::peer::NetAddress;
use crate::models::peer::PeerMessage;
use crate::models::peer::RejectCode;
use crate::models::peer::RejectMessage;
use crate::models::peer::ServiceFlags;
use crate::models::peer::VersionMessage;
use crate::models::peer::BIP0037_VERSION;
use crate::models::peer::BIP0111_VERSION;
use crate::models::peer::MAX_ADDR_PER_MSG;
use crate::models::peer::MAX_BLOCKS_PER_MSG;
use crate::models::peer::MAX_INV_PER_MSG;
use crate::models::peer::MAX_SATOSHI;
use crate::models::peer::MIN_ACCEPTABLE_PROTOCOL_VERSION;
use crate::models::peer::NET_ADDRESS_TIME_VERSION;
use crate::models::peer::PROTOCOL_VERSION;
use crate::router::log_router_error;
use crate::router::RouterHandle;
use crate::server::NetTotals;
use crate::transport::serialized_size;

const KEEP_CONNECTION_ALIVE: bool = false;
const DISCONNECT_CONNECTION: bool = true;

/// Addresses stamped further than this into the future are treated as stale.
const MAX_ADDR_FUTURE_DRIFT: Duration = Duration::from_secs(10 * 60);

/// Age assigned to addresses with a timestamp too far in the future.
const STALE_ADDR_AGE: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Handles a single kind of message. Returns `Ok(true)` if the connection
/// should be closed.
pub type Listener = for<'a> fn(&'a ServerPeer, PeerMessage) -> BoxFuture<'a, Result<bool>>;

pub type Listeners = HashMap<MessageKind, Listener>;

macro_rules! listener {
    ($variant:ident => $handler:ident) => {{
        fn listener(peer: &ServerPeer, message: PeerMessage) -> BoxFuture<'_, Result<bool>> {
            Box::pin(async move {
                match message {
                    PeerMessage::$variant(payload) => peer.$handler(payload).await,
                    other => bail!(
                        "{} listener invoked with {}",
                        MessageKind::$variant,
                        other.get_type()
                    ),
                }
            })
        }
        (MessageKind::$variant, listener as Listener)
    }};
    ($variant:ident => $handler:ident()) => {{
        fn listener(peer: &ServerPeer, message: PeerMessage) -> BoxFuture<'_, Result<bool>> {
            Box::pin(async move {
                match message {
                    PeerMessage::$variant => peer.$handler().await,
                    other => bail!(
                        "{} listener invoked with {}",
                        MessageKind::$variant,
                        other.get_type()
                    ),
                }
            })
        }
        (MessageKind::$variant, listener as Listener)
    }};
}

/// The listener table a session gets for the given configuration. Without
/// committed filter support, `getcf*` requests find no listener and are
/// ignored.
pub fn default_listeners(cli: &cli_args::Args) -> Listeners {
    let mut listeners: Listeners = [
        listener!(Version => on_version),
        listener!(VerAck => on_verack()),
        listener!(Addr => on_addr),
        listener!(GetAddr => on_get_addr()),
        listener!(Inv => on_inv),
        listener!(GetData => on_get_data),
        listener!(NotFound => on_not_found),
        listener!(GetBlocks => on_get_blocks),
        listener!(GetHeaders => on_get_headers),
        listener!(Headers => on_headers),
        listener!(SendHeaders => on_send_headers()),
        listener!(Tx => on_tx),
        listener!(Block => on_block),
        listener!(MemPool => on_mem_pool()),
        listener!(FeeFilter => on_fee_filter),
        listener!(FilterAdd => on_filter_add),
        listener!(FilterClear => on_filter_clear()),
        listener!(FilterLoad => on_filter_load),
        listener!(Reject => on_reject),
    ]
    .into_iter()
    .collect();

    if !cli.no_cfilters {
        listeners.extend([
            listener!(GetCFilters => on_get_cfilters),
            listener!(GetCFHeaders => on_get_cfheaders),
            listener!(GetCFCheckpt => on_get_cfcheckpt),
        ]);
    }

    listeners
}

/// Node-wide state every peer loop reads.
#[derive(Debug)]
pub struct PeerContext {
    pub cli: cli_args::Args,
    pub collaborators: Collaborators,
    pub router: RouterHandle,
    pub services: ServiceFlags,
    pub cf_cache: CfCheckpointCache,
    pub net_totals: NetTotals,
    pub scorer: MisbehaviorScorer,

    /// Cancelled when the server shuts down. Every peer disconnects then.
    pub quit: CancellationToken,

    #[cfg(test)]
    mock_now: Option<SystemTime>,
}

impl PeerContext {
    pub fn new(
        cli: cli_args::Args,
        collaborators: Collaborators,
        router: RouterHandle,
        services: ServiceFlags,
        quit: CancellationToken,
    ) -> Self {
        let scorer = MisbehaviorScorer::new(&cli);
        Self {
            cli,
            collaborators,
            router,
            services,
            cf_cache: CfCheckpointCache::new(),
            net_totals: NetTotals::default(),
            scorer,
            quit,
            #[cfg(test)]
            mock_now: None,
        }
    }

    /// Allows for mocked timestamps such that version messages may be
    /// compared in tests.
    #[cfg(test)]
    pub(crate) fn with_mocked_time(mut self, mocked_time: SystemTime) -> Self {
        self.mock_now = Some(mocked_time);
        self
    }

    fn now(&self) -> SystemTime {
        #[cfg(not(test))]
        {
            SystemTime::now()
        }
        #[cfg(test)]
        {
            self.mock_now.unwrap_or(SystemTime::now())
        }
    }

    /// The version message this node announces itself with.
    pub fn local_version(&self) -> VersionMessage {
        VersionMessage {
            protocol_version: PROTOCOL_VERSION,
            services: self.services,
            timestamp: self.now(),
            user_agent: format!("/pod:{}/", crate::VERSION),
            last_block: self.collaborators.chain.best_snapshot().height,
            disable_relay_tx: self.cli.blocks_only,
        }
    }
}

/// Drives one peer connection: reads and dispatches its messages through the
/// listener table, writes its send queue, and reports its departure.
pub struct ServerPeer {
    session: Arc<PeerSession>,
    context: Arc<PeerContext>,
    listeners: Listeners,
}

impl fmt::Debug for ServerPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPeer")
            .field("session", &self.session)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl ServerPeer {
    pub fn new(session: Arc<PeerSession>, context: Arc<PeerContext>, listeners: Listeners) -> Self {
        Self {
            session,
            context,
            listeners,
        }
    }

    pub fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    /// Score misbehavior; past the ban threshold the host is banned and the
    /// session disconnected. Returns whether that happened.
    async fn add_ban_score(&self, persistent: u32, transient: u32, reason: &str) -> bool {
        self.context
            .scorer
            .add_ban_score(
                &self.session,
                &self.context.router,
                persistent,
                transient,
                reason,
            )
            .await
    }

    fn push_reject(&self, kind: MessageKind, code: RejectCode, reason: String, hash: Option<Hash>) {
        self.session.queue_message(
            PeerMessage::Reject(RejectMessage {
                command: kind.command().to_string(),
                code,
                reason,
                hash,
            }),
            None,
        );
    }

    /// Send the addresses the peer does not know yet, at most
    /// [`MAX_ADDR_PER_MSG`] of them picked at random.
    fn push_addr_msg(&self, addresses: Vec<NetAddress>) {
        let mut unknown = addresses
            .into_iter()
            .filter(|address| !self.session.address_known(address))
            .collect_vec();
        if unknown.is_empty() {
            return;
        }

        if unknown.len() > MAX_ADDR_PER_MSG {
            unknown.shuffle(&mut rand::rng());
            unknown.truncate(MAX_ADDR_PER_MSG);
        }

        self.session.add_known_addresses(&unknown);
        self.session.queue_message(PeerMessage::Addr(unknown), None);
    }

    /// Disconnect (and possibly ban) peers sending bloom filter messages to a
    /// node that does not offer bloom filtering. Returns whether the request
    /// may be served.
    async fn enforce_node_bloom_flag(&self, kind: MessageKind) -> bool {
        if self.context.services.contains(ServiceFlags::NODE_BLOOM) {
            return true;
        }

        // Peers at this version know better than to ask.
        if self.session.protocol_version() >= BIP0111_VERSION && !self.context.cli.disable_banning
        {
            self.add_ban_score(100, 0, kind.command()).await;
            self.session.disconnect();
            return false;
        }

        debug!(
            "{} sent an unsupported {} request -- disconnecting",
            self.session, kind
        );
        self.session.disconnect();
        false
    }

    /// Dispatch a message through the listener table.
    ///
    /// Returns `Ok(true)` if the connection should be closed. The connection
    /// should also be closed if an error is returned.
    async fn handle_peer_message(&self, message: PeerMessage) -> Result<bool> {
        let kind = message.kind();
        debug!("Received {} from peer {}", kind, self.session);

        if !self.session.version_known() && kind != MessageKind::Version {
            debug!(
                "A version message must precede all others, got {} from {} -- disconnecting",
                kind, self.session
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        let Some(listener) = self.listeners.get(&kind) else {
            debug!("Ignoring {} from {}: no listener", kind, self.session);
            return Ok(KEEP_CONNECTION_ALIVE);
        };

        listener(self, message).await
    }

    async fn on_version(&self, msg: Box<VersionMessage>) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::Version");

        if self.session.version_known() {
            self.push_reject(
                MessageKind::Version,
                RejectCode::Duplicate,
                "duplicate version message".to_string(),
                None,
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        let cli = &self.context.cli;
        let collaborators = &self.context.collaborators;
        let address_book = &collaborators.address_book;
        let inbound = self.session.is_inbound();
        let sim_net = cli.network.is_sim_net();
        let remote = NetAddress::new(self.session.addr(), msg.services);

        // Recorded before the version check so the services are up to date
        // even for peers that have not upgraded yet.
        if !sim_net && !inbound {
            address_book.set_services(&remote, msg.services);
        }

        if msg.protocol_version < MIN_ACCEPTABLE_PROTOCOL_VERSION {
            debug!(
                "Protocol version {} of peer {} is lower than the minimum {} -- disconnecting",
                msg.protocol_version, self.session, MIN_ACCEPTABLE_PROTOCOL_VERSION
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        if !inbound && !msg.services.contains(ServiceFlags::NODE_NETWORK) {
            let missing = ServiceFlags::NODE_NETWORK.without(msg.services);
            debug!(
                "Rejecting peer {} with services {:?} due to not providing desired services {:?}",
                self.session, msg.services, missing
            );
            self.push_reject(
                MessageKind::Version,
                RejectCode::NonStandard,
                format!("required services {:#x} not offered", missing),
                None,
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        let version = self.session.set_version(&msg);
        if inbound {
            let local_version = self.context.local_version();
            self.session
                .queue_message(PeerMessage::Version(Box::new(local_version)), None);
        }
        self.session.queue_message(PeerMessage::VerAck, None);

        if !sim_net && !inbound {
            match collaborators.chain.is_segwit_active() {
                Ok(true) if !msg.services.contains(ServiceFlags::NODE_WITNESS) => {
                    info!(
                        "Disconnecting non-segwit peer {}, isn't segwit enabled and we need more segwit enabled peers",
                        self.session
                    );
                    return Ok(DISCONNECT_CONNECTION);
                }
                Ok(_) => {}
                Err(err) => {
                    error!("Unable to query for segwit soft-fork state: {err}");
                    return Ok(DISCONNECT_CONNECTION);
                }
            }

            if !cli.disable_listen && collaborators.sync.is_current() {
                let local = address_book.best_local_address(&remote);
                if local.is_routable() {
                    self.push_addr_msg(vec![local]);
                }
            }

            if address_book.need_more_addresses()
                && version.protocol_version >= NET_ADDRESS_TIME_VERSION
            {
                self.session.queue_message(PeerMessage::GetAddr, None);
            }

            address_book.good(&remote);
        }

        collaborators
            .time_source
            .add_time_sample(&self.session.addr().to_string(), msg.timestamp);
        collaborators.sync.new_peer(&self.session);
        self.session.set_relay_tx_disabled(msg.disable_relay_tx);

        if let Err(err) = self.context.router.peer_joined(self.session.clone()).await {
            debug!("Can't register peer {}: {err} -- disconnecting", self.session);
            return Ok(DISCONNECT_CONNECTION);
        }

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_verack(&self) -> Result<bool> {
        self.session.set_verack_received();
        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_addr(&self, mut addresses: Vec<NetAddress>) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::Addr");

        if self.context.cli.network.is_sim_net()
            || self.session.protocol_version() < NET_ADDRESS_TIME_VERSION
        {
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        if addresses.is_empty() {
            error!(
                "Command [addr] from {} does not contain any addresses",
                self.session
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        if addresses.len() > MAX_ADDR_PER_MSG {
            debug!(
                "Too many addresses in addr message from {} [count {}, max {}] -- disconnecting",
                self.session,
                addresses.len(),
                MAX_ADDR_PER_MSG
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        let now = SystemTime::now();
        for address in &mut addresses {
            if !self.session.is_connected() {
                return Ok(DISCONNECT_CONNECTION);
            }
            if address.timestamp > now + MAX_ADDR_FUTURE_DRIFT {
                address.timestamp = now - STALE_ADDR_AGE;
            }
        }
        self.session.add_known_addresses(&addresses);

        self.context
            .collaborators
            .address_book
            .add_addresses(addresses, &self.session.na());

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_get_addr(&self) -> Result<bool> {
        if self.context.cli.network.is_sim_net() {
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        // Only inbound peers get addresses, to blunt fingerprinting.
        if !self.session.is_inbound() {
            debug!("Ignoring getaddr request from outbound peer {}", self.session);
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        if self.session.mark_sent_addrs() {
            debug!("Ignoring repeated getaddr request from peer {}", self.session);
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        let cache = self.context.collaborators.address_book.address_cache();
        self.push_addr_msg(cache);

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_inv(&self, inventory: Vec<InvVect>) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::Inv");

        if inventory.len() > MAX_INV_PER_MSG {
            debug!(
                "Too many inventory vectors from {} [count {}, max {}] -- disconnecting",
                self.session,
                inventory.len(),
                MAX_INV_PER_MSG
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        let sync = &self.context.collaborators.sync;
        if !self.context.cli.blocks_only {
            if !inventory.is_empty() {
                sync.queue_inv(inventory, &self.session);
            }
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        let mut blocks = Vec::with_capacity(inventory.len());
        for inv in inventory {
            if matches!(inv.inv_type, InvType::Tx | InvType::WitnessTx) {
                trace!(
                    "Ignoring tx {} in inv from {} -- blocksonly enabled",
                    inv.hash,
                    self.session
                );
                if self.session.protocol_version() >= BIP0037_VERSION {
                    info!(
                        "Peer {} is announcing transactions -- disconnecting",
                        self.session
                    );
                    return Ok(DISCONNECT_CONNECTION);
                }
                continue;
            }
            blocks.push(inv);
        }

        if !blocks.is_empty() {
            sync.queue_inv(blocks, &self.session);
        }

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_not_found(&self, inventory: Vec<InvVect>) -> Result<bool> {
        trace!(
            "Peer {} did not find {} requested items",
            self.session,
            inventory.len()
        );
        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_headers(&self, headers: Vec<BlockHeader>) -> Result<bool> {
        self.context
            .collaborators
            .sync
            .queue_headers(headers, &self.session);
        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_send_headers(&self) -> Result<bool> {
        self.session.set_wants_headers();
        Ok(KEEP_CONNECTION_ALIVE)
    }

    /// Hand the transaction to the sync manager and wait until it has been
    /// validated, so a peer never has more than one unvalidated transaction
    /// in memory.
    async fn on_tx(&self, tx: Box<Transaction>) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::Tx");

        if self.context.cli.blocks_only {
            trace!(
                "Ignoring tx {} from {} - blocksonly enabled",
                tx.txid,
                self.session
            );
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        self.session.add_known_inventory(InvVect::tx(tx.txid));
        let gate = self.session.tx_processed();
        self.context
            .collaborators
            .sync
            .queue_tx(*tx, &self.session, gate.signaller());
        gate.wait().await;

        Ok(KEEP_CONNECTION_ALIVE)
    }

    /// Like [`Self::on_tx`], for blocks.
    async fn on_block(&self, block: Box<Block>) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::Block");

        self.session.add_known_inventory(InvVect::block(block.hash));
        let gate = self.session.block_processed();
        self.context
            .collaborators
            .sync
            .queue_block(*block, &self.session, gate.signaller());
        gate.wait().await;

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_get_blocks(&self, request: BlockLocatorRequest) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::GetBlocks");

        let hashes = self.context.collaborators.chain.locate_blocks(
            &request.locator,
            &request.hash_stop,
            MAX_BLOCKS_PER_MSG,
        );
        if hashes.is_empty() {
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        // A full batch means there is more; the peer is nudged once it asks
        // for the last block of this one.
        if hashes.len() == MAX_BLOCKS_PER_MSG {
            self.session.set_continue_hash(hashes.last().copied());
        }

        let inventory = hashes.into_iter().map(InvVect::block).collect();
        self.session.queue_message(PeerMessage::Inv(inventory), None);

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_get_headers(&self, request: BlockLocatorRequest) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::GetHeaders");

        if !self.context.collaborators.sync.is_current() {
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        let headers = self
            .context
            .collaborators
            .chain
            .locate_headers(&request.locator, &request.hash_stop);
        self.session
            .queue_message(PeerMessage::Headers(headers), None);

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_mem_pool(&self) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::MemPool");

        if !self.context.services.contains(ServiceFlags::NODE_BLOOM) {
            debug!(
                "Peer {} sent mempool request with bloom filtering disabled -- disconnecting",
                self.session
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        // Decaying score increase so that bursts of mempool requests pass the
        // ban threshold.
        if self.add_ban_score(0, 33, "mempool").await {
            return Ok(DISCONNECT_CONNECTION);
        }

        let mut inventory = vec![];
        for tx_desc in self.context.collaborators.mempool.tx_descs() {
            let matches = self
                .session
                .with_filter(|filter| filter.match_tx_and_update(&tx_desc.tx))
                .unwrap_or(true);
            if matches {
                inventory.push(InvVect::tx(tx_desc.tx.txid));
                if inventory.len() + 1 > MAX_INV_PER_MSG {
                    break;
                }
            }
        }

        if !inventory.is_empty() {
            self.session
                .queue_message(PeerMessage::Inv(inventory), None);
        }

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_fee_filter(&self, min_fee_per_kb: i64) -> Result<bool> {
        if !(0..=MAX_SATOSHI).contains(&min_fee_per_kb) {
            debug!(
                "Peer {} sent an invalid feefilter '{}' -- disconnecting",
                self.session, min_fee_per_kb
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        self.session.set_fee_filter(min_fee_per_kb);
        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_filter_add(&self, data: Vec<u8>) -> Result<bool> {
        if !self.enforce_node_bloom_flag(MessageKind::FilterAdd).await {
            return Ok(DISCONNECT_CONNECTION);
        }

        if data.len() > MAX_FILTER_ADD_DATA_SIZE {
            debug!(
                "{} sent a filteradd with {} bytes of data -- disconnecting",
                self.session,
                data.len()
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        if self.session.with_filter(|filter| filter.add(&data)).is_none() {
            debug!(
                "{} sent a filteradd request with no filter loaded -- disconnecting",
                self.session
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_filter_clear(&self) -> Result<bool> {
        if !self.enforce_node_bloom_flag(MessageKind::FilterClear).await {
            return Ok(DISCONNECT_CONNECTION);
        }

        if !self.session.filter_is_loaded() {
            debug!(
                "{} sent a filterclear request with no filter loaded -- disconnecting",
                self.session
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        self.session.unload_filter();
        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_filter_load(&self, msg: FilterLoadMessage) -> Result<bool> {
        if !self.enforce_node_bloom_flag(MessageKind::FilterLoad).await {
            return Ok(DISCONNECT_CONNECTION);
        }

        if msg.filter.len() > MAX_FILTER_LOAD_FILTER_SIZE
            || msg.hash_funcs > MAX_FILTER_LOAD_HASH_FUNCS
        {
            debug!(
                "{} sent an oversized filterload [size {}, hash funcs {}] -- disconnecting",
                self.session,
                msg.filter.len(),
                msg.hash_funcs
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        self.session.set_relay_tx_disabled(false);
        self.session.load_filter(BloomFilter::from_load(&msg));
        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn on_reject(&self, msg: RejectMessage) -> Result<bool> {
        debug!(
            "Peer {} rejected {} ({:?}): {}",
            self.session, msg.command, msg.code, msg.reason
        );
        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn read_loop<R, E>(&self, mut stream: R) -> Result<()>
    where
        R: Stream<Item = Result<PeerMessage, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        loop {
            let peer_message = select! {
                biased;
                _ = self.session.disconnected() => return Ok(()),
                peer_message = stream.next() => peer_message,
            };

            let peer_message = match peer_message {
                None => {
                    info!("Peer {} closed connection.", self.session);
                    return Ok(());
                }
                Some(Err(err)) => {
                    warn!("Error when receiving from peer {}: {err}", self.session);
                    bail!("Error when receiving from peer {}: {err}", self.session);
                }
                Some(Ok(message)) => message,
            };
            self.context
                .net_totals
                .add_bytes_received(serialized_size(&peer_message));

            let outcome = select! {
                outcome = self.handle_peer_message(peer_message) => outcome,
                _ = self.session.disconnected() => Ok(DISCONNECT_CONNECTION),
            };
            match outcome {
                Ok(KEEP_CONNECTION_ALIVE) => {}
                Ok(DISCONNECT_CONNECTION) => {
                    info!("Closing connection to {}", self.session);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "Closing connection to {} because of error {err}.",
                        self.session
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn send_message<W>(&self, sink: &mut W, message: PeerMessage) -> Result<()>
    where
        W: Sink<PeerMessage> + Unpin,
        W::Error: std::error::Error + Send + Sync + 'static,
    {
        let size = serialized_size(&message);
        sink.send(message).await?;
        self.context.net_totals.add_bytes_sent(size);
        Ok(())
    }

    async fn flush_inventory<W>(&self, sink: &mut W, pending: &mut Vec<InvVect>) -> Result<()>
    where
        W: Sink<PeerMessage> + Unpin,
        W::Error: std::error::Error + Send + Sync + 'static,
    {
        while !pending.is_empty() {
            let batch = pending
                .drain(..pending.len().min(MAX_INV_PER_MSG))
                .collect();
            self.send_message(sink, PeerMessage::Inv(batch)).await?;
        }
        Ok(())
    }

    async fn write_entry<W>(
        &self,
        sink: &mut W,
        entry: Outbound,
        pending: &mut Vec<InvVect>,
    ) -> Result<()>
    where
        W: Sink<PeerMessage> + Unpin,
        W::Error: std::error::Error + Send + Sync + 'static,
    {
        match entry {
            Outbound::Message { message, done } => {
                self.send_message(sink, message).await?;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Outbound::Inventory(inv) => pending.push(inv),
        }
        Ok(())
    }

    /// Write queued messages as they come and trickle inventory out in
    /// batches. After a disconnect, messages queued before it are still
    /// written.
    async fn write_loop<W>(
        &self,
        mut sink: W,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<()>
    where
        W: Sink<PeerMessage> + Unpin,
        W::Error: std::error::Error + Send + Sync + 'static,
    {
        let trickle_interval = self.context.cli.trickle_interval;
        let trickle_timer = time::sleep(trickle_interval);
        tokio::pin!(trickle_timer);
        let mut pending_inventory = vec![];

        loop {
            select! {
                _ = self.session.disconnected() => break,

                entry = outbound.recv() => {
                    let Some(entry) = entry else {
                        break;
                    };
                    self.write_entry(&mut sink, entry, &mut pending_inventory).await?;
                }

                _ = &mut trickle_timer => {
                    self.flush_inventory(&mut sink, &mut pending_inventory).await?;
                    trickle_timer.as_mut().reset(Instant::now() + trickle_interval);
                }
            }
        }

        outbound.close();
        while let Ok(entry) = outbound.try_recv() {
            if let Outbound::Message { .. } = entry {
                self.write_entry(&mut sink, entry, &mut pending_inventory)
                    .await?;
            }
        }
        sink.close().await?;

        Ok(())
    }

    async fn run<S, E>(&self, transport: S, outbound: mpsc::UnboundedReceiver<Outbound>) -> Result<()>
    where
        S: Sink<PeerMessage> + Stream<Item = Result<PeerMessage, E>> + Unpin,
        <S as Sink<PeerMessage>>::Error: std::error::Error + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (sink, stream) = transport.split();

        if self.context.quit.is_cancelled() {
            debug!("Server is shutting down, dropping {}", self.session);
            self.session.disconnect();
        }
        let on_quit = async {
            select! {
                _ = self.context.quit.cancelled() => {
                    trace!("Shutdown peer {}", self.session);
                    self.session.disconnect();
                }
                _ = self.session.disconnected() => {}
            }
        };

        let reader = async {
            let result = self.read_loop(stream).await;
            self.session.disconnect();
            result
        };
        let writer = async {
            let result = self.write_loop(sink, outbound).await;
            self.session.disconnect();
            result
        };

        let (read_result, write_result, ()) = tokio::join!(reader, writer, on_quit);
        read_result.and(write_result)
    }

    /// Announce ourselves to outbound peers, run the connection until either
    /// side ends it, then report the peer gone.
    ///
    /// Returns the error that ended the connection, if any.
    pub async fn run_wrapper<S, E>(
        self,
        transport: S,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<()>
    where
        S: Sink<PeerMessage> + Stream<Item = Result<PeerMessage, E>> + Unpin,
        <S as Sink<PeerMessage>>::Error: std::error::Error + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.session.is_inbound() {
            let local_version = self.context.local_version();
            self.session
                .queue_message(PeerMessage::Version(Box::new(local_version)), None);
        }

        let result = self.run(transport, outbound).await;
        debug!("Exited peer loop for {}", self.session);

        self.peer_done().await;

        result
    }

    async fn peer_done(&self) {
        log_router_error(
            self.context.router.peer_left(self.session.clone()).await,
            "unregister peer",
        );

        // The sync manager only knows peers that sent their version.
        if self.session.version_known() {
            let collaborators = &self.context.collaborators;
            collaborators.sync.done_peer(&self.session);

            let evicted = collaborators
                .mempool
                .remove_orphans_by_tag(self.session.id());
            if evicted > 0 {
                debug!(
                    "Evicted {} {} from peer {} (id {})",
                    evicted,
                    if evicted == 1 { "orphan" } else { "orphans" },
                    self.session,
                    self.session.id()
                );
            }
        }
    }
}
