use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use itertools::Itertools;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::collaborators::Collaborators;
use crate::config_models::cli_args;
use crate::macros::fn_name;
use crate::macros::log_slow_scope;
use crate::models::blockchain::Hash;
use crate::models::channel::BroadcastMsg;
use crate::models::channel::PeerMatcher;
use crate::models::channel::RelayData;
use crate::models::channel::RelayMsg;
use crate::models::channel::Reply;
use crate::models::channel::RouterEvent;
use crate::models::channel::RouterQuery;
use crate::models::peer::session::PeerSession;
use crate::models::peer::InvVect;
use crate::models::peer::PeerId;
use crate::models::peer::PeerMessage;
use crate::models::state::peer_registry::PeerRegistry;
use crate::relay::relay_to_peer;

/// Failures reported back to router clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("max peers reached")]
    MaxPeersReached,

    #[error("peer already connected")]
    PeerAlreadyConnected,

    #[error("peer exists as a permanent peer")]
    PeerExistsAsPermanent,

    #[error("peer not found")]
    PeerNotFound,

    #[error("peer is banned")]
    Banned,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("router is shut down")]
    ShutDown,
}

/// Single owner of the [`PeerRegistry`]. Processes one [`RouterEvent`] at a
/// time and never suspends while doing so.
#[derive(Debug)]
pub struct RouterHandler {
    registry: PeerRegistry,
    cli: cli_args::Args,
    collaborators: Collaborators,
    shutting_down: Arc<AtomicBool>,
    quit: CancellationToken,

    #[cfg(test)]
    mock_now: Option<SystemTime>,
}

impl RouterHandler {
    pub fn new(
        cli: cli_args::Args,
        collaborators: Collaborators,
        shutting_down: Arc<AtomicBool>,
        quit: CancellationToken,
    ) -> Self {
        Self {
            registry: PeerRegistry::new(),
            cli,
            collaborators,
            shutting_down,
            quit,
            #[cfg(test)]
            mock_now: None,
        }
    }

    /// Allows for mocked timestamps such that ban expiry may be tested.
    #[cfg(test)]
    fn with_mocked_time(mut self, mocked_time: SystemTime) -> Self {
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

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Run until the quit token is cancelled. Starts the address book, the
    /// sync manager and the connection supervisor, and stops them again on
    /// the way out.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<RouterEvent>) -> Result<()> {
        self.collaborators.address_book.start();
        self.collaborators.sync.start();

        if !self.cli.disable_dns_seed {
            self.collaborators.address_book.seed_from_dns();
        }
        self.collaborators.connections.start();

        loop {
            select! {
                _ = self.quit.cancelled() => {
                    break;
                }

                event = inbox.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    self.handle_event(event);
                }
            }
        }

        self.shutdown(&mut inbox);

        Ok(())
    }

    fn shutdown(&mut self, inbox: &mut mpsc::Receiver<RouterEvent>) {
        log_slow_scope!(fn_name!() + "::shutdown");

        for session in self.registry.iter() {
            trace!("Shutdown peer {session}");
            session.disconnect();
        }

        self.collaborators.connections.stop();
        self.collaborators.sync.stop();
        self.collaborators.address_book.stop();

        // Pending queries are answered with `ShutDown` as their reply slots
        // are dropped here. Peers that never made it into the registry are
        // still disconnected.
        inbox.close();
        while let Ok(event) = inbox.try_recv() {
            trace!("Dropping {} event on shutdown", event.get_type());
            if let RouterEvent::PeerJoined(session) = event {
                session.disconnect();
            }
        }

        info!("Peer router done");
    }

    /// Apply a single event to the registry.
    pub fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::PeerJoined(session) => {
                log_slow_scope!(fn_name!() + "::RouterEvent::PeerJoined");
                if let Err(err) = self.add_peer(session) {
                    trace!("Peer not admitted: {err}");
                }
            }
            RouterEvent::PeerLeft(session) => {
                log_slow_scope!(fn_name!() + "::RouterEvent::PeerLeft");
                self.remove_peer(&session);
            }
            RouterEvent::Ban(session) => {
                log_slow_scope!(fn_name!() + "::RouterEvent::Ban");
                self.ban_peer(&session);
            }
            RouterEvent::Relay(msg) => {
                log_slow_scope!(fn_name!() + "::RouterEvent::Relay");
                for session in self.registry.iter() {
                    relay_to_peer(session, &msg);
                }
            }
            RouterEvent::Broadcast(msg) => {
                log_slow_scope!(fn_name!() + "::RouterEvent::Broadcast");
                self.broadcast(msg);
            }
            RouterEvent::UpdatePeerHeights {
                latest_block,
                height,
                origin,
            } => {
                log_slow_scope!(fn_name!() + "::RouterEvent::UpdatePeerHeights");
                self.update_peer_heights(latest_block, height, origin);
            }
            RouterEvent::Query(query) => {
                log_slow_scope!(fn_name!() + "::RouterEvent::Query");
                self.handle_query(query);
            }
        }
    }

    /// Register a peer that completed its handshake. Rejected peers are
    /// disconnected.
    pub fn add_peer(&mut self, session: Arc<PeerSession>) -> Result<(), RouterError> {
        let result = self.try_add_peer(&session);
        if result.is_err() {
            session.disconnect();
        }
        result
    }

    fn try_add_peer(&mut self, session: &Arc<PeerSession>) -> Result<(), RouterError> {
        if !session.is_connected() {
            return Err(RouterError::PeerNotFound);
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            info!("New peer {session} ignored - server is shutting down");
            return Err(RouterError::ShuttingDown);
        }

        let host = session.host();
        if let Some(ban_end) = self.registry.ban_expiry(&host) {
            let now = self.now();
            if let Ok(remaining) = ban_end.duration_since(now) {
                if !remaining.is_zero() {
                    debug!(
                        "Peer {host} is banned for another {} - disconnecting",
                        humantime::format_duration(remaining)
                    );
                    return Err(RouterError::Banned);
                }
            }
            info!("Peer {host} is no longer banned");
            self.registry.unban(&host);
        }

        if self.registry.count() >= self.cli.max_peers {
            info!(
                "Max peers reached [{}] - disconnecting peer {session}",
                self.cli.max_peers
            );
            return Err(RouterError::MaxPeersReached);
        }

        let group = (!session.is_inbound())
            .then(|| self.collaborators.address_book.group_key(&session.na()));
        if !self.registry.insert(session.clone(), group) {
            return Err(RouterError::PeerAlreadyConnected);
        }
        debug!("New peer {session}");

        if session.verack_received() && session.version_known() {
            self.collaborators.address_book.connected(&session.na());
        }

        Ok(())
    }

    fn remove_peer(&mut self, session: &Arc<PeerSession>) {
        let removed = self.registry.remove(session.id()).is_some();

        if let Some(conn_req) = session.conn_req() {
            self.collaborators.connections.disconnect(conn_req);
        }

        if removed {
            debug!("Removed peer {session}");
        } else if session.verack_received() && session.version_known() {
            self.collaborators.address_book.connected(&session.na());
        }
    }

    fn ban_peer(&mut self, session: &PeerSession) {
        let direction = if session.is_inbound() {
            "inbound"
        } else {
            "outbound"
        };
        let host = session.host();
        info!(
            "Banned peer {host} ({direction}) for {}",
            humantime::format_duration(self.cli.ban_duration)
        );
        self.registry.ban(host, self.now() + self.cli.ban_duration);
    }

    fn broadcast(&self, msg: BroadcastMsg) {
        for session in self.registry.iter() {
            if !session.is_connected() || msg.exclude.contains(&session.id()) {
                continue;
            }
            session.queue_message(msg.message.clone(), None);
        }
    }

    /// Peers whose last announced block is `latest_block` are now known to
    /// be at `height`. The announcement is consumed.
    fn update_peer_heights(&self, latest_block: Hash, height: i32, origin: Option<PeerId>) {
        for session in self.registry.iter() {
            if Some(session.id()) == origin {
                continue;
            }
            if session.last_announced_block() == Some(latest_block) {
                session.update_last_block_height(height);
                session.update_last_announced_block(None);
            }
        }
    }

    fn handle_query(&mut self, query: RouterQuery) {
        match query {
            RouterQuery::ConnectionCount(reply) => {
                let count = self.registry.iter().filter(|s| s.is_connected()).count();
                let _ = reply.send(count);
            }
            RouterQuery::Peers(reply) => {
                let peers = self
                    .registry
                    .iter()
                    .filter(|s| s.is_connected())
                    .cloned()
                    .collect();
                let _ = reply.send(peers);
            }
            RouterQuery::ConnectNode {
                addr,
                permanent,
                reply,
            } => {
                let _ = reply.send(self.connect_node(addr, permanent));
            }
            RouterQuery::RemoveNode { matcher, reply } => {
                let persistent = self.registry.persistent().cloned().collect_vec();
                let result = match self.disconnect_first(persistent, &matcher) {
                    Some(session) => {
                        if let Some(conn_req) = session.conn_req() {
                            self.collaborators.connections.remove(conn_req);
                        }
                        Ok(())
                    }
                    None => Err(RouterError::PeerNotFound),
                };
                let _ = reply.send(result);
            }
            RouterQuery::OutboundGroupCount { key, reply } => {
                let _ = reply.send(self.registry.outbound_group_count(&key));
            }
            RouterQuery::AddedNodes(reply) => {
                let _ = reply.send(self.registry.persistent().cloned().collect());
            }
            RouterQuery::DisconnectNode { matcher, reply } => {
                let _ = reply.send(self.disconnect_node(&matcher));
            }
        }
    }

    fn connect_node(&self, addr: SocketAddr, permanent: bool) -> Result<(), RouterError> {
        if self.registry.persistent().any(|s| s.addr() == addr) {
            return Err(if permanent {
                RouterError::PeerAlreadyConnected
            } else {
                RouterError::PeerExistsAsPermanent
            });
        }

        self.collaborators.connections.connect(addr, permanent);
        Ok(())
    }

    fn disconnect_node(&mut self, matcher: &PeerMatcher) -> Result<(), RouterError> {
        let inbound = self.registry.inbound().cloned().collect_vec();
        if self.disconnect_first(inbound, matcher).is_some() {
            return Ok(());
        }

        // One endpoint may be connected more than once.
        let mut found = false;
        loop {
            let outbound = self.registry.outbound().cloned().collect_vec();
            if self.disconnect_first(outbound, matcher).is_none() {
                break;
            }
            found = true;
        }

        if found {
            Ok(())
        } else {
            Err(RouterError::PeerNotFound)
        }
    }

    /// Unregister and disconnect the first candidate `matcher` accepts.
    fn disconnect_first(
        &mut self,
        candidates: Vec<Arc<PeerSession>>,
        matcher: &PeerMatcher,
    ) -> Option<Arc<PeerSession>> {
        let session = candidates.into_iter().find(|s| matcher(s))?;
        self.registry.remove(session.id());
        session.disconnect();
        Some(session)
    }
}

/// Client side of the router. Cheap to clone; every method is answered once
/// the router reaches the request in its queue.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterEvent>,
}

impl RouterHandle {
    pub fn new(tx: mpsc::Sender<RouterEvent>) -> Self {
        Self { tx }
    }

    async fn send(&self, event: RouterEvent) -> Result<(), RouterError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RouterError::ShutDown)
    }

    async fn query<T>(
        &self,
        make_query: impl FnOnce(Reply<T>) -> RouterQuery,
    ) -> Result<T, RouterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RouterEvent::Query(make_query(reply_tx))).await?;
        reply_rx.await.map_err(|_| RouterError::ShutDown)
    }

    pub async fn peer_joined(&self, session: Arc<PeerSession>) -> Result<(), RouterError> {
        self.send(RouterEvent::PeerJoined(session)).await
    }

    pub async fn peer_left(&self, session: Arc<PeerSession>) -> Result<(), RouterError> {
        self.send(RouterEvent::PeerLeft(session)).await
    }

    /// Ban the session's host. Disconnecting is up to the caller.
    pub async fn ban(&self, session: Arc<PeerSession>) -> Result<(), RouterError> {
        self.send(RouterEvent::Ban(session)).await
    }

    pub async fn relay(&self, inv: InvVect, data: RelayData) -> Result<(), RouterError> {
        self.send(RouterEvent::Relay(RelayMsg { inv, data })).await
    }

    pub async fn broadcast(
        &self,
        message: PeerMessage,
        exclude: Vec<PeerId>,
    ) -> Result<(), RouterError> {
        self.send(RouterEvent::Broadcast(BroadcastMsg { message, exclude }))
            .await
    }

    pub async fn update_peer_heights(
        &self,
        latest_block: Hash,
        height: i32,
        origin: Option<PeerId>,
    ) -> Result<(), RouterError> {
        self.send(RouterEvent::UpdatePeerHeights {
            latest_block,
            height,
            origin,
        })
        .await
    }

    pub async fn connection_count(&self) -> Result<usize, RouterError> {
        self.query(RouterQuery::ConnectionCount).await
    }

    pub async fn peers(&self) -> Result<Vec<Arc<PeerSession>>, RouterError> {
        self.query(RouterQuery::Peers).await
    }

    /// Resolve `addr` (`host:port`) and ask the connection supervisor to dial
    /// it.
    pub async fn connect_node(&self, addr: &str, permanent: bool) -> Result<(), RouterError> {
        let resolved = match addr.parse::<SocketAddr>() {
            Ok(resolved) => resolved,
            Err(_) => tokio::net::lookup_host(addr)
                .await
                .map_err(|err| RouterError::InvalidAddress(format!("{addr}: {err}")))?
                .next()
                .ok_or_else(|| RouterError::InvalidAddress(addr.to_string()))?,
        };

        self.query(|reply| RouterQuery::ConnectNode {
            addr: resolved,
            permanent,
            reply,
        })
        .await?
    }

    pub async fn remove_node(&self, matcher: PeerMatcher) -> Result<(), RouterError> {
        self.query(|reply| RouterQuery::RemoveNode { matcher, reply })
            .await?
    }

    pub async fn outbound_group_count(&self, key: String) -> Result<usize, RouterError> {
        self.query(|reply| RouterQuery::OutboundGroupCount { key, reply })
            .await
    }

    pub async fn added_nodes(&self) -> Result<Vec<Arc<PeerSession>>, RouterError> {
        self.query(RouterQuery::AddedNodes).await
    }

    pub async fn disconnect_node(&self, matcher: PeerMatcher) -> Result<(), RouterError> {
        self.query(|reply| RouterQuery::DisconnectNode { matcher, reply })
            .await?
    }
}

/// Log a warning if a router client call failed for any reason other than
/// shutdown.
pub(crate) fn log_router_error(result: Result<(), RouterError>, what: &str) {
    match result {
        Ok(()) | Err(RouterError::ShutDown) => {}
        Err(err) => warn!("Failed to {what}: {err}"),
    }
}
