use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;
use tracing::Instrument;

use crate::collaborators::Collaborators;
use crate::config_models::cli_args;
use crate::models::blockchain::Hash;
use crate::models::blockchain::Transaction;
use crate::models::blockchain::TxDesc;
use crate::models::channel::RebroadcastCmd;
use crate::models::channel::RelayData;
use crate::models::channel::RouterEvent;
use crate::models::peer::session::ConnectionOrigin;
use crate::models::peer::session::Outbound;
use crate::models::peer::session::PeerSession;
use crate::models::peer::ConnReqId;
use crate::models::peer::InvVect;
use crate::models::peer::NetAddress;
use crate::models::peer::PeerId;
use crate::models::peer::PeerMessage;
use crate::models::peer::ServiceFlags;
use crate::peer_loop::default_listeners;
use crate::peer_loop::Listeners;
use crate::peer_loop::PeerContext;
use crate::peer_loop::ServerPeer;
use crate::rebroadcast::RebroadcastHandler;
use crate::router::log_router_error;
use crate::router::RouterHandle;
use crate::router::RouterHandler;
use crate::transport;
use crate::upnp::UpnpHandler;

/// Services announced unless disabled through the configuration.
const DEFAULT_SERVICES: ServiceFlags = ServiceFlags(
    ServiceFlags::NODE_NETWORK.0
        | ServiceFlags::NODE_BLOOM.0
        | ServiceFlags::NODE_WITNESS.0
        | ServiceFlags::NODE_CF.0,
);

/// Bytes received from and sent to all peers since the server was created.
#[derive(Debug, Default)]
pub struct NetTotals {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl NetTotals {
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// `(received, sent)`
    pub fn totals(&self) -> (u64, u64) {
        (
            self.bytes_received.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }
}

/// Interval between shutdown warnings, shrinking as the deadline nears.
pub fn dynamic_tick_duration(remaining: Duration) -> Duration {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    let secs = match remaining.as_secs() {
        0..=5 => 1,
        6..=15 => 5,
        16..=MINUTE => 15,
        61..=300 => MINUTE,
        301..=900 => 5 * MINUTE,
        901..=HOUR => 15 * MINUTE,
        _ => HOUR,
    };
    Duration::from_secs(secs)
}

/// The peer server: owns the router, the rebroadcast tracker and the UPnP
/// renewal, and turns established connections into running peers.
#[derive(Debug)]
pub struct Server {
    cli: cli_args::Args,
    context: Arc<PeerContext>,
    listeners: Listeners,

    router: RouterHandle,
    router_inbox: Mutex<Option<mpsc::Receiver<RouterEvent>>>,
    rebroadcast_tx: mpsc::Sender<RebroadcastCmd>,
    rebroadcast_inbox: Mutex<Option<mpsc::Receiver<RebroadcastCmd>>>,

    started: AtomicBool,
    shutting_down: Arc<AtomicBool>,
    shutdown_scheduled: AtomicBool,
    quit: CancellationToken,

    last_peer_id: AtomicU64,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    peer_tasks: TaskTracker,
}

impl Server {
    pub fn new(cli: cli_args::Args, collaborators: Collaborators) -> Self {
        let mut services = DEFAULT_SERVICES;
        if cli.no_peer_bloom_filters {
            services = services.without(ServiceFlags::NODE_BLOOM);
        }
        if cli.no_cfilters {
            services = services.without(ServiceFlags::NODE_CF);
        }

        let router_capacity = crate::ROUTER_CHANNEL_CAPACITY.max(cli.max_peers);
        let (router_tx, router_inbox) = mpsc::channel(router_capacity);
        let router = RouterHandle::new(router_tx);
        let (rebroadcast_tx, rebroadcast_inbox) =
            mpsc::channel(crate::REBROADCAST_CHANNEL_CAPACITY);

        let listeners = default_listeners(&cli);
        let quit = CancellationToken::new();
        let context = PeerContext::new(
            cli.clone(),
            collaborators,
            router.clone(),
            services,
            quit.clone(),
        );

        Self {
            cli,
            context: Arc::new(context),
            listeners,
            router,
            router_inbox: Mutex::new(Some(router_inbox)),
            rebroadcast_tx,
            rebroadcast_inbox: Mutex::new(Some(rebroadcast_inbox)),
            started: AtomicBool::new(false),
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_scheduled: AtomicBool::new(false),
            quit,
            last_peer_id: AtomicU64::new(0),
            task_handles: Mutex::new(vec![]),
            peer_tasks: TaskTracker::new(),
        }
    }

    pub fn services(&self) -> ServiceFlags {
        self.context.services
    }

    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// `(received, sent)` bytes over all peers.
    pub fn net_totals(&self) -> (u64, u64) {
        self.context.net_totals.totals()
    }

    /// Spawn the router, the rebroadcast tracker and, if enabled and a NAT
    /// device is available, the UPnP renewal. Later calls do nothing.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        trace!("Starting server");

        let Some(router_inbox) = self
            .router_inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            bail!("router inbox already taken");
        };
        let Some(rebroadcast_inbox) = self
            .rebroadcast_inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            bail!("rebroadcast inbox already taken");
        };

        let collaborators = &self.context.collaborators;
        let mut task_handles = vec![];

        let router = RouterHandler::new(
            self.cli.clone(),
            collaborators.clone(),
            self.shutting_down.clone(),
            self.quit.clone(),
        );
        task_handles.push(tokio::spawn(async move {
            if let Err(err) = router.run(router_inbox).await {
                error!("Peer router failed: {err:?}");
            }
        }));

        let rebroadcast = RebroadcastHandler::new(self.router.clone(), self.quit.clone());
        task_handles.push(tokio::spawn(async move {
            if let Err(err) = rebroadcast.run(rebroadcast_inbox).await {
                error!("Rebroadcast handler failed: {err:?}");
            }
        }));

        if self.cli.upnp {
            match &collaborators.nat {
                Some(nat) => {
                    let upnp = UpnpHandler::new(
                        nat.clone(),
                        collaborators.address_book.clone(),
                        self.cli.listen_port(),
                        self.context.services,
                        self.quit.clone(),
                    );
                    task_handles.push(tokio::spawn(async move {
                        if let Err(err) = upnp.run().await {
                            error!("UPnP renewal failed: {err:?}");
                        }
                    }));
                }
                None => warn!("UPnP requested but no NAT device was discovered"),
            }
        }

        self.task_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(task_handles);

        Ok(())
    }

    /// Signal every background task to quit. Later calls do nothing.
    pub fn stop(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Server is already in the process of shutting down");
            return;
        }

        warn!("Server shutting down");
        self.quit.cancel();
    }

    /// Wait for the background tasks spawned by [`Server::start`] and every
    /// peer connection to finish.
    pub async fn wait_for_shutdown(&self) {
        let task_handles = std::mem::take(
            &mut *self
                .task_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in task_handles {
            if let Err(err) = handle.await {
                error!("Server task panicked: {err}");
            }
        }

        self.peer_tasks.close();
        self.peer_tasks.wait().await;
        debug!("All peer connections closed");
    }

    /// Stop the server once `duration` has passed, warning at shrinking
    /// intervals until then. Only the first call schedules anything.
    pub fn schedule_shutdown(self: &Arc<Self>, duration: Duration) {
        if self.shutdown_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Server shutdown in {}", humantime::format_duration(duration));

        let server = self.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + duration;
            let mut tick = dynamic_tick_duration(duration);
            let mut ticker = time::interval_at(Instant::now() + tick, tick);

            loop {
                select! {
                    _ = server.quit.cancelled() => {
                        return;
                    }

                    _ = ticker.tick() => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining < Duration::from_secs(1) {
                            server.stop();
                            return;
                        }

                        let next_tick = dynamic_tick_duration(remaining);
                        if next_tick != tick {
                            tick = next_tick;
                            ticker = time::interval_at(Instant::now() + tick, tick);
                        }

                        warn!(
                            "Server shutdown in {}",
                            humantime::format_duration(Duration::from_secs(remaining.as_secs()))
                        );
                    }
                }
            }
        }
        .in_current_span());
    }

    fn next_peer_id(&self) -> PeerId {
        self.last_peer_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn spawn_peer<S>(
        &self,
        stream: S,
        session: Arc<PeerSession>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = ServerPeer::new(session, self.context.clone(), self.listeners.clone());
        self.peer_tasks.spawn(async move {
            let addr = peer.session().addr();
            if let Err(err) = peer.run_wrapper(transport::frame(stream), outbound).await {
                debug!("Connection to {addr} ended: {err}");
            }
        })
    }

    /// Run a peer over a connection the remote side opened.
    pub fn inbound_peer_connected<S>(&self, stream: S, addr: SocketAddr) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let whitelisted = self.cli.is_whitelisted(&addr.ip());
        let (session, outbound) = PeerSession::new(
            self.next_peer_id(),
            addr,
            ConnectionOrigin::Inbound,
            whitelisted,
        );
        debug!("New inbound connection from {session}");
        self.spawn_peer(stream, session, outbound)
    }

    /// Run a peer over a connection the connection supervisor dialed for
    /// `conn_req`.
    pub fn outbound_peer_connected<S>(
        &self,
        stream: S,
        addr: SocketAddr,
        conn_req: ConnReqId,
        permanent: bool,
    ) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let whitelisted = self.cli.is_whitelisted(&addr.ip());
        let origin = ConnectionOrigin::Outbound {
            conn_req: Some(conn_req),
            permanent,
        };
        let (session, outbound) =
            PeerSession::new(self.next_peer_id(), addr, origin, whitelisted);
        debug!("New outbound connection to {session}");

        self.context
            .collaborators
            .address_book
            .attempt(&NetAddress::new(addr, ServiceFlags::NONE));
        self.spawn_peer(stream, session, outbound)
    }

    pub async fn relay_inventory(&self, inv: InvVect, data: RelayData) {
        log_router_error(self.router.relay(inv, data).await, "relay inventory");
    }

    pub async fn broadcast_message(&self, message: PeerMessage, exclude: Vec<PeerId>) {
        log_router_error(
            self.router.broadcast(message, exclude).await,
            "broadcast message",
        );
    }

    /// Tell peers that announced `latest_block` about their new height.
    pub async fn update_peer_heights(
        &self,
        latest_block: Hash,
        height: i32,
        origin: Option<PeerId>,
    ) {
        log_router_error(
            self.router
                .update_peer_heights(latest_block, height, origin)
                .await,
            "update peer heights",
        );
    }

    async fn send_rebroadcast_cmd(&self, cmd: RebroadcastCmd) {
        // Ignore while shutting down, the tracker no longer listens.
        if self.is_shutting_down() {
            return;
        }
        if self.rebroadcast_tx.send(cmd).await.is_err() {
            trace!("Rebroadcast handler is gone");
        }
    }

    /// Re-announce `inv` periodically until it is removed again.
    pub async fn add_rebroadcast_inventory(&self, inv: InvVect, data: RelayData) {
        self.send_rebroadcast_cmd(RebroadcastCmd::Add { inv, data })
            .await;
    }

    pub async fn remove_rebroadcast_inventory(&self, inv: InvVect) {
        self.send_rebroadcast_cmd(RebroadcastCmd::Remove(inv)).await;
    }

    /// A transaction made it into a block; stop rebroadcasting it.
    pub async fn transaction_confirmed(&self, tx: &Transaction) {
        self.remove_rebroadcast_inventory(InvVect::tx(tx.txid))
            .await;
    }

    /// Announce transactions freshly accepted into the mempool.
    pub async fn announce_new_transactions(&self, descs: &[TxDesc]) {
        for desc in descs {
            self.relay_inventory(
                InvVect::tx(desc.tx.txid),
                RelayData::TxDesc(Box::new(desc.clone())),
            )
            .await;
        }
    }
}
