use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use crate::macros::fn_name;
use crate::macros::log_slow_scope;
use crate::models::channel::RebroadcastCmd;
use crate::models::channel::RelayData;
use crate::models::peer::InvVect;
use crate::router::log_router_error;
use crate::router::RouterHandle;

/// Delay before locally submitted inventory is announced again the first
/// time.
const FIRST_REBROADCAST_DELAY: Duration = Duration::from_secs(5 * 60);

/// Upper bound, in seconds, of the random delay between later rounds.
const MAX_REBROADCAST_DELAY_SECS: u64 = 1800;

/// Re-announces inventory submitted by local clients until it is confirmed.
#[derive(Debug)]
pub struct RebroadcastHandler {
    pending: HashMap<InvVect, RelayData>,
    router: RouterHandle,
    quit: CancellationToken,
}

impl RebroadcastHandler {
    pub fn new(router: RouterHandle, quit: CancellationToken) -> Self {
        Self {
            pending: HashMap::new(),
            router,
            quit,
        }
    }

    fn next_delay() -> Duration {
        Duration::from_secs(rand::rng().random_range(1..=MAX_REBROADCAST_DELAY_SECS))
    }

    pub fn handle_command(&mut self, cmd: RebroadcastCmd) {
        match cmd {
            RebroadcastCmd::Add { inv, data } => {
                self.pending.insert(inv, data);
            }
            RebroadcastCmd::Remove(inv) => {
                self.pending.remove(&inv);
            }
        }
    }

    /// Relay every pending inventory vector once more.
    pub async fn rebroadcast(&self) {
        log_slow_scope!(fn_name!());

        debug!("Rebroadcasting {} pending inventory vectors", self.pending.len());
        for (inv, data) in &self.pending {
            log_router_error(
                self.router.relay(*inv, data.clone()).await,
                "rebroadcast inventory",
            );
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<RebroadcastCmd>) -> Result<()> {
        let timer = time::sleep(FIRST_REBROADCAST_DELAY);
        tokio::pin!(timer);

        loop {
            select! {
                _ = self.quit.cancelled() => {
                    break;
                }

                Some(cmd) = commands.recv() => {
                    self.handle_command(cmd);
                }

                _ = &mut timer => {
                    log_slow_scope!(fn_name!() + "::select::rebroadcast_timer");
                    self.rebroadcast().await;
                    timer.as_mut().reset(Instant::now() + Self::next_delay());
                }
            }
        }

        commands.close();
        while commands.try_recv().is_ok() {}
        trace!("Rebroadcast handler done");

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::models::blockchain::Hash;
    use crate::models::channel::RouterEvent;

    fn handler() -> (RebroadcastHandler, mpsc::Receiver<RouterEvent>) {
        let (tx, rx) = mpsc::channel(100);
        let handler = RebroadcastHandler::new(RouterHandle::new(tx), CancellationToken::new());
        (handler, rx)
    }

    #[tokio::test]
    async fn removed_inventory_is_no_longer_rebroadcast() {
        let (mut handler, mut router_rx) = handler();
        let kept = InvVect::tx(Hash([1; 32]));
        let confirmed = InvVect::tx(Hash([2; 32]));
        for inv in [kept, confirmed] {
            handler.handle_command(RebroadcastCmd::Add {
                inv,
                data: RelayData::None,
            });
        }
        handler.handle_command(RebroadcastCmd::Remove(confirmed));

        handler.rebroadcast().await;
        let event = router_rx.try_recv().unwrap();
        assert!(matches!(event, RouterEvent::Relay(msg) if msg.inv == kept));
        assert!(router_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn first_rebroadcast_waits_five_minutes() {
        let (handler, mut router_rx) = handler();
        let quit = handler.quit.clone();
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let start = Instant::now();
        let task = tokio::spawn(handler.run(cmd_rx));

        let inv = InvVect::tx(Hash([3; 32]));
        cmd_tx
            .send(RebroadcastCmd::Add {
                inv,
                data: RelayData::None,
            })
            .await
            .unwrap();

        let event = router_rx.recv().await.unwrap();
        assert!(matches!(event, RouterEvent::Relay(msg) if msg.inv == inv));
        assert!(Instant::now() - start >= FIRST_REBROADCAST_DELAY);

        // Later rounds come within half an hour.
        let second = Instant::now();
        router_rx.recv().await.unwrap();
        assert!(Instant::now() - second <= Duration::from_secs(MAX_REBROADCAST_DELAY_SECS));

        quit.cancel();
        task.await.unwrap().unwrap();
    }
}
