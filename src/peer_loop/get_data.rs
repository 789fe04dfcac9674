use anyhow::Result;
use tokio::sync::oneshot;
use tracing::trace;
use tracing::warn;

use super::ServerPeer;
use super::DISCONNECT_CONNECTION;
use super::KEEP_CONNECTION_ALIVE;
use crate::macros::fn_name;
use crate::macros::log_slow_scope;
use crate::models::blockchain::Hash;
use crate::models::peer::bloom::MerkleBlock;
use crate::models::peer::session::DoneReceiver;
use crate::models::peer::session::DoneSender;
use crate::models::peer::InvType;
use crate::models::peer::InvVect;
use crate::models::peer::PeerMessage;
use crate::models::peer::MAX_INV_PER_MSG;

/// Every this many requested items, the response waits for the previous
/// batch to be written before queuing more.
const PIPELINE_DEPTH: usize = 3;

enum Fetch {
    Tx,
    Block,
    MerkleBlock,
}

async fn wait_for(previous: Option<DoneReceiver>) {
    if let Some(previous) = previous {
        // A dropped sender counts as done.
        let _ = previous.await;
    }
}

impl ServerPeer {
    /// Serve a `getdata` request.
    ///
    /// Responses are pipelined: every third item carries a completion signal
    /// and the next fetch waits for it, so a large request never queues much
    /// more than what is on its way out. Items that cannot be served are
    /// answered in one `notfound` message. Returns once everything queued
    /// has been written.
    pub(super) async fn on_get_data(&self, inventory: Vec<InvVect>) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::GetData");

        if inventory.is_empty() {
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        let length = inventory.len();
        if length > MAX_INV_PER_MSG {
            trace!(
                "Too many getdata items from {} [count {}, max {}]",
                self.session,
                length,
                MAX_INV_PER_MSG
            );
            return Ok(DISCONNECT_CONNECTION);
        }

        // Requesting a full message worth of items repeatedly within a short
        // time crosses the ban threshold. Bursts of small requests do not.
        let penalty = u32::try_from(length * 99 / MAX_INV_PER_MSG).unwrap_or(u32::MAX);
        if self.add_ban_score(0, penalty, "getdata").await {
            return Ok(DISCONNECT_CONNECTION);
        }

        let mut not_found = vec![];
        let mut num_added = 0;
        let mut previous: Option<DoneReceiver> = None;
        let (final_tx, mut final_rx) = oneshot::channel();
        let mut final_tx = Some(final_tx);

        for (i, inv) in inventory.iter().enumerate() {
            let fetch = match inv.inv_type {
                InvType::Tx | InvType::WitnessTx => Fetch::Tx,
                InvType::Block | InvType::WitnessBlock => Fetch::Block,
                InvType::FilteredBlock | InvType::FilteredWitnessBlock => Fetch::MerkleBlock,
                InvType::Error => {
                    warn!("Unknown type in inventory request {}", inv.inv_type);
                    continue;
                }
            };

            let uses_final = i == length - 1 && not_found.is_empty();
            let (done, done_rx) = if uses_final {
                (final_tx.take(), None)
            } else if (i + 1) % PIPELINE_DEPTH == 0 {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            let wait = previous.take();
            let result = match fetch {
                Fetch::Tx => self.push_tx(&inv.hash, done, wait).await,
                Fetch::Block => self.push_block(&inv.hash, done, wait).await,
                Fetch::MerkleBlock => self.push_merkle_block(&inv.hash, done, wait).await,
            };

            if let Err(err) = result {
                trace!("Unable to serve {inv} to {}: {err}", self.session);
                not_found.push(*inv);

                // The final completion went down with the failed item; the
                // notfound reply needs a fresh one.
                if uses_final {
                    let (tx, rx) = oneshot::channel();
                    final_tx = Some(tx);
                    final_rx = rx;
                }
            }
            num_added += 1;
            previous = done_rx;
        }

        if !not_found.is_empty() {
            self.session
                .queue_message(PeerMessage::NotFound(not_found), final_tx.take());
        }

        // Never handed out when the last item was of unknown type.
        drop(final_tx);

        if num_added > 0 {
            wait_for(previous).await;
            let _ = final_rx.await;
        }

        Ok(KEEP_CONNECTION_ALIVE)
    }

    async fn push_tx(
        &self,
        txid: &Hash,
        done: Option<DoneSender>,
        wait: Option<DoneReceiver>,
    ) -> Result<()> {
        let tx = self
            .context
            .collaborators
            .mempool
            .fetch_transaction(txid)
            .inspect_err(|err| {
                trace!("Unable to fetch tx {txid} from transaction pool: {err}");
            })?;

        wait_for(wait).await;
        self.session.queue_message(PeerMessage::Tx(Box::new(tx)), done);

        Ok(())
    }

    /// Queue the block. If it is the last block of a truncated `getblocks`
    /// reply, follow it with an inventory of the chain tip so the peer asks
    /// for the next batch.
    async fn push_block(
        &self,
        hash: &Hash,
        done: Option<DoneSender>,
        wait: Option<DoneReceiver>,
    ) -> Result<()> {
        let chain = &self.context.collaborators.chain;
        let block = chain.fetch_block(hash).await.inspect_err(|err| {
            trace!("Unable to fetch requested block hash {hash}: {err}");
        })?;

        wait_for(wait).await;

        let send_inv = self.session.continue_hash() == Some(*hash);
        let (block_done, inv_done) = if send_inv {
            (None, done)
        } else {
            (done, None)
        };
        self.session
            .queue_message(PeerMessage::Block(Box::new(block)), block_done);

        if send_inv {
            let best = chain.best_snapshot();
            self.session.queue_message(
                PeerMessage::Inv(vec![InvVect::block(best.hash)]),
                inv_done,
            );
            self.session.set_continue_hash(None);
        }

        Ok(())
    }

    /// Queue the block filtered through the peer's bloom filter, followed by
    /// the matching transactions. Nothing is sent without a loaded filter.
    async fn push_merkle_block(
        &self,
        hash: &Hash,
        done: Option<DoneSender>,
        wait: Option<DoneReceiver>,
    ) -> Result<()> {
        if !self.session.filter_is_loaded() {
            return Ok(());
        }

        let block = self
            .context
            .collaborators
            .chain
            .fetch_block(hash)
            .await
            .inspect_err(|err| {
                trace!("Unable to fetch requested block hash {hash}: {err}");
            })?;

        let Some((merkle_block, matched)) = self
            .session
            .with_filter(|filter| MerkleBlock::new(&block, filter))
        else {
            return Ok(());
        };

        wait_for(wait).await;

        let (merkle_done, mut last_tx_done) = if matched.is_empty() {
            (done, None)
        } else {
            (None, done)
        };
        self.session
            .queue_message(PeerMessage::MerkleBlock(Box::new(merkle_block)), merkle_done);

        for (i, tx_index) in matched.iter().enumerate() {
            let tx_done = if i == matched.len() - 1 {
                last_tx_done.take()
            } else {
                None
            };
            if let Some(tx) = block.transactions.get(*tx_index) {
                self.session
                    .queue_message(PeerMessage::Tx(Box::new(tx.clone())), tx_done);
            }
        }

        Ok(())
    }
}
