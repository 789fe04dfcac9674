use tracing::warn;

use crate::models::channel::RelayData;
use crate::models::channel::RelayMsg;
use crate::models::peer::session::PeerSession;
use crate::models::peer::InvType;
use crate::models::peer::PeerMessage;

/// What to send a single peer for a relayed inventory vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    Skip,

    /// The peer prefers headers over block inventory.
    SendHeaders,

    /// Batch the inventory vector with the peer's next trickle.
    QueueInventory,
}

/// Decide whether and how `msg` is relayed to `session`.
///
/// Matching a transaction against the peer's bloom filter may update the
/// filter, as BIP37 requires.
pub fn relay_decision(session: &PeerSession, msg: &RelayMsg) -> RelayDecision {
    if !session.is_connected() {
        return RelayDecision::Skip;
    }

    match msg.inv.inv_type {
        InvType::Block if session.wants_headers() => match &msg.data {
            RelayData::BlockHeader(_) => RelayDecision::SendHeaders,
            _ => {
                warn!("Underlying data for headers is not a block header");
                RelayDecision::Skip
            }
        },
        InvType::Tx => {
            if session.relay_tx_disabled() {
                return RelayDecision::Skip;
            }

            let RelayData::TxDesc(tx_desc) = &msg.data else {
                warn!(
                    "Underlying data for tx inv relay is not a transaction descriptor: {:?}",
                    msg.data
                );
                return RelayDecision::Skip;
            };

            let fee_filter = session.fee_filter();
            if fee_filter > 0 && tx_desc.fee_per_kb < fee_filter {
                return RelayDecision::Skip;
            }

            if session.with_filter(|filter| filter.match_tx_and_update(&tx_desc.tx)) == Some(false)
            {
                return RelayDecision::Skip;
            }

            RelayDecision::QueueInventory
        }
        _ => RelayDecision::QueueInventory,
    }
}

/// Relay `msg` to `session` according to [`relay_decision`]. Inventory the
/// peer already knows is not queued again.
pub fn relay_to_peer(session: &PeerSession, msg: &RelayMsg) {
    match relay_decision(session, msg) {
        RelayDecision::Skip => {}
        RelayDecision::SendHeaders => {
            if let RelayData::BlockHeader(header) = &msg.data {
                session.queue_message(PeerMessage::Headers(vec![(**header).clone()]), None);
            }
        }
        RelayDecision::QueueInventory => session.queue_inventory(msg.inv),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::net::IpAddr;
    use std::net::Ipv4Addr;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use super::*;
    use crate::models::blockchain::Hash;
    use crate::models::peer::bloom::BloomFilter;
    use crate::models::peer::bloom::BloomUpdateType;
    use crate::models::peer::session::ConnectionOrigin;
    use crate::models::peer::session::Outbound;
    use crate::models::peer::InvVect;
    use crate::tests::shared::block_with_txs;
    use crate::tests::shared::tx_desc;

    fn session() -> (Arc<PeerSession>, mpsc::UnboundedReceiver<Outbound>) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 11047);
        PeerSession::new(7, addr, ConnectionOrigin::Inbound, false)
    }

    fn tx_relay(fee_per_kb: i64) -> RelayMsg {
        let desc = tx_desc(3, fee_per_kb);
        RelayMsg {
            inv: InvVect::tx(desc.tx.txid),
            data: RelayData::TxDesc(Box::new(desc)),
        }
    }

    #[test]
    fn transactions_below_fee_filter_are_skipped() {
        let (session, _rx) = session();
        session.set_fee_filter(1000);
        assert_eq!(RelayDecision::Skip, relay_decision(&session, &tx_relay(999)));
        assert_eq!(
            RelayDecision::QueueInventory,
            relay_decision(&session, &tx_relay(1000))
        );
    }

    #[test]
    fn relay_disabled_peers_get_no_transactions() {
        let (session, _rx) = session();
        session.set_relay_tx_disabled(true);
        assert_eq!(RelayDecision::Skip, relay_decision(&session, &tx_relay(5000)));

        let block = RelayMsg {
            inv: InvVect::block(Hash([9; 32])),
            data: RelayData::None,
        };
        assert_eq!(RelayDecision::QueueInventory, relay_decision(&session, &block));
    }

    #[test]
    fn loaded_filter_must_match_transaction() {
        let (session, _rx) = session();
        let relay = tx_relay(5000);
        session.load_filter(BloomFilter::new(10, 0, 0.0001, BloomUpdateType::None));
        assert_eq!(RelayDecision::Skip, relay_decision(&session, &relay));

        let RelayData::TxDesc(desc) = &relay.data else {
            unreachable!()
        };
        session.with_filter(|filter| filter.add(desc.tx.txid.as_bytes()));
        assert_eq!(RelayDecision::QueueInventory, relay_decision(&session, &relay));
    }

    #[traced_test]
    #[test]
    fn headers_preferring_peers_get_headers_for_blocks() {
        let (session, mut rx) = session();
        session.set_wants_headers();
        let block = block_with_txs(1, 2);

        let with_header = RelayMsg {
            inv: InvVect::block(block.hash),
            data: RelayData::BlockHeader(Box::new(block.header.clone())),
        };
        relay_to_peer(&session, &with_header);
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Message { message: PeerMessage::Headers(headers), .. }) if headers == vec![block.header.clone()]
        ));

        let without_header = RelayMsg {
            inv: InvVect::block(block.hash),
            data: RelayData::None,
        };
        relay_to_peer(&session, &without_header);
        assert!(rx.try_recv().is_err());
        assert!(logs_contain("not a block header"));
    }

    #[test]
    fn known_inventory_is_not_queued_twice() {
        let (session, mut rx) = session();
        let relay = tx_relay(5000);
        relay_to_peer(&session, &relay);
        relay_to_peer(&session, &relay);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Inventory(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnected_peers_are_skipped() {
        let (session, _rx) = session();
        session.disconnect();
        assert_eq!(RelayDecision::Skip, relay_decision(&session, &tx_relay(5000)));
    }
}
