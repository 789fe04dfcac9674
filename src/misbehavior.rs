use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::config_models::cli_args;
use crate::models::peer::session::PeerSession;
use crate::router::log_router_error;
use crate::router::RouterHandle;

/// Outcome of scoring a misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Tolerated,

    /// The ban threshold was crossed.
    Ban,
}

/// Turns misbehavior into ban score and decides when a peer is banned.
#[derive(Debug, Clone, Copy)]
pub struct MisbehaviorScorer {
    disable_banning: bool,
    ban_threshold: u32,
    warn_threshold: u32,
}

impl MisbehaviorScorer {
    pub fn new(cli: &cli_args::Args) -> Self {
        Self {
            disable_banning: cli.disable_banning,
            ban_threshold: cli.ban_threshold,
            warn_threshold: cli.ban_warn_threshold(),
        }
    }

    /// Add to the session's ban score and log a warning once it is above half
    /// the threshold.
    ///
    /// With both deltas zero the score is left as is, but the warning is
    /// repeated while the score stays high. Whitelisted peers are never
    /// scored.
    pub fn score(
        &self,
        session: &PeerSession,
        persistent: u32,
        transient: u32,
        reason: &str,
    ) -> Verdict {
        if self.disable_banning {
            return Verdict::Tolerated;
        }

        if session.is_whitelisted() {
            debug!("Misbehaving whitelisted peer {session}: {reason}");
            return Verdict::Tolerated;
        }

        let warn_threshold = self.warn_threshold;
        if persistent == 0 && transient == 0 {
            let score = session.ban_score().int();
            if score > warn_threshold {
                warn!(
                    "Misbehaving peer {session}: {reason} -- ban score is {score}, it was not increased this time"
                );
            }
            return Verdict::Tolerated;
        }

        let score = session.ban_score().increase(persistent, transient);
        if score > warn_threshold {
            warn!("Misbehaving peer {session}: {reason} -- ban score increased to {score}");
            if score > self.ban_threshold {
                warn!("Misbehaving peer {session} -- banning and disconnecting");
                return Verdict::Ban;
            }
        }

        Verdict::Tolerated
    }

    /// Score the misbehavior and, past the threshold, ban the peer's host and
    /// disconnect it. Returns whether the peer was banned.
    pub async fn add_ban_score(
        &self,
        session: &Arc<PeerSession>,
        router: &RouterHandle,
        persistent: u32,
        transient: u32,
        reason: &str,
    ) -> bool {
        match self.score(session, persistent, transient, reason) {
            Verdict::Tolerated => false,
            Verdict::Ban => {
                log_router_error(router.ban(session.clone()).await, "ban peer");
                session.disconnect();
                true
            }
        }
    }
}
