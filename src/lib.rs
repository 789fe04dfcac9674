// If code coverage tool `cargo-llvm-cov` is running with the nightly toolchain,
// enable the unstable “coverage” attribute. This allows using the annotation
// `#[coverage(off)]` to explicitly exclude certain parts of the code from
// being considered as “code under test.” The annotation should be added to
// every `#[cfg(test)]` module:
// `#[cfg_attr(coverage_nightly, coverage(off))]`.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod cf_checkpoint_cache;
pub mod collaborators;
pub mod config_models;
pub mod macros;
pub mod misbehavior;
pub mod models;
pub mod peer_loop;
pub mod rebroadcast;
pub mod relay;
pub mod router;
pub mod server;
pub mod transport;
pub mod upnp;


use std::env;
use std::sync::Arc;

use anyhow::Result;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

use crate::collaborators::Collaborators;
use crate::config_models::cli_args;
use crate::server::Server;

/// Capacity of the channel carrying events and queries into the router. The
/// effective capacity is never below `max_peers`.
const ROUTER_CHANNEL_CAPACITY: usize = 1000;
const REBROADCAST_CHANNEL_CAPACITY: usize = 1000;
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build a [`Server`] around the supplied collaborators and start its
/// background tasks: the router, the rebroadcast tracker and, if enabled, the
/// UPnP lease renewal. Must be called from within a tokio runtime.
pub fn initialize(
    cli_args: cli_args::Args,
    collaborators: Collaborators,
) -> Result<Arc<Server>> {
    info!(
        "Starting pod peer server v{} on {}. max peers: {}",
        VERSION, cli_args.network, cli_args.max_peers
    );

    let server = Arc::new(Server::new(cli_args, collaborators));
    server.start()?;

    Ok(server)
}

/// Configure logger to use ISO-8601, of which rfc3339 is a subset. Install
/// global collector configured based on RUST_LOG env var. Accepted `RUST_LOG`
/// values are `trace`, `debug`, `info`, `warn`, and `error`.
///
/// Intended for the embedding binary; calling it twice is an error.
pub fn set_up_logger() -> Result<()> {
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_thread_ids(true)
            .finish(),
    )
    .map_err(|err| anyhow::anyhow!("Unable to set global default subscriber: {err}"))
}

/// Logs the duration of a scope when it is dropped, optionally only if the
/// duration exceeds a threshold in seconds.
///
/// Usually constructed through [`macros::log_slow_scope`] or
/// [`macros::log_scope_duration`].
#[derive(Debug)]
pub struct ScopeDurationLogger<'a> {
    start: Instant,
    description: &'a str,
    log_slow_fn_threshold: Option<f64>,
    location: &'static std::panic::Location<'static>,
}

impl<'a> ScopeDurationLogger<'a> {
    #[track_caller]
    pub fn new(description: &'a str, log_slow_fn_threshold: Option<f64>) -> Self {
        Self {
            start: Instant::now(),
            description,
            log_slow_fn_threshold,
            location: std::panic::Location::caller(),
        }
    }

    #[track_caller]
    pub fn new_with_threshold(description: &'a str, log_slow_fn_threshold: f64) -> Self {
        Self::new(description, Some(log_slow_fn_threshold))
    }

    /// Threshold is read from `LOG_SLOW_SCOPE_THRESHOLD`, falling back to one
    /// millisecond if unset or unparsable.
    #[track_caller]
    pub fn new_default_threshold(description: &'a str) -> Self {
        Self::new_with_threshold(
            description,
            env::var("LOG_SLOW_SCOPE_THRESHOLD")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(0.001),
        )
    }

    #[track_caller]
    pub fn new_without_threshold(description: &'a str) -> Self {
        Self::new(description, None)
    }
}

impl Drop for ScopeDurationLogger<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let duration = elapsed.as_secs_f64();

        if let Some(threshold) = self.log_slow_fn_threshold {
            if duration >= threshold {
                let msg = format!(
                    "executed {} in {} secs.  exceeds slow fn threshold of {} secs.  location: {}",
                    self.description, duration, threshold, self.location,
                );

                tracing::debug!("{}", msg);
            }
        } else {
            let msg = format!(
                "executed {} in {} secs.  location: {}",
                self.description, duration, self.location,
            );

            tracing::debug!("{}", msg);
        }
    }
}
