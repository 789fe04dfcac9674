use anyhow::Result;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::ServerPeer;
use super::KEEP_CONNECTION_ALIVE;
use crate::macros::fn_name;
use crate::macros::log_slow_scope;
use crate::models::peer::CFCheckptMessage;
use crate::models::peer::CFCheckptRequest;
use crate::models::peer::CFHeadersMessage;
use crate::models::peer::CFRangeRequest;
use crate::models::peer::CFilterMessage;
use crate::models::peer::FilterType;
use crate::models::peer::PeerMessage;
use crate::models::peer::CF_CHECKPOINT_INTERVAL;
use crate::models::peer::MAX_CF_HEADERS_PER_MSG;
use crate::models::peer::MAX_GET_CFILTERS_REQ_RANGE;

impl ServerPeer {
    /// Whether a committed filter request may be answered at all: the node
    /// must be current, must have an index, and must maintain the filter
    /// type.
    fn serves_cfilters(&self, filter_type: FilterType, what: &str) -> bool {
        if !self.context.collaborators.sync.is_current() {
            return false;
        }

        if filter_type != FilterType::REGULAR {
            debug!("Filter request for unknown {what} for filter: {filter_type}");
            return false;
        }

        if self.context.collaborators.filter_index.is_none() {
            debug!("Ignoring {what} request from {}: no filter index", self.session);
            return false;
        }

        true
    }

    pub(super) async fn on_get_cfilters(&self, request: CFRangeRequest) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::GetCFilters");

        if !self.serves_cfilters(request.filter_type, "filters") {
            return Ok(KEEP_CONNECTION_ALIVE);
        }
        let Some(index) = &self.context.collaborators.filter_index else {
            return Ok(KEEP_CONNECTION_ALIVE);
        };

        let hashes = match self.context.collaborators.chain.height_to_hash_range(
            request.start_height,
            &request.stop_hash,
            MAX_GET_CFILTERS_REQ_RANGE,
        ) {
            Ok(hashes) => hashes,
            Err(err) => {
                debug!("Invalid getcfilters request: {err}");
                return Ok(KEEP_CONNECTION_ALIVE);
            }
        };

        let filters = match index
            .filters_by_block_hashes(&hashes, request.filter_type)
            .await
        {
            Ok(filters) => filters,
            Err(err) => {
                error!("Error retrieving cfilters: {err}");
                return Ok(KEEP_CONNECTION_ALIVE);
            }
        };
        if filters.len() != hashes.len() {
            error!(
                "Filter index returned {} cfilters for {} block hashes",
                filters.len(),
                hashes.len()
            );
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        for (block_hash, filter) in hashes.into_iter().zip(filters) {
            let Some(data) = filter.filter(|data| !data.is_empty()) else {
                warn!("Could not obtain cfilter for {block_hash}");
                return Ok(KEEP_CONNECTION_ALIVE);
            };
            self.session.queue_message(
                PeerMessage::CFilter(CFilterMessage {
                    filter_type: request.filter_type,
                    block_hash,
                    data,
                }),
                None,
            );
        }

        Ok(KEEP_CONNECTION_ALIVE)
    }

    pub(super) async fn on_get_cfheaders(&self, request: CFRangeRequest) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::GetCFHeaders");

        if !self.serves_cfilters(request.filter_type, "headers") {
            return Ok(KEEP_CONNECTION_ALIVE);
        }
        let Some(index) = &self.context.collaborators.filter_index else {
            return Ok(KEEP_CONNECTION_ALIVE);
        };

        // From a positive start height, also fetch the predecessor so its
        // filter header can fill in the previous header.
        let with_predecessor = request.start_height > 0;
        let (start_height, max_results) = if with_predecessor {
            (request.start_height - 1, MAX_CF_HEADERS_PER_MSG + 1)
        } else {
            (request.start_height, MAX_CF_HEADERS_PER_MSG)
        };

        let mut hashes = match self.context.collaborators.chain.height_to_hash_range(
            start_height,
            &request.stop_hash,
            max_results,
        ) {
            Ok(hashes) => hashes,
            Err(err) => {
                debug!("Invalid getcfheaders request: {err}");
                return Ok(KEEP_CONNECTION_ALIVE);
            }
        };

        // A start height one past the stop block leaves only the predecessor.
        if hashes.is_empty() || (with_predecessor && hashes.len() == 1) {
            debug!("No results for getcfheaders request");
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        let mut filter_hashes = match index
            .filter_hashes_by_block_hashes(&hashes, request.filter_type)
            .await
        {
            Ok(filter_hashes) => filter_hashes,
            Err(err) => {
                error!("Error retrieving cfilter hashes: {err}");
                return Ok(KEEP_CONNECTION_ALIVE);
            }
        };
        if filter_hashes.len() != hashes.len() {
            error!(
                "Filter index returned {} cfilter hashes for {} block hashes",
                filter_hashes.len(),
                hashes.len()
            );
            return Ok(KEEP_CONNECTION_ALIVE);
        }

        let mut prev_filter_header = Default::default();
        if with_predecessor {
            let prev_block_hash = hashes[0];
            let headers = match index
                .filter_headers_by_block_hashes(&[prev_block_hash], request.filter_type)
                .await
            {
                Ok(headers) => headers,
                Err(err) => {
                    error!("Error retrieving CF header: {err}");
                    return Ok(KEEP_CONNECTION_ALIVE);
                }
            };
            let Some(Some(header)) = headers.into_iter().next() else {
                warn!("Could not obtain CF header for {prev_block_hash}");
                return Ok(KEEP_CONNECTION_ALIVE);
            };
            prev_filter_header = header;

            hashes.remove(0);
            filter_hashes.remove(0);
        }

        let mut header_hashes = Vec::with_capacity(filter_hashes.len());
        for (block_hash, filter_hash) in hashes.iter().zip(filter_hashes) {
            let Some(filter_hash) = filter_hash else {
                warn!("Could not obtain CF hash for {block_hash}");
                return Ok(KEEP_CONNECTION_ALIVE);
            };
            header_hashes.push(filter_hash);
        }

        self.session.queue_message(
            PeerMessage::CFHeaders(CFHeadersMessage {
                filter_type: request.filter_type,
                stop_hash: request.stop_hash,
                prev_filter_header,
                filter_hashes: header_hashes,
            }),
            None,
        );

        Ok(KEEP_CONNECTION_ALIVE)
    }

    /// Answer with the filter header at every checkpoint interval up to the
    /// stop hash, served through the shared checkpoint cache.
    pub(super) async fn on_get_cfcheckpt(&self, request: CFCheckptRequest) -> Result<bool> {
        log_slow_scope!(fn_name!() + "::PeerMessage::GetCFCheckpt");

        if !self.serves_cfilters(request.filter_type, "checkpoints") {
            return Ok(KEEP_CONNECTION_ALIVE);
        }
        let Some(index) = &self.context.collaborators.filter_index else {
            return Ok(KEEP_CONNECTION_ALIVE);
        };

        let block_hashes = match self
            .context
            .collaborators
            .chain
            .interval_block_hashes(&request.stop_hash, CF_CHECKPOINT_INTERVAL)
        {
            Ok(block_hashes) => block_hashes,
            Err(err) => {
                debug!("Invalid getcfcheckpt request: {err}");
                return Ok(KEEP_CONNECTION_ALIVE);
            }
        };

        let filter_headers = match self
            .context
            .cf_cache
            .checkpoint_headers(request.filter_type, &block_hashes, index.as_ref())
            .await
        {
            Ok(filter_headers) => filter_headers,
            Err(err) => {
                warn!("{err}");
                return Ok(KEEP_CONNECTION_ALIVE);
            }
        };

        self.session.queue_message(
            PeerMessage::CFCheckpt(CFCheckptMessage {
                filter_type: request.filter_type,
                stop_hash: request.stop_hash,
                filter_headers,
            }),
            None,
        );

        Ok(KEEP_CONNECTION_ALIVE)
    }
}
