use std::collections::HashMap;

use anyhow::bail;
use anyhow::Result;
use tokio::sync::RwLock;
use tracing::info;
use tracing::trace;

use crate::collaborators::FilterIndex;
use crate::models::blockchain::Hash;
use crate::models::peer::FilterType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CfHeaderKv {
    /// `None` for slots added by growing the cache and not yet filled.
    block_hash: Option<Hash>,
    filter_header: Hash,
}

/// Committed filter headers at every checkpoint interval, per filter type.
///
/// Entries are only refetched from the point where the cached block hashes
/// stop matching the requested chain, so a reorganization costs as many
/// fetches as it is deep.
#[derive(Debug, Default)]
pub struct CfCheckpointCache {
    caches: RwLock<HashMap<FilterType, Vec<CfHeaderKv>>>,
}

/// Index of the last position, counted from one, where `cache` agrees with
/// `block_hashes`. Everything before it can be served from the cache.
fn fork_index(cache: &[CfHeaderKv], block_hashes: &[Hash]) -> usize {
    (1..=block_hashes.len().min(cache.len()))
        .rev()
        .find(|&i| cache[i - 1].block_hash == Some(block_hashes[i - 1]))
        .unwrap_or(0)
}

impl CfCheckpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, filter_type: FilterType) -> usize {
        self.caches
            .read()
            .await
            .get(&filter_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Filter headers of the checkpoint blocks `block_hashes`, in order.
    ///
    /// Fails without touching the cache if the index is missing any of the
    /// headers that needed fetching.
    pub async fn checkpoint_headers(
        &self,
        filter_type: FilterType,
        block_hashes: &[Hash],
        index: &dyn FilterIndex,
    ) -> Result<Vec<Hash>> {
        {
            let caches = self.caches.read().await;
            let cache = caches.get(&filter_type).map(Vec::as_slice).unwrap_or(&[]);
            if cache.len() >= block_hashes.len()
                && fork_index(cache, block_hashes) == block_hashes.len()
            {
                trace!("Serving cached checkpoints of size {}", cache.len());
                return Ok(cache[..block_hashes.len()]
                    .iter()
                    .map(|kv| kv.filter_header)
                    .collect());
            }
        }

        let mut caches = self.caches.write().await;
        let cache = caches.entry(filter_type).or_default();
        if block_hashes.len() > cache.len() {
            info!(
                "Growing size of checkpoint cache from {} to {} block hashes",
                cache.len(),
                block_hashes.len()
            );
            cache.resize(block_hashes.len(), CfHeaderKv::default());
        }

        let fork = fork_index(cache, block_hashes);
        let missing = &block_hashes[fork..];
        let fetched = if missing.is_empty() {
            vec![]
        } else {
            index
                .filter_headers_by_block_hashes(missing, filter_type)
                .await?
        };
        if fetched.len() != missing.len() {
            bail!(
                "Filter index returned {} headers for {} block hashes",
                fetched.len(),
                missing.len()
            );
        }

        let mut headers = Vec::with_capacity(missing.len());
        for (block_hash, header) in missing.iter().zip(fetched) {
            let Some(header) = header else {
                bail!("Could not obtain CF header for {block_hash}");
            };
            headers.push(header);
        }

        for (offset, (block_hash, header)) in missing.iter().zip(&headers).enumerate() {
            cache[fork + offset] = CfHeaderKv {
                block_hash: Some(*block_hash),
                filter_header: *header,
            };
        }

        Ok(cache[..block_hashes.len()]
            .iter()
            .map(|kv| kv.filter_header)
            .collect())
    }
}
