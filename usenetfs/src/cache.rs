//! In-memory cache of decoded segments
//!
//! Decoded yEnc parts are kept in memory keyed by message-id so that seeks
//! back into recently read data, and concurrent readers of the same file,
//! never hit the network twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::segment::SegmentData;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SegmentCacheConfig {
    /// Maximum memory used by decoded segments (bytes).
    /// 0 = unbounded, entries only expire when idle.
    pub max_memory_bytes: u64,
    /// Entries not read for this long are dropped.
    #[serde(with = "crate::nntp::connection::secs")]
    pub time_to_idle: Duration,
}

impl Default for SegmentCacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 256 * 1024 * 1024,
            time_to_idle: Duration::from_secs(300),
        }
    }
}

/// Cache of decoded segments, weighed by body length.
#[derive(Clone)]
pub struct SegmentCache {
    cache: Cache<String, Arc<SegmentData>>,
}

impl SegmentCache {
    pub fn new(config: &SegmentCacheConfig) -> Self {
        let builder = Cache::builder()
            .weigher(|_id: &String, seg: &Arc<SegmentData>| {
                u32::try_from(seg.body.len()).unwrap_or(u32::MAX)
            })
            .time_to_idle(config.time_to_idle);
        let cache = if config.max_memory_bytes > 0 {
            builder.max_capacity(config.max_memory_bytes).build()
        } else {
            builder.build()
        };

        debug!(
            "SegmentCache: Created with max_memory={}",
            if config.max_memory_bytes > 0 {
                format!("{}MB", config.max_memory_bytes / (1024 * 1024))
            } else {
                "unlimited".to_string()
            }
        );

        Self { cache }
    }

    pub async fn get(&self, message_id: &str) -> Option<Arc<SegmentData>> {
        self.cache.get(message_id).await
    }

    pub async fn insert(&self, message_id: &str, data: Arc<SegmentData>) {
        self.cache.insert(message_id.to_string(), data).await;
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.cache.contains_key(message_id)
    }

    pub async fn invalidate(&self, message_id: &str) {
        self.cache.invalidate(message_id).await;
    }

    /// Returns the cached segment or runs `fetch` to produce it. Concurrent
    /// callers for the same id share one fetch; failures are not cached.
    pub async fn get_or_fetch<F, E>(&self, message_id: &str, fetch: F) -> Result<Arc<SegmentData>, E>
    where
        F: Future<Output = Result<Arc<SegmentData>, E>>,
        E: Clone + Send + Sync + 'static,
    {
        self.cache
            .try_get_with(message_id.to_string(), fetch)
            .await
            .map_err(|e| (*e).clone())
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Total weight (decoded bytes) of the cached segments.
    pub fn weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}
