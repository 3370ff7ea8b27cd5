//! Multi-provider segment fetching.
//!
//! A [`ProviderSet`] is one generation of provider pools. The [`Manager`]
//! swaps generations on configuration changes and keeps the retired one
//! alive for a grace period so in-flight reads can finish.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{SegmentCache, SegmentCacheConfig};
use crate::config::{ProviderConfig, UsenetConfig};
use crate::nntp::{format_message_id, Connection, ConnectionPool, ErrorKind, NntpError};
use crate::segment::SegmentData;
use crate::yenc::YencDecoder;

const RETIRE_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("server is locked for modification")]
    ProviderLocked,

    #[error("provider {0} already exists")]
    DuplicateProvider(String),

    #[error("manager is closed")]
    Closed,

    #[error(transparent)]
    Nntp(#[from] NntpError),
}

/// Source of decoded segments.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    /// Fetches and decodes one article. `groups` are the newsgroups the
    /// article was posted to; the first one is selected before `BODY`.
    async fn fetch_segment(
        &self,
        message_id: &str,
        groups: &[String],
    ) -> Result<Arc<SegmentData>, NntpError>;
}

pub struct Provider {
    pool: ConnectionPool,
    name: String,
    priority: i32,
    is_backup: bool,
    updated_at: Option<DateTime<Utc>>,
}

impl Provider {
    pub fn id(&self) -> &str {
        self.pool.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_backup(&self) -> bool {
        self.is_backup
    }
}

/// An ordered set of provider pools sharing one segment cache.
pub struct ProviderSet {
    providers: RwLock<Vec<Arc<Provider>>>,
    cache: SegmentCache,
}

impl ProviderSet {
    /// Builds pools for every config. Configs whose pool cannot be created
    /// are logged and skipped.
    pub async fn new(configs: &[ProviderConfig], cache: SegmentCache) -> Self {
        let set = Self::empty(cache);
        for config in configs {
            if let Err(e) = set.add_provider(config).await {
                warn!("failed to create provider {}: {}", config.id(), e);
            }
        }
        set
    }

    pub fn empty(cache: SegmentCache) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            cache,
        }
    }

    pub async fn add_provider(&self, config: &ProviderConfig) -> Result<(), ManagerError> {
        let id = config.id();
        if self.providers.read().iter().any(|p| p.id() == id) {
            return Err(ManagerError::DuplicateProvider(id));
        }

        let pool = ConnectionPool::new(config.pool_config()).await?;
        let provider = Arc::new(Provider {
            pool,
            name: config.name.clone(),
            priority: config.priority,
            is_backup: config.is_backup,
            updated_at: config.updated_at,
        });

        let mut providers = self.providers.write();
        providers.push(provider);
        // most recently updated first among equal priorities
        providers.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        debug!(provider = %id, count = providers.len(), "provider added");
        Ok(())
    }

    /// Removes the provider and closes its pool. Returns false for unknown ids.
    pub async fn remove_provider(&self, id: &str) -> bool {
        let removed = {
            let mut providers = self.providers.write();
            let idx = providers.iter().position(|p| p.id() == id);
            idx.map(|idx| providers.remove(idx))
        };
        match removed {
            Some(provider) => {
                provider.pool.close().await;
                debug!(provider = %id, "provider removed");
                true
            }
            None => false,
        }
    }

    /// Providers in the order segments are requested from them.
    pub fn providers(&self) -> Vec<Arc<Provider>> {
        let providers = self.providers.read();
        providers
            .iter()
            .filter(|p| !p.is_backup)
            .chain(providers.iter().filter(|p| p.is_backup))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    pub fn acquired_count(&self, id: &str) -> usize {
        self.providers
            .read()
            .iter()
            .find(|p| p.id() == id)
            .map(|p| p.pool.stats().acquired)
            .unwrap_or(0)
    }

    pub async fn close(&self) {
        let providers = std::mem::take(&mut *self.providers.write());
        join_all(providers.iter().map(|p| p.pool.close())).await;
    }

    async fn fetch_uncached(
        &self,
        message_id: &str,
        groups: &[String],
    ) -> Result<Arc<SegmentData>, NntpError> {
        let providers = self.providers();
        if providers.is_empty() {
            return Err(NntpError::Config("no usenet providers configured".into()));
        }

        let mut missing = None;
        let mut failure = None;
        for provider in providers {
            match fetch_from(&provider.pool, message_id, groups).await {
                Ok(segment) => return Ok(Arc::new(segment)),
                Err(e) if e.is_no_such_article() => {
                    trace!(provider = %provider.id(), %message_id, "article not found, trying next provider");
                    missing = Some(e);
                }
                Err(e) => {
                    debug!(provider = %provider.id(), %message_id, "segment fetch failed: {}", e);
                    failure = Some(e);
                }
            }
        }

        Err(failure
            .or(missing)
            .unwrap_or_else(|| NntpError::command(format!("BODY {message_id}"), 430, "No such article")))
    }
}

#[async_trait]
impl SegmentFetcher for ProviderSet {
    async fn fetch_segment(
        &self,
        message_id: &str,
        groups: &[String],
    ) -> Result<Arc<SegmentData>, NntpError> {
        let id = format_message_id(message_id);
        self.cache
            .get_or_fetch(&id, self.fetch_uncached(&id, groups))
            .await
    }
}

async fn fetch_from(
    pool: &ConnectionPool,
    message_id: &str,
    groups: &[String],
) -> Result<SegmentData, NntpError> {
    let mut conn = match groups.first() {
        Some(group) => match pool.acquire_for_group(group).await {
            Ok(conn) => conn,
            Err(e @ NntpError::Command { .. }) => {
                trace!(provider = %pool.id(), %group, "group unavailable, fetching by message-id: {}", e);
                pool.acquire().await?
            }
            Err(e) => return Err(e),
        },
        None => pool.acquire().await?,
    };

    let result = read_segment(conn.connection()?, message_id).await;
    match &result {
        Ok(_) => conn.release(),
        Err(e) if e.kind() == ErrorKind::NoSuchArticle => conn.release(),
        Err(_) => conn.destroy(),
    }
    result
}

async fn read_segment(conn: &mut Connection, message_id: &str) -> Result<SegmentData, NntpError> {
    let (_, body) = conn.body(message_id).await?;
    let mut decoder = YencDecoder::new(body);
    let segment = decoder.read_segment().await?;
    // anything after =yend still has to leave the wire
    decoder.get_mut().close().await?;
    Ok(segment)
}

/// Owns the current provider generation, the shared segment cache and the
/// administrative provider locks.
pub struct Manager {
    providers: RwLock<Arc<ProviderSet>>,
    cache: SegmentCache,
    locked: Mutex<HashSet<String>>,
    retired: Arc<Mutex<Vec<Arc<ProviderSet>>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    grace: Duration,
}

impl Manager {
    pub fn new(cache_config: &SegmentCacheConfig) -> Self {
        let cache = SegmentCache::new(cache_config);
        Self {
            providers: RwLock::new(Arc::new(ProviderSet::empty(cache.clone()))),
            cache,
            locked: Mutex::new(HashSet::new()),
            retired: Arc::new(Mutex::new(Vec::new())),
            timers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            grace: RETIRE_GRACE,
        }
    }

    pub async fn from_config(config: &UsenetConfig) -> Self {
        let manager = Self::new(&config.segment_cache);
        manager.rebuild(&config.providers).await;
        manager
    }

    /// Overrides how long a replaced provider set stays open.
    pub fn with_retire_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn cache(&self) -> &SegmentCache {
        &self.cache
    }

    /// The current generation. Callers holding it keep it alive across a
    /// rebuild.
    pub fn providers(&self) -> Arc<ProviderSet> {
        self.providers.read().clone()
    }

    /// Replaces the whole provider set. The previous set is closed once the
    /// grace period ends.
    pub async fn rebuild(&self, configs: &[ProviderConfig]) {
        if configs.is_empty() {
            warn!("no servers configured, creating empty pool");
        }
        let set = Arc::new(ProviderSet::new(configs, self.cache.clone()).await);
        let count = set.len();
        let old = std::mem::replace(&mut *self.providers.write(), set);
        self.locked.lock().clear();
        info!("pool rebuilt with {} provider(s)", count);
        self.retire(old);
    }

    fn retire(&self, set: Arc<ProviderSet>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.retired.lock().push(set.clone());
        let retired = self.retired.clone();
        let grace = self.grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            debug!("closing old pool");
            set.close().await;
            retired.lock().retain(|s| !Arc::ptr_eq(s, &set));
        });
        let mut timers = self.timers.lock();
        timers.retain(|t| !t.is_finished());
        timers.push(handle);
    }

    pub async fn add_provider(&self, config: &ProviderConfig) -> Result<(), ManagerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::Closed);
        }
        self.providers().add_provider(config).await
    }

    pub async fn remove_provider(&self, id: &str) {
        self.providers().remove_provider(id).await;
        self.unlock_provider(id);
    }

    pub async fn update_provider(
        &self,
        old_id: &str,
        config: &ProviderConfig,
    ) -> Result<(), ManagerError> {
        self.remove_provider(old_id).await;
        self.add_provider(config).await
    }

    /// Marks a provider as being edited. Fails if it is already locked or
    /// has connections checked out.
    pub fn lock_provider(&self, id: &str) -> Result<(), ManagerError> {
        let mut locked = self.locked.lock();
        if locked.contains(id) || self.providers().acquired_count(id) > 0 {
            return Err(ManagerError::ProviderLocked);
        }
        locked.insert(id.to_string());
        debug!(provider = %id, "server locked");
        Ok(())
    }

    pub fn unlock_provider(&self, id: &str) {
        if self.locked.lock().remove(id) {
            debug!(provider = %id, "server unlocked");
        }
    }

    pub fn is_provider_locked(&self, id: &str) -> bool {
        self.locked.lock().contains(id)
    }

    pub fn is_provider_in_use(&self, id: &str) -> bool {
        self.is_provider_locked(id) || self.providers().acquired_count(id) > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Replaced provider sets still waiting out their grace period.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Cancels pending grace timers and closes every provider set.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for timer in std::mem::take(&mut *self.timers.lock()) {
            timer.abort();
        }
        let retired = std::mem::take(&mut *self.retired.lock());
        join_all(retired.iter().map(|set| set.close())).await;
        self.providers().close().await;
        info!("NNTP pool manager closed");
    }
}

#[async_trait]
impl SegmentFetcher for Manager {
    async fn fetch_segment(
        &self,
        message_id: &str,
        groups: &[String],
    ) -> Result<Arc<SegmentData>, NntpError> {
        if self.is_closed() {
            return Err(NntpError::PoolClosed);
        }
        self.providers().fetch_segment(message_id, groups).await
    }
}
