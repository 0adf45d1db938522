//! Async content store over an [`LruCache`]
//!
//! This is a wrapper around the synchronous cache that provides async
//! compatibility for callers that hold data as [`Bytes`].

use super::hash::ContentHash;
use super::lru::LruCache;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Content-addressed blob storage
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data`, returning its content hash
    ///
    /// Storing is best-effort: the hash is returned even if the store had no
    /// room for the data.
    async fn put(&self, data: Bytes) -> Result<ContentHash>;

    async fn get(&self, hash: &ContentHash) -> Result<Option<Bytes>>;

    async fn contains(&self, hash: &ContentHash) -> Result<bool>;
}

/// [`ContentStore`] backed by a shared cache
#[derive(Debug, Clone)]
pub struct CacheStore {
    cache: Arc<LruCache>,
}

impl CacheStore {
    pub fn new(cache: Arc<LruCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<LruCache> {
        &self.cache
    }
}

#[async_trait]
impl ContentStore for CacheStore {
    async fn put(&self, data: Bytes) -> Result<ContentHash> {
        let hash = ContentHash::compute(&data);
        if !self.cache.add(&hash, &data) {
            debug!(%hash, len = data.len(), "Object not stored");
        }
        Ok(hash)
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<Bytes>> {
        // Copy out: the returned buffer outlives the view.
        let view = self.cache.lock_view();
        Ok(view.get(hash).map(|data| Bytes::copy_from_slice(&data)))
    }

    async fn contains(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.cache.contains(hash))
    }
}
