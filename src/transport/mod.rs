mod origin;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::cache::{CacheEntry, CacheStore};
use policy::{CacheControl, Freshness};

pub use origin::{FetchError, HttpOrigin, Origin, OriginRequest, OriginResponse};

/// How a response was produced, reported to clients in `X-Cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Revalidated,
    Stale,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Revalidated => "REVALIDATED",
            CacheStatus::Stale => "STALE",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cache_status: CacheStatus,
}

impl ProxyResponse {
    fn from_entry(entry: CacheEntry, cache_status: CacheStatus) -> Self {
        Self {
            status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
            headers: policy::map_to_headers(&entry.headers),
            body: entry.body,
            cache_status,
        }
    }

    fn from_origin(response: OriginResponse, cache_status: CacheStatus) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            cache_status,
        }
    }
}

/// Fetches through a [`CacheStore`], following HTTP caching rules.
///
/// Lookups of fresh entries take no lock. Everything else that can lead to a
/// store write (revalidation, miss, replacement) runs under a lock private to
/// the cache key, so concurrent requests for one resource wait for the first
/// one and then find its result in the store.
pub struct CachingTransport {
    origin: Arc<dyn Origin>,
    store: Arc<dyn CacheStore>,
    locks: KeyLocks,
}

impl CachingTransport {
    pub fn new(origin: Arc<dyn Origin>, store: Arc<dyn CacheStore>) -> Self {
        Self {
            origin,
            store,
            locks: KeyLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Number of cache keys currently locked or waited on.
    pub fn keys_in_flight(&self) -> usize {
        self.locks.len()
    }

    pub async fn fetch(&self, request: OriginRequest) -> Result<ProxyResponse, FetchError> {
        if request.method != Method::GET {
            let response = self.origin.send(request).await?;
            return Ok(ProxyResponse::from_origin(response, CacheStatus::Bypass));
        }

        let key = policy::cache_key(&request.method, &request.url, &request.headers);
        let directives = policy::request_directives(&request.headers);

        if let Some(entry) = self.lookup(&key, &request.headers).await {
            if policy::freshness(&entry, &directives, Utc::now()) == Freshness::Fresh {
                debug!("Cache hit for {}", request.url);
                return Ok(ProxyResponse::from_entry(entry, CacheStatus::Hit));
            }
        }

        let _guard = self.locks.lock(&key).await;

        // Another request may have refreshed the entry while we waited
        match self.lookup(&key, &request.headers).await {
            Some(entry) if policy::freshness(&entry, &directives, Utc::now()) == Freshness::Fresh => {
                debug!("Cache hit for {} after wait", request.url);
                Ok(ProxyResponse::from_entry(entry, CacheStatus::Hit))
            }
            Some(entry) => self.revalidate(&key, request, &directives, entry).await,
            None => {
                debug!("Cache miss for {}", request.url);
                let request_headers = request.headers.clone();
                let response = self.origin.send(request).await?;
                self.remember(&key, &request_headers, &directives, &response)
                    .await;
                Ok(ProxyResponse::from_origin(response, CacheStatus::Miss))
            }
        }
    }

    async fn revalidate(
        &self,
        key: &str,
        request: OriginRequest,
        directives: &CacheControl,
        entry: CacheEntry,
    ) -> Result<ProxyResponse, FetchError> {
        let request_headers = request.headers.clone();
        let url = request.url.clone();
        let mut conditional = request;
        conditional
            .headers
            .extend(policy::conditional_headers(&entry));

        let response = match self.origin.send(conditional).await {
            Ok(response) => response,
            Err(err) if policy::stale_if_error(&entry, Utc::now()) => {
                warn!("Serving stale {} after revalidation failure: {}", url, err);
                return Ok(ProxyResponse::from_entry(entry, CacheStatus::Stale));
            }
            Err(err) => return Err(err),
        };

        if response.status == StatusCode::NOT_MODIFIED {
            debug!("Revalidated {}", url);
            let mut entry = entry;
            policy::merge_not_modified(
                &mut entry.headers,
                &policy::headers_to_map(&response.headers),
            );
            entry.stored_at = Utc::now();
            self.write(key, entry.clone()).await;
            return Ok(ProxyResponse::from_entry(entry, CacheStatus::Revalidated));
        }

        if matches!(response.status.as_u16(), 500 | 502 | 503 | 504)
            && policy::stale_if_error(&entry, Utc::now())
        {
            warn!(
                "Serving stale {} after origin answered {}",
                url, response.status
            );
            return Ok(ProxyResponse::from_entry(entry, CacheStatus::Stale));
        }

        if !self
            .remember(key, &request_headers, directives, &response)
            .await
        {
            if let Err(e) = self.store.delete(key).await {
                warn!("Failed to drop replaced cache entry for {}: {}", url, e);
            }
        }
        Ok(ProxyResponse::from_origin(response, CacheStatus::Miss))
    }

    async fn lookup(&self, key: &str, request_headers: &HeaderMap) -> Option<CacheEntry> {
        match self.store.get(key).await {
            Ok(Some(entry)) if policy::vary_matches(&entry, request_headers) => Some(entry),
            Ok(Some(_)) => {
                debug!("Cached variant does not match request headers");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read failed, fetching uncached: {}", e);
                None
            }
        }
    }

    // Stores the response if HTTP caching rules allow it; returns whether it did
    async fn remember(
        &self,
        key: &str,
        request_headers: &HeaderMap,
        directives: &CacheControl,
        response: &OriginResponse,
    ) -> bool {
        let headers = policy::headers_to_map(&response.headers);
        let status = response.status.as_u16();
        if !policy::is_storable(status, &headers, directives) {
            debug!("Response ({}) is not cacheable", status);
            return false;
        }

        let entry = CacheEntry {
            key: key.to_string(),
            status,
            varied: policy::vary_values(&headers, request_headers),
            headers,
            body: response.body.clone(),
            stored_at: Utc::now(),
        };
        self.write(key, entry).await
    }

    async fn write(&self, key: &str, entry: CacheEntry) -> bool {
        let size = entry.body.len();
        match self.store.set(key, entry).await {
            Ok(()) => {
                info!("Cached {} bytes", size);
                true
            }
            Err(e) => {
                warn!("Cache write failed: {}", e);
                false
            }
        }
    }
}

#[derive(Default)]
struct KeyLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock();
            sweep(&mut locks);
            locks.entry(key.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;

        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        let mut locks = self.locks.lock();
        sweep(&mut locks);
        locks.len()
    }
}

// A waiter cancelled after the holder released leaves an entry nobody references
fn sweep(locks: &mut HashMap<String, Arc<AsyncMutex<()>>>) {
    locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        // Only the registry itself still holds the mutex: nobody is waiting
        if locks
            .get(&self.key)
            .map_or(false, |mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
    }
}
