#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use imageproxy::cache::{CacheEntry, CacheStore, StoreError};
use imageproxy::transport::{FetchError, Origin, OriginRequest, OriginResponse};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;

type Handler = dyn Fn(&OriginRequest, usize) -> Result<OriginResponse, FetchError> + Send + Sync;

/// Scripted origin. The handler gets each request and its zero-based call
/// number.
pub struct MockOrigin {
    handler: Box<Handler>,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<OriginRequest>>,
}

impl MockOrigin {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&OriginRequest, usize) -> Result<OriginResponse, FetchError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with the same response.
    pub fn always(response: OriginResponse) -> Self {
        Self::new(move |_, _| Ok(response.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<OriginRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Origin for MockOrigin {
    async fn send(&self, request: OriginRequest) -> Result<OriginResponse, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(&request, call)
    }
}

pub fn response(status: u16, headers: &[(&str, &str)], body: impl Into<Bytes>) -> OriginResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    OriginResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: map,
        body: body.into(),
    }
}

pub fn image(cache_control: &str, body: impl Into<Bytes>) -> OriginResponse {
    response(
        200,
        &[("content-type", "image/png"), ("cache-control", cache_control)],
        body,
    )
}

/// Store whose every operation fails.
pub struct FailingStore;

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, _: &str) -> Result<Option<CacheEntry>, StoreError> {
        Err(StoreError::Worker("read failed".to_string()))
    }

    async fn set(&self, _: &str, _: CacheEntry) -> Result<(), StoreError> {
        Err(StoreError::Worker("write failed".to_string()))
    }

    async fn delete(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Worker("delete failed".to_string()))
    }
}
